//! Storage frame codec.
//!
//! ```text
//! magic "LGB1" | codec u8 | raw_len u64 BE | crc32 u32 BE | payload
//! ```
//!
//! `raw_len` is the uncompressed payload length (for manifests, the total
//! blob length). The CRC covers the magic, codec byte, `raw_len` and the
//! payload as stored, so a flipped bit anywhere is caught before
//! decompression is attempted. Decoding also refuses any `raw_len` above the
//! caller's limit, so a forged header cannot drive a huge allocation.

use crate::chunk::ChunkManifest;
use crate::config::CompressionConfig;
use crate::error::{BlobError, BlobResult};

const MAGIC: &[u8; 4] = b"LGB1";
const HEADER_LEN: usize = 4 + 1 + 8 + 4;
/// Header bytes covered by the checksum.
const CHECKED_LEN: usize = 4 + 1 + 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    Raw,
    Zstd,
    /// Payload is a JSON [`ChunkManifest`].
    Manifest,
}

impl Codec {
    fn byte(self) -> u8 {
        match self {
            Self::Raw => 0,
            Self::Zstd => 1,
            Self::Manifest => 2,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Raw),
            1 => Some(Self::Zstd),
            2 => Some(Self::Manifest),
            _ => None,
        }
    }
}

/// A decoded frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Decoded {
    Content(Vec<u8>),
    Manifest(ChunkManifest),
}

fn frame(codec: Codec, raw_len: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(MAGIC);
    out.push(codec.byte());
    out.extend_from_slice(&raw_len.to_be_bytes());
    let crc = checksum(&out[..CHECKED_LEN], payload);
    out.extend_from_slice(&crc.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn checksum(header: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header);
    hasher.update(payload);
    hasher.finalize()
}

/// Encode content, compressing only when the result is smaller than
/// `max_ratio` of the original.
pub fn encode_content(content: &[u8], config: &CompressionConfig) -> BlobResult<Vec<u8>> {
    encode_at_level(content, config, config.level)
}

pub(crate) fn encode_at_level(
    content: &[u8],
    config: &CompressionConfig,
    level: i32,
) -> BlobResult<Vec<u8>> {
    let raw_len = content.len() as u64;
    if config.enabled && content.len() >= config.min_size {
        let compressed = zstd::bulk::compress(content, level)
            .map_err(|e| BlobError::Compression(e.to_string()))?;
        if (compressed.len() as f64) < config.max_ratio * content.len() as f64 {
            return Ok(frame(Codec::Zstd, raw_len, &compressed));
        }
    }
    Ok(frame(Codec::Raw, raw_len, content))
}

pub fn encode_manifest(manifest: &ChunkManifest) -> BlobResult<Vec<u8>> {
    let json = serde_json::to_vec(manifest)?;
    Ok(frame(Codec::Manifest, manifest.size, &json))
}

/// Whether `data` starts like a frame at all.
pub fn is_frame(data: &[u8]) -> bool {
    data.len() >= HEADER_LEN && &data[..4] == MAGIC
}

fn parse_header(data: &[u8]) -> BlobResult<(Codec, u64, u32)> {
    if data.len() < HEADER_LEN {
        return Err(BlobError::CorruptFrame(format!(
            "frame too short: {} bytes",
            data.len()
        )));
    }
    if &data[..4] != MAGIC {
        return Err(BlobError::CorruptFrame("bad frame magic".into()));
    }
    let codec = Codec::from_byte(data[4])
        .ok_or_else(|| BlobError::CorruptFrame(format!("unknown codec byte {}", data[4])))?;
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&data[5..13]);
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&data[13..17]);
    Ok((codec, u64::from_be_bytes(len_bytes), u32::from_be_bytes(crc_bytes)))
}

/// Decode and check a frame whose content may be at most `max_len` bytes.
pub fn decode(data: &[u8], max_len: u64) -> BlobResult<Decoded> {
    let (codec, raw_len, crc) = parse_header(data)?;
    let payload = &data[HEADER_LEN..];
    if checksum(&data[..CHECKED_LEN], payload) != crc {
        return Err(BlobError::CorruptFrame("frame checksum mismatch".into()));
    }
    if raw_len > max_len {
        return Err(BlobError::CorruptFrame(format!(
            "declared length {raw_len} exceeds limit {max_len}"
        )));
    }
    match codec {
        Codec::Raw => {
            if payload.len() as u64 != raw_len {
                return Err(BlobError::CorruptFrame("raw length mismatch".into()));
            }
            Ok(Decoded::Content(payload.to_vec()))
        }
        Codec::Zstd => {
            let declared = zstd::zstd_safe::get_frame_content_size(payload)
                .map_err(|_| BlobError::CorruptFrame("zstd: unreadable frame header".into()))?;
            if declared != Some(raw_len) {
                return Err(BlobError::CorruptFrame(format!(
                    "zstd content size {declared:?} disagrees with header {raw_len}"
                )));
            }
            let capacity = usize::try_from(raw_len)
                .map_err(|_| BlobError::CorruptFrame("declared length overflows usize".into()))?;
            let content = zstd::bulk::decompress(payload, capacity)
                .map_err(|e| BlobError::CorruptFrame(format!("zstd: {e}")))?;
            if content.len() as u64 != raw_len {
                return Err(BlobError::CorruptFrame("decompressed length mismatch".into()));
            }
            Ok(Decoded::Content(content))
        }
        Codec::Manifest => {
            let manifest: ChunkManifest = serde_json::from_slice(payload)
                .map_err(|e| BlobError::CorruptFrame(format!("manifest: {e}")))?;
            let total = manifest
                .chunks
                .iter()
                .try_fold(0u64, |acc, c| acc.checked_add(c.size));
            if manifest.size != raw_len || total != Some(manifest.size) {
                return Err(BlobError::CorruptFrame("manifest size mismatch".into()));
            }
            Ok(Decoded::Manifest(manifest))
        }
    }
}

/// Decode a frame that must hold plain content (chunks, small blobs).
pub fn decode_content(data: &[u8], max_len: u64) -> BlobResult<Vec<u8>> {
    match decode(data, max_len)? {
        Decoded::Content(content) => Ok(content),
        Decoded::Manifest(_) => Err(BlobError::CorruptFrame(
            "expected content frame, found manifest".into(),
        )),
    }
}
