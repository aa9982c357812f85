use ledgit_crypto::ContentHasher;
use ledgit_types::ObjectId;
use serde::{Deserialize, Serialize};

/// One chunk of a chunked blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub hash: ObjectId,
    pub size: u64,
}

/// Ordered chunk list stored under a chunked blob's hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub version: u32,
    /// Total blob length.
    pub size: u64,
    pub chunks: Vec<ChunkRef>,
}

impl ChunkManifest {
    pub const VERSION: u32 = 1;

    pub fn new(chunks: Vec<ChunkRef>) -> Self {
        Self {
            version: Self::VERSION,
            size: chunks.iter().map(|c| c.size).sum(),
            chunks,
        }
    }

    pub fn hashes(&self) -> Vec<ObjectId> {
        self.chunks.iter().map(|c| c.hash).collect()
    }
}

/// Identity of a chunk, domain-separated from blob identities.
pub fn chunk_id(data: &[u8]) -> ObjectId {
    ContentHasher::CHUNK.hash(data)
}

/// Split content into fixed-size chunks with their ids.
pub fn split(content: &[u8], chunk_size: usize) -> Vec<(ObjectId, &[u8])> {
    content
        .chunks(chunk_size.max(1))
        .map(|piece| (chunk_id(piece), piece))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_is_deterministic_and_complete() {
        let content: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let pieces = split(&content, 300);
        assert_eq!(pieces.len(), 4);
        assert_eq!(pieces[3].1.len(), 100);
        let rejoined: Vec<u8> = pieces.iter().flat_map(|(_, p)| p.iter().copied()).collect();
        assert_eq!(rejoined, content);
        assert_eq!(split(&content, 300)[0].0, pieces[0].0);
    }

    #[test]
    fn chunk_ids_differ_from_blob_ids() {
        assert_ne!(chunk_id(b"same bytes"), ledgit_store::identify(b"same bytes"));
    }

    #[test]
    fn manifest_totals_size() {
        let m = ChunkManifest::new(vec![
            ChunkRef {
                hash: chunk_id(b"a"),
                size: 10,
            },
            ChunkRef {
                hash: chunk_id(b"b"),
                size: 5,
            },
        ]);
        assert_eq!(m.size, 15);
        assert_eq!(m.hashes().len(), 2);
    }
}
