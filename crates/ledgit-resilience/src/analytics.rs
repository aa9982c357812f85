use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::clock::{to_time_delta, Clock};
use crate::config::ConfigError;

/// Coarse failure class used for statistics and recommendations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Timeout,
    Transient,
    QuotaExceeded,
    PermissionDenied,
    NotFound,
    Fatal,
    /// A breaker opened for a backend.
    CircuitOpen,
    /// Stored bytes failed verification.
    Integrity,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Transient => "transient",
            Self::QuotaExceeded => "quota_exceeded",
            Self::PermissionDenied => "permission_denied",
            Self::NotFound => "not_found",
            Self::Fatal => "fatal",
            Self::CircuitOpen => "circuit_open",
            Self::Integrity => "integrity",
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logged failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub component: String,
    pub operation: String,
    /// `component:operation:error_class`, lowercased.
    pub error_signature: String,
    pub category: FailureCategory,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FailureStats {
    pub total_count: usize,
    pub by_category: BTreeMap<FailureCategory, usize>,
    pub by_component: BTreeMap<String, usize>,
    pub recent_trend: Trend,
}

/// A recurring failure signature.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FailurePattern {
    pub signature: String,
    pub component: String,
    pub operation: String,
    pub category: FailureCategory,
    pub occurrences: usize,
    /// Share of all retained failures carrying this signature.
    pub confidence: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub recommendation: String,
}

/// Bounds on the failure log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub max_records: usize,
    pub max_age_secs: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_records: 10_000,
            max_age_secs: 7 * 24 * 3600,
        }
    }
}

impl RetentionPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_records == 0 {
            return Err(ConfigError::invalid("retention.max_records", "must be at least 1"));
        }
        Ok(())
    }
}

/// A pattern must recur at least this often to be reported.
const MIN_PATTERN_OCCURRENCES: usize = 2;
/// Relative change between window halves that counts as a trend.
const TREND_BAND: f64 = 0.2;

/// Append-only failure log with statistics and pattern detection.
#[derive(Debug)]
pub struct FailureAnalytics {
    retention: RetentionPolicy,
    clock: Arc<dyn Clock>,
    records: Mutex<Vec<FailureRecord>>,
}

impl FailureAnalytics {
    pub fn new(retention: RetentionPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            retention,
            clock,
            records: Mutex::new(Vec::new()),
        }
    }

    /// Append a failure, then drop records past the age bound and the
    /// oldest records beyond the count bound.
    pub fn record(
        &self,
        component: &str,
        operation: &str,
        error_class: &str,
        category: FailureCategory,
    ) -> FailureRecord {
        let record = FailureRecord {
            id: Uuid::now_v7(),
            timestamp: self.clock.now(),
            component: component.to_string(),
            operation: operation.to_string(),
            error_signature: signature(component, operation, error_class),
            category,
        };
        let mut records = self.records.lock().expect("analytics lock poisoned");
        records.push(record.clone());
        self.drop_expired(&mut records);
        if records.len() > self.retention.max_records {
            let excess = records.len() - self.retention.max_records;
            records.drain(..excess);
        }
        debug!(signature = %record.error_signature, "failure recorded");
        record
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("analytics lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the retained log, oldest first.
    pub fn records(&self) -> Vec<FailureRecord> {
        self.records.lock().expect("analytics lock poisoned").clone()
    }

    /// Statistics over `[since, now]`.
    ///
    /// The trend compares the later half of the window with the earlier
    /// half: more than 20% growth is increasing, more than 20% decline is
    /// decreasing.
    pub fn stats(&self, since: DateTime<Utc>) -> FailureStats {
        let now = self.clock.now();
        let records = self.records.lock().expect("analytics lock poisoned");
        let in_window: Vec<&FailureRecord> = records
            .iter()
            .filter(|r| r.timestamp >= since && r.timestamp <= now)
            .collect();

        let mut by_category = BTreeMap::new();
        let mut by_component = BTreeMap::new();
        for r in &in_window {
            *by_category.entry(r.category).or_insert(0) += 1;
            *by_component.entry(r.component.clone()).or_insert(0) += 1;
        }

        let recent_trend = if since >= now {
            Trend::Stable
        } else {
            let mid = since + (now - since) / 2;
            let recent = in_window.iter().filter(|r| r.timestamp >= mid).count();
            let prior = in_window.len() - recent;
            classify_trend(prior, recent)
        };

        FailureStats {
            total_count: in_window.len(),
            by_category,
            by_component,
            recent_trend,
        }
    }

    /// Signatures seen at least twice whose share of all retained failures
    /// is at least `min_confidence`, most frequent first.
    pub fn detect_patterns(&self, min_confidence: f64) -> Vec<FailurePattern> {
        let mut records = self.records.lock().expect("analytics lock poisoned");
        self.drop_expired(&mut records);
        let total = records.len();
        if total == 0 {
            return Vec::new();
        }

        let mut groups: HashMap<&str, Vec<&FailureRecord>> = HashMap::new();
        for r in records.iter() {
            groups.entry(r.error_signature.as_str()).or_default().push(r);
        }

        let mut patterns: Vec<FailurePattern> = groups
            .into_iter()
            .filter(|(_, group)| group.len() >= MIN_PATTERN_OCCURRENCES)
            .filter_map(|(sig, group)| {
                let confidence = group.len() as f64 / total as f64;
                if confidence < min_confidence {
                    return None;
                }
                let first = group.first()?;
                let last = group.last()?;
                Some(FailurePattern {
                    signature: sig.to_string(),
                    component: first.component.clone(),
                    operation: first.operation.clone(),
                    category: first.category,
                    occurrences: group.len(),
                    confidence,
                    first_seen: first.timestamp,
                    last_seen: last.timestamp,
                    recommendation: recommend(first.category, &first.component, &first.operation),
                })
            })
            .collect();

        patterns.sort_by(|a, b| {
            b.occurrences
                .cmp(&a.occurrences)
                .then_with(|| a.signature.cmp(&b.signature))
        });
        patterns
    }

    fn drop_expired(&self, records: &mut Vec<FailureRecord>) {
        let max_age = to_time_delta(std::time::Duration::from_secs(self.retention.max_age_secs));
        let cutoff = self.clock.now() - max_age;
        let before = records.len();
        records.retain(|r| r.timestamp >= cutoff);
        if records.len() < before {
            debug!(dropped = before - records.len(), "expired failure records dropped");
        }
    }
}

fn signature(component: &str, operation: &str, error_class: &str) -> String {
    format!(
        "{}:{}:{}",
        component.trim().to_ascii_lowercase(),
        operation.trim().to_ascii_lowercase(),
        error_class.trim().to_ascii_lowercase()
    )
}

fn classify_trend(prior: usize, recent: usize) -> Trend {
    if prior == 0 {
        return if recent == 0 { Trend::Stable } else { Trend::Increasing };
    }
    let ratio = recent as f64 / prior as f64;
    if ratio > 1.0 + TREND_BAND {
        Trend::Increasing
    } else if ratio < 1.0 - TREND_BAND {
        Trend::Decreasing
    } else {
        Trend::Stable
    }
}

fn recommend(category: FailureCategory, component: &str, operation: &str) -> String {
    match category {
        FailureCategory::Timeout => format!(
            "{component} {operation} keeps timing out; raise the call timeout or lower concurrency"
        ),
        FailureCategory::Transient => format!(
            "{component} {operation} fails transiently; widen retry backoff or reduce batch size"
        ),
        FailureCategory::CircuitOpen => format!(
            "circuit for {component} keeps tripping; the failure threshold may be too low for observed latency"
        ),
        FailureCategory::QuotaExceeded => {
            format!("{component} is out of quota; free space or raise the quota before retrying")
        }
        FailureCategory::PermissionDenied => {
            format!("{component} rejects credentials for {operation}; check access configuration")
        }
        FailureCategory::NotFound => {
            format!("objects are missing on {component}; run `ledgit storage verify --sync`")
        }
        FailureCategory::Fatal => {
            format!("{component} reports fatal errors on {operation}; investigate the backend")
        }
        FailureCategory::Integrity => {
            format!("{component} returned corrupt data; run `ledgit storage verify --repair`")
        }
    }
}
