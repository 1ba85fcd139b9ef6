//! Queue tunables, persisted as a flat document of scalars.
//!
//! Values are read leniently: a missing or unparseable entry falls back to its
//! default rather than failing the load, so a bad `config set` can never take
//! the queue down. Workers reload this document every cycle, which is what
//! lets operators adjust tunables without restarting anything.

use std::time::Duration;

use serde_json::{Map, Value};

/// The persisted configuration document: tunable name to scalar.
pub type ConfigDocument = Map<String, Value>;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_BASE: f64 = 2.0;
const DEFAULT_WORKER_IDLE_CYCLES: u32 = 5;
const DEFAULT_CLAIM_TIMEOUT_SECS: f64 = 900.0;

/// Typed view over the configuration document.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Default retry ceiling for jobs that do not set their own.
    pub max_retries: u32,
    /// Backoff is `backoff_base^attempts` seconds.
    pub backoff_base: f64,
    /// Consecutive empty polls before a worker exits.
    pub worker_idle_cycles: u32,
    /// Ceiling after which a `processing` claim with no per-job timeout is
    /// considered abandoned, in seconds.
    pub claim_timeout_secs: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
            worker_idle_cycles: DEFAULT_WORKER_IDLE_CYCLES,
            claim_timeout_secs: DEFAULT_CLAIM_TIMEOUT_SECS,
        }
    }
}

impl QueueConfig {
    /// Reads the typed tunables out of a raw document, key by key, falling
    /// back to the default for anything missing or of the wrong shape.
    pub fn from_document(doc: &ConfigDocument) -> Self {
        let defaults = Self::default();
        Self {
            max_retries: read_u32(doc, "max_retries", defaults.max_retries),
            backoff_base: read_f64(doc, "backoff_base", defaults.backoff_base),
            worker_idle_cycles: read_u32(doc, "worker_idle_cycles", defaults.worker_idle_cycles),
            claim_timeout_secs: read_f64(doc, "claim_timeout", defaults.claim_timeout_secs),
        }
    }

    /// The document persisted when none exists yet.
    pub fn default_document() -> ConfigDocument {
        let mut doc = Map::new();
        doc.insert("max_retries".into(), DEFAULT_MAX_RETRIES.into());
        doc.insert("backoff_base".into(), (DEFAULT_BACKOFF_BASE as u64).into());
        doc.insert(
            "worker_idle_cycles".into(),
            DEFAULT_WORKER_IDLE_CYCLES.into(),
        );
        doc
    }

    pub fn claim_timeout(&self) -> Duration {
        if self.claim_timeout_secs.is_finite() && self.claim_timeout_secs > 0.0 {
            Duration::from_secs_f64(self.claim_timeout_secs)
        } else {
            Duration::from_secs_f64(DEFAULT_CLAIM_TIMEOUT_SECS)
        }
    }
}

fn read_u32(doc: &ConfigDocument, key: &str, default: u32) -> u32 {
    doc.get(key)
        .and_then(Value::as_u64)
        .and_then(|value| u32::try_from(value).ok())
        .unwrap_or(default)
}

fn read_f64(doc: &ConfigDocument, key: &str, default: f64) -> f64 {
    doc.get(key).and_then(Value::as_f64).unwrap_or(default)
}

/// Parses an operator-supplied scalar the way the CLI stores it: integer if it
/// looks like one, then float, then a plain string.
pub fn parse_scalar(raw: &str) -> Value {
    if let Ok(int) = raw.parse::<i64>() {
        return int.into();
    }
    if let Ok(float) = raw.parse::<f64>() {
        if let Some(number) = serde_json::Number::from_f64(float) {
            return Value::Number(number);
        }
    }
    Value::String(raw.to_owned())
}
