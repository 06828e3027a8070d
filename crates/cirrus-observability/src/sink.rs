//! Pluggable user-log sinks
//!
//! User function output (stdout/stderr lines captured per invocation) is
//! persisted through a sink selected by type string. Sinks live in an
//! explicit registry built at startup; registering the same type twice is an
//! error rather than a panic.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::error::{ObservabilityError, Result};

/// One captured user-log line with its invocation context
#[derive(Debug, Clone, Serialize)]
pub struct UserLogRecord<'a> {
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: i64,
    pub request_id: &'a str,
    pub trigger: &'a str,
    pub runtime_id: &'a str,
    /// "stdout", "stderr", or "system"
    pub source: &'a str,
    pub user_id: &'a str,
    pub function_brn: &'a str,
    #[serde(skip)]
    pub message: &'a [u8],
}

/// Destination for user-log records
pub trait LogSink: Send + Sync {
    /// Persist one record, returning the number of message bytes written
    fn write_record(&self, record: &UserLogRecord<'_>) -> Result<usize>;
}

/// Registry of named sinks, built once at process start
pub struct SinkRegistry {
    sinks: HashMap<String, Arc<dyn LogSink>>,
}

impl SinkRegistry {
    /// Create a registry pre-populated with the built-in sinks
    pub fn with_builtins() -> Result<Self> {
        let mut registry = Self {
            sinks: HashMap::new(),
        };
        registry.register("plain", Arc::new(PlainSink))?;
        registry.register("json", Arc::new(JsonSink::stdout()))?;
        Ok(registry)
    }

    /// Register a sink under a type name
    pub fn register(&mut self, name: &str, sink: Arc<dyn LogSink>) -> Result<()> {
        if self.sinks.contains_key(name) {
            return Err(ObservabilityError::DuplicateSink(name.to_string()));
        }
        self.sinks.insert(name.to_string(), sink);
        Ok(())
    }

    /// Look up a sink by type name
    pub fn get(&self, name: &str) -> Result<Arc<dyn LogSink>> {
        self.sinks
            .get(name)
            .cloned()
            .ok_or_else(|| ObservabilityError::UnknownSink(name.to_string()))
    }
}

/// Emits records through the process tracing subscriber
pub struct PlainSink;

impl LogSink for PlainSink {
    fn write_record(&self, record: &UserLogRecord<'_>) -> Result<usize> {
        tracing::info!(
            target: "cirrus::userlog",
            request_id = record.request_id,
            runtime_id = record.runtime_id,
            source = record.source,
            function = record.function_brn,
            "{}",
            String::from_utf8_lossy(record.message).trim_end()
        );
        Ok(record.message.len())
    }
}

/// Writes one JSON object per record to an arbitrary writer
pub struct JsonSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl JsonSink {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    #[serde(flatten)]
    meta: &'a UserLogRecord<'a>,
    message: String,
}

impl LogSink for JsonSink {
    fn write_record(&self, record: &UserLogRecord<'_>) -> Result<usize> {
        let line = serde_json::to_vec(&JsonRecord {
            meta: record,
            message: String::from_utf8_lossy(record.message).into_owned(),
        })
        .map_err(|e| ObservabilityError::LoggingInit(e.to_string()))?;

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| ObservabilityError::LoggingInit("sink writer poisoned".to_string()))?;
        writer.write_all(&line)?;
        writer.write_all(b"\n")?;
        Ok(record.message.len())
    }
}
