//! Sinks for exchange-log and monitoring records.
//!
//! Durable storage and monitoring backends are external systems. The core
//! writes through [`MessageLog`] and [`OpMonitor`]; the implementations here
//! cover tests ([`MemorySink`]), plain structured logging ([`TracingSink`])
//! and a local append-only file ([`JsonLinesLog`]).

use crate::record::{MessageRecord, OpMonitoringData};
use crate::ObserveError;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Append-only exchange log.
pub trait MessageLog: Send + Sync {
    /// Appends one record.
    ///
    /// # Errors
    ///
    /// Returns [`ObserveError`] if the record could not be persisted.
    fn log(&self, record: &MessageRecord) -> Result<(), ObserveError>;
}

/// Operational-monitoring sink.
pub trait OpMonitor: Send + Sync {
    /// Stores monitoring data for one finished exchange.
    ///
    /// # Errors
    ///
    /// Returns [`ObserveError`] if the data could not be stored.
    fn store(&self, data: &OpMonitoringData) -> Result<(), ObserveError>;
}

/// Emits records as `tracing` events under the `trustgate::exchange` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MessageLog for TracingSink {
    fn log(&self, record: &MessageRecord) -> Result<(), ObserveError> {
        tracing::info!(
            target: "trustgate::exchange",
            role = record.role.as_str(),
            response = record.response,
            query_id = %record.query_id,
            x_request_id = %record.x_request_id,
            client = %record.client,
            service = %record.service,
            signed = record.signature.is_some(),
            "message logged"
        );
        Ok(())
    }
}

impl OpMonitor for TracingSink {
    fn store(&self, data: &OpMonitoringData) -> Result<(), ObserveError> {
        let duration_ms = data
            .response_out_ts
            .map(|end| (end - data.request_in_ts).num_milliseconds())
            .unwrap_or_default();
        let client = data.client.as_ref().map(ToString::to_string);
        let service = data.service.as_ref().map(ToString::to_string);
        tracing::info!(
            target: "trustgate::monitoring",
            role = data.security_server_type.as_str(),
            client = client.as_deref(),
            service = service.as_deref(),
            message_id = data.message_id.as_deref(),
            succeeded = data.succeeded,
            fault_code = data.fault_code.as_deref(),
            request_size = data.request_size,
            response_size = data.response_size,
            duration_ms,
            "exchange finished"
        );
        Ok(())
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    messages: Mutex<Vec<MessageRecord>>,
    monitoring: Mutex<Vec<OpMonitoringData>>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the logged messages.
    pub fn messages(&self) -> Vec<MessageRecord> {
        self.messages
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Snapshot of the stored monitoring data.
    pub fn monitoring(&self) -> Vec<OpMonitoringData> {
        self.monitoring
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl MessageLog for MemorySink {
    fn log(&self, record: &MessageRecord) -> Result<(), ObserveError> {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record.clone());
        Ok(())
    }
}

impl OpMonitor for MemorySink {
    fn store(&self, data: &OpMonitoringData) -> Result<(), ObserveError> {
        self.monitoring
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(data.clone());
        Ok(())
    }
}

/// Appends message records to a file, one JSON document per line.
#[derive(Debug)]
pub struct JsonLinesLog {
    file: Mutex<File>,
}

impl JsonLinesLog {
    /// Opens (or creates) the log file in append mode.
    ///
    /// # Errors
    ///
    /// Returns [`ObserveError::Io`] if the file cannot be opened.
    pub fn open(path: &Path) -> Result<Self, ObserveError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl MessageLog for JsonLinesLog {
    fn log(&self, record: &MessageRecord) -> Result<(), ObserveError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock().unwrap_or_else(|poisoned| {
            tracing::error!("exchange log lock poisoned, recovering");
            poisoned.into_inner()
        });
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }
}
