//! The interface shared by the four message processors.
//!
//! Each inbound request gets exactly one processor, picked once from the
//! message-type discriminator: consumer envelope, consumer REST, provider
//! envelope or provider REST.

use crate::AppState;
use async_trait::async_trait;
use axum::response::Response;
use trustgate_observe::{MessageRecord, OpMonitoringData};
use trustgate_types::{CodedError, ErrorCode};

#[async_trait]
pub trait MessageProcessor: Send {
    /// Runs the exchange and produces the answer for the requester.
    ///
    /// On success the processor has taken care of its monitoring record; on
    /// failure the dispatcher adds the fault to [`monitoring`] and stores it.
    ///
    /// [`monitoring`]: MessageProcessor::monitoring
    async fn process(&mut self) -> Result<Response, CodedError>;

    /// Whether a response was obtained without a fault (REST: with a status
    /// below 400).
    fn verify_exchange_succeeded(&self) -> bool;

    /// The monitoring record of this exchange.
    fn monitoring(&mut self) -> &mut OpMonitoringData;
}

impl AppState {
    /// Appends a record to the exchange log. A log that cannot be written
    /// fails the exchange.
    pub(crate) fn log_message(&self, record: &MessageRecord) -> Result<(), CodedError> {
        self.message_log
            .log(record)
            .map_err(|e| CodedError::new(ErrorCode::InternalError, e.to_string()))
    }

    /// Stores a monitoring record; failures are logged and otherwise ignored.
    pub(crate) fn store_monitoring(&self, data: &OpMonitoringData) {
        if let Err(e) = self.monitor.store(data) {
            tracing::error!(error = %e, "failed to store operational monitoring data");
        }
    }
}
