//! Exchange logging and operational monitoring for trustgate.
//!
//! Every exchange produces two kinds of records:
//!
//! | Record | Sink | Content |
//! |--------|------|---------|
//! | [`MessageRecord`] | [`MessageLog`] | signed request and response messages |
//! | [`OpMonitoringData`] | [`OpMonitor`] | timings, sizes, outcome and fault code |
//!
//! Sink failures are reported to the caller. A message log that cannot be
//! written fails the exchange; a monitoring failure is only logged.

mod error;
mod record;
mod sink;

pub use error::ObserveError;
pub use record::{MessageProtocol, MessageRecord, OpMonitoringData, ProxyRole};
pub use sink::{JsonLinesLog, MemorySink, MessageLog, OpMonitor, TracingSink};

#[cfg(test)]
mod tests;
