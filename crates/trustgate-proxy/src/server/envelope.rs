//! Provider-side processing of envelope requests.

use super::handlers::ServiceResponse;
use super::{Incoming, ProviderExchange};
use crate::processor::MessageProcessor;
use crate::AppState;
use async_trait::async_trait;
use axum::response::Response;
use std::sync::Arc;
use trustgate_codec::{encode_request_hash, Message};
use trustgate_observe::{MessageProtocol, OpMonitoringData};
use trustgate_types::{CodedError, ErrorCode};

pub struct EnvelopeProvider {
    exchange: ProviderExchange,
    succeeded: bool,
}

impl EnvelopeProvider {
    pub(crate) fn new(state: Arc<AppState>, incoming: Incoming) -> Self {
        let mut exchange = ProviderExchange::new(state, incoming);
        exchange.monitoring.protocol = Some(MessageProtocol::Envelope);
        Self {
            exchange,
            succeeded: false,
        }
    }
}

#[async_trait]
impl MessageProcessor for EnvelopeProvider {
    async fn process(&mut self) -> Result<Response, CodedError> {
        let handled = self.exchange.handle(None, None).await?;
        let ServiceResponse::Envelope { envelope, attachment } = handled.response else {
            return Err(CodedError::new(
                ErrorCode::InvalidMessage,
                format!("Handler {} answered an envelope request with a REST response", handled.handler.name()),
            ));
        };
        let request_hash = encode_request_hash(self.exchange.algorithm, &handled.request_hash);
        let response = envelope.with_request_hash(request_hash)?;

        self.succeeded = true;
        Ok(self
            .exchange
            .respond(Message::Envelope(response), attachment, true))
    }

    fn verify_exchange_succeeded(&self) -> bool {
        self.succeeded
    }

    fn monitoring(&mut self) -> &mut OpMonitoringData {
        &mut self.exchange.monitoring
    }
}
