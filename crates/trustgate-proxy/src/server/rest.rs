//! Provider-side processing of REST requests.

use super::handlers::ServiceResponse;
use super::{Incoming, ProviderExchange};
use crate::processor::MessageProcessor;
use crate::AppState;
use async_trait::async_trait;
use axum::response::Response;
use std::sync::Arc;
use trustgate_codec::{encode_request_hash, CodecError, Message, MessageKind, Parsed, RestResponse};
use trustgate_observe::{MessageProtocol, OpMonitoringData};
use trustgate_types::{CodedError, ErrorCode};

pub struct RestProvider {
    exchange: ProviderExchange,
    status: Option<u16>,
}

impl RestProvider {
    pub(crate) fn new(state: Arc<AppState>, incoming: Incoming) -> Self {
        let mut exchange = ProviderExchange::new(state, incoming);
        exchange.monitoring.protocol = Some(MessageProtocol::Rest);
        if let Message::RestRequest(request) = &exchange.request {
            exchange.monitoring.rest_method = Some(request.verb.clone());
            exchange.monitoring.rest_path = Some(request.service_path.clone());
        }
        Self {
            exchange,
            status: None,
        }
    }
}

#[async_trait]
impl MessageProcessor for RestProvider {
    async fn process(&mut self) -> Result<Response, CodedError> {
        let Message::RestRequest(request) = self.exchange.request.clone() else {
            return Err(CodecError::MissingMessage(MessageKind::RestRequest).into());
        };
        let handled = self
            .exchange
            .handle(Some(&request.verb), Some(&request.service_path))
            .await?;
        let ServiceResponse::Rest {
            status,
            reason,
            headers,
            body,
        } = handled.response
        else {
            return Err(CodedError::new(
                ErrorCode::InvalidMessage,
                format!("Handler {} answered a REST request with an envelope", handled.handler.name()),
            ));
        };

        let response = Parsed::new(RestResponse {
            client: request.client.clone(),
            service: request.service.clone(),
            query_id: request.query_id.clone(),
            x_request_id: request.x_request_id.clone(),
            request_hash: encode_request_hash(self.exchange.algorithm, &handled.request_hash),
            status,
            reason,
            headers,
        })?;
        self.status = Some(status);
        self.exchange.monitoring.response_status = Some(status);
        Ok(self.exchange.respond(
            Message::RestResponse(response),
            body,
            self.verify_exchange_succeeded(),
        ))
    }

    fn verify_exchange_succeeded(&self) -> bool {
        self.status.is_some_and(|status| status < 400)
    }

    fn monitoring(&mut self) -> &mut OpMonitoringData {
        &mut self.exchange.monitoring
    }
}
