//! Consumer-side processing of REST requests.
//!
//! Callers address a service as
//! `/r1/{instance}/{class}/{member}/{subsystem}/{service}[/path]` and name
//! themselves in the `X-Road-Client` header.

use super::{authorize_caller, check_consistency, exchange, Outbound, REST_PATH_PREFIX};
use crate::headers::{
    header_str, insert, to_fields, to_header_map, X_ROAD_CLIENT, X_ROAD_ID, X_ROAD_REQUEST_HASH,
    X_ROAD_REQUEST_ID, X_ROAD_SECURITY_SERVER,
};
use crate::listener::PeerInfo;
use crate::processor::MessageProcessor;
use crate::streams::BodyStream;
use crate::AppState;
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, StatusCode};
use axum::response::Response;
use chrono::Utc;
use futures_util::{StreamExt, TryStreamExt};
use percent_encoding::percent_decode_str;
use std::io;
use std::sync::Arc;
use trustgate_codec::{CodecError, Message, MessageKind, Parsed, RestRequest};
use trustgate_observe::{MessageProtocol, OpMonitoringData, ProxyRole};
use trustgate_types::{CodedError, ErrorCode, PartyId, SecurityServerId, ServiceId};

/// Handles one REST request from a local information system.
pub struct RestConsumer {
    state: Arc<AppState>,
    peer: PeerInfo,
    request: Option<Request>,
    monitoring: OpMonitoringData,
    response_status: Option<u16>,
}

impl RestConsumer {
    pub fn new(state: Arc<AppState>, peer: PeerInfo, request: Request) -> Self {
        let mut monitoring = OpMonitoringData::new(ProxyRole::Client);
        monitoring.protocol = Some(MessageProtocol::Rest);
        Self {
            state,
            peer,
            request: Some(request),
            monitoring,
            response_status: None,
        }
    }
}

/// Splits a request path into the addressed service and the path below it.
fn parse_path(path: &str) -> Result<(ServiceId, String), CodedError> {
    let invalid = || CodedError::new(ErrorCode::InvalidRequest, format!("Invalid REST request path: {path}"));
    let rest = path.strip_prefix(REST_PATH_PREFIX).ok_or_else(invalid)?;
    let mut segments = rest.splitn(6, '/');
    let mut next = || {
        let segment = segments.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        percent_decode_str(segment)
            .decode_utf8()
            .map(|decoded| decoded.into_owned())
            .map_err(|_| invalid())
    };
    let (instance, class, member, subsystem, code) = (next()?, next()?, next()?, next()?, next()?);
    let service_path = format!("/{}", segments.next().unwrap_or_default());

    let service = ServiceId::new(PartyId::subsystem(instance, class, member, subsystem), code);
    service
        .validate()
        .map_err(|e| CodedError::new(ErrorCode::InvalidServiceIdentifier, e.to_string()))?;
    Ok((service, service_path))
}

#[async_trait]
impl MessageProcessor for RestConsumer {
    async fn process(&mut self) -> Result<Response, CodedError> {
        let request = self.request.take().ok_or_else(|| {
            CodedError::new(ErrorCode::InternalError, "request already processed")
        })?;
        let state = self.state.clone();
        let (parts, body) = request.into_parts();

        let (service, service_path) = parse_path(parts.uri.path())?;
        self.monitoring.service = Some(service.clone());
        self.monitoring.rest_method = Some(parts.method.to_string());
        self.monitoring.rest_path = Some(service_path.clone());

        let client = header_str(&parts.headers, X_ROAD_CLIENT)
            .ok_or_else(|| CodedError::new(ErrorCode::InvalidRequest, "Missing X-Road-Client header"))?
            .parse::<PartyId>()
            .map_err(|e| CodedError::new(ErrorCode::InvalidClientIdentifier, e.to_string()))?;
        self.monitoring.client = Some(client.clone());
        let target_security_server = header_str(&parts.headers, X_ROAD_SECURITY_SERVER)
            .map(str::parse::<SecurityServerId>)
            .transpose()
            .map_err(|e| CodedError::new(ErrorCode::InvalidSecurityServer, e.to_string()))?;
        let query_id = match header_str(&parts.headers, X_ROAD_ID) {
            Some(id) => id.to_string(),
            None => format!("{}-{}", state.global.instance_identifier(), uuid::Uuid::new_v4()),
        };
        let x_request_id = uuid::Uuid::new_v4().to_string();
        self.monitoring.message_id = Some(query_id.clone());
        self.monitoring.x_request_id = Some(x_request_id.clone());

        authorize_caller(&state, &client, &self.peer)?;

        let request_message = Message::RestRequest(Parsed::new(RestRequest {
            client,
            service,
            query_id: query_id.clone(),
            x_request_id: x_request_id.clone(),
            verb: parts.method.to_string(),
            service_path,
            query: parts.uri.query().map(str::to_string),
            headers: to_fields(&parts.headers),
            target_security_server,
        })?);
        let body = BodyStream {
            content_type: header_str(&parts.headers, header::CONTENT_TYPE.as_str())
                .unwrap_or("application/octet-stream")
                .to_string(),
            stream: body.into_data_stream().map_err(io::Error::other).boxed(),
        };

        let mut inbound = exchange(
            &state,
            Outbound {
                message: request_message.clone(),
                body: Some(body),
                x_request_id: x_request_id.clone(),
            },
            &mut self.monitoring,
        )
        .await?;
        let Message::RestResponse(rest_response) = &inbound.message else {
            return Err(CodecError::MissingMessage(MessageKind::RestResponse).into());
        };
        check_consistency(
            &request_message,
            &inbound.message,
            &inbound.request_hash,
            &x_request_id,
            Some(&rest_response.x_request_id),
        )?;

        let status = StatusCode::from_u16(rest_response.status).map_err(|_| {
            CodedError::new(
                ErrorCode::InvalidMessage,
                format!("Invalid response status {}", rest_response.status),
            )
        })?;
        let mut headers = to_header_map(&rest_response.headers);
        insert(&mut headers, X_ROAD_ID, &query_id);
        insert(&mut headers, X_ROAD_REQUEST_ID, &x_request_id);
        insert(&mut headers, X_ROAD_REQUEST_HASH, &rest_response.request_hash.value);

        let mut response_size = rest_response.raw().len() as u64;
        let body = match inbound.unit.take_body() {
            Some(body) => {
                response_size += body.len();
                Body::from_stream(body.into_stream().map_err(CodecError::from)?)
            }
            None => Body::empty(),
        };
        inbound.unit.consume();

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;

        self.response_status = Some(status.as_u16());
        self.monitoring.response_status = Some(status.as_u16());
        self.monitoring.response_size = response_size;
        self.monitoring.succeeded = self.verify_exchange_succeeded();
        self.monitoring.response_out_ts = Some(Utc::now());
        state.store_monitoring(&self.monitoring);
        Ok(response)
    }

    fn verify_exchange_succeeded(&self) -> bool {
        self.response_status.is_some_and(|status| status < 400)
    }

    fn monitoring(&mut self) -> &mut OpMonitoringData {
        &mut self.monitoring
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_names_service_and_remainder() {
        let (service, path) = parse_path("/r1/EE/GOV/1/reg/getPerson/persons/5").unwrap();
        assert_eq!(service.provider, PartyId::subsystem("EE", "GOV", "1", "reg"));
        assert_eq!(service.service_code, "getPerson");
        assert_eq!(path, "/persons/5");

        let (_, path) = parse_path("/r1/EE/GOV/1/reg/getPerson").unwrap();
        assert_eq!(path, "/");
        let (_, path) = parse_path("/r1/EE/GOV/1/reg/getPerson/").unwrap();
        assert_eq!(path, "/");
    }

    #[test]
    fn short_paths_are_invalid_requests() {
        for path in ["/r1/EE/GOV/1/reg", "/r1/EE//1/reg/svc", "/r2/EE/GOV/1/reg/svc"] {
            let err = parse_path(path).unwrap_err();
            assert_eq!(err.kind(), Some(ErrorCode::InvalidRequest), "{path}");
        }
    }

    #[test]
    fn identifier_segments_are_percent_decoded() {
        let (service, path) = parse_path("/r1/EE/GOV/1%202/reg/get%20Person/people/7%20x").unwrap();
        assert_eq!(service.provider, PartyId::subsystem("EE", "GOV", "1 2", "reg"));
        assert_eq!(service.service_code, "get Person");
        assert_eq!(path, "/people/7%20x");
    }

    #[test]
    fn decoded_separators_fail_identifier_validation() {
        let err = parse_path("/r1/EE/GOV/1%2F2/reg/svc").unwrap_err();
        assert_eq!(err.kind(), Some(ErrorCode::InvalidServiceIdentifier));
        let err = parse_path("/r1/EE/GOV/1/reg/svc%ff").unwrap_err();
        assert_eq!(err.kind(), Some(ErrorCode::InvalidRequest));
    }
}
