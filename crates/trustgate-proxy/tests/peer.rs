mod common;

use axum::body::Body;
use axum::http::{header, HeaderMap};
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use common::{eventually, provider, provider_key, provider_server, Federation, Options};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use trustgate_codec::{
    encode_request_hash, DigestAlgorithm, Message, MessageKind, ProxyMessageDecoder,
    ProxyMessageEncoder, HEADER_HASH_ALGORITHM, HEADER_REQUEST_ID,
};
use trustgate_conf::Ed25519SigningCtx;
use trustgate_proxy::config::AntiDosConfig;

/// A provider that signs a response carrying the hash of some other request.
async fn rogue_provider(headers: HeaderMap, body: Body) -> Response {
    let text = |name: &str| headers.get(name).unwrap().to_str().unwrap().to_string();
    let algorithm: DigestAlgorithm = text(HEADER_HASH_ALGORITHM).parse().unwrap();
    let unit = ProxyMessageDecoder::new(
        &text(header::CONTENT_TYPE.as_str()),
        body.into_data_stream(),
        algorithm,
        MessageKind::Envelope,
    )
    .unwrap()
    .decode_all()
    .await
    .unwrap();
    let Some(Message::Envelope(request)) = unit.message().cloned() else {
        panic!("expected an envelope request");
    };
    let answer = request
        .with_request_hash(encode_request_hash(algorithm, b"some other request"))
        .unwrap();

    let (mut encoder, encoded) = ProxyMessageEncoder::new(algorithm, 16);
    tokio::spawn(async move {
        encoder.message(&Message::Envelope(answer)).await.unwrap();
        let signer = Ed25519SigningCtx::new(provider(), provider_key());
        encoder.sign(&signer).await.unwrap();
    });
    Response::builder()
        .header(header::CONTENT_TYPE, encoded.content_type)
        .header(HEADER_HASH_ALGORITHM, algorithm.as_str())
        .header(HEADER_REQUEST_ID, text(HEADER_REQUEST_ID))
        .body(Body::from_stream(encoded.stream))
        .unwrap()
}

#[tokio::test]
async fn response_for_another_request_is_inconsistent() {
    let fed = Federation::start(Options::default()).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let rogue_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, Router::new().route("/", post(rogue_provider)))
            .await
            .unwrap();
    });
    fed.global
        .add_server(provider_server(), rogue_addr.to_string(), [provider()]);

    let response = fed.send_envelope("getPerson", json!({})).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json: Value = response.json().await.unwrap();
    assert_eq!(
        json["fault"]["faultCode"],
        "Server.ClientProxy.ServiceFailed.InconsistentResponse"
    );
}

#[tokio::test]
async fn unknown_signer_is_rejected() {
    let fed = Federation::start(Options::default()).await;
    // The provider signs with a key the federation does not publish.
    fed.provider_keys
        .add_signing_key(&provider(), ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]));

    let response = fed.send_envelope("getPerson", json!({})).await;
    let json: Value = response.json().await.unwrap();
    let code = json["fault"]["faultCode"].as_str().unwrap();
    assert!(code.starts_with("Server.ClientProxy."), "{code}");
    assert!(fed.consumer_sink.messages().is_empty());
}

#[tokio::test]
async fn admission_ceiling_refuses_extra_connections() {
    let fed = Federation::start(Options {
        anti_dos: Some(AntiDosConfig {
            max_parallel_connections: 1,
            ..AntiDosConfig::default()
        }),
        ..Options::default()
    })
    .await;

    let holder = TcpStream::connect(fed.provider_addr).await.unwrap();
    eventually(|| fed.provider.admission.active() == 1).await;

    let response = fed.send_envelope("getPerson", json!({})).await;
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["fault"]["faultCode"], "Server.ClientProxy.NetworkError");

    drop(holder);
    eventually(|| fed.provider.admission.active() == 0).await;
    let response = fed.send_envelope("getPerson", json!({ "n": 1 })).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn disabled_admission_admits_everything() {
    let fed = Federation::start(Options {
        anti_dos: Some(AntiDosConfig {
            enabled: false,
            max_parallel_connections: 0,
            ..AntiDosConfig::default()
        }),
        ..Options::default()
    })
    .await;
    let response = fed.send_envelope("getPerson", json!({})).await;
    assert_eq!(response.status(), StatusCode::OK);
}
