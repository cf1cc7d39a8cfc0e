mod common;

use common::{consumer_server, Federation, Options};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;
use trustgate_trust::cert_hash;
use trustgate_types::{CertStatus, OcspResponse};

async fn tls_federation() -> Federation {
    Federation::start(Options {
        tls: true,
        ..Options::default()
    })
    .await
}

async fn fault_code(response: reqwest::Response) -> String {
    let json: Value = response.json().await.unwrap();
    json["fault"]["faultCode"].as_str().unwrap_or_default().to_string()
}

#[tokio::test]
async fn mutual_tls_exchange_verifies_both_servers() {
    let fed = tls_federation().await;
    let response = fed.send_envelope("getPerson", json!({ "personCode": "1" })).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["body"]["echo"]["personCode"], "1");

    // Each side cached the evidence the other one sent.
    assert_eq!(fed.consumer.trust.cache().len(), 1);
    assert_eq!(fed.provider.trust.cache().len(), 1);
}

#[tokio::test]
async fn rest_exchange_over_tls() {
    let fed = tls_federation().await;
    let response = fed
        .http
        .get(format!("{}/r1/EE/GOV/1/reg/people/people/3", fed.consumer_url))
        .header("X-Road-Client", "EE/GOV/2/app")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["id"], "3");
}

#[tokio::test]
async fn unregistered_authentication_certificate_is_refused() {
    let fed = tls_federation().await;
    let pki = fed.pki.as_ref().unwrap();
    let stranger = pki.issue("stranger");
    let evidence = pki.good(&stranger);
    fed.consumer_keys.set_auth_key(stranger, vec![evidence]);
    assert!(fed.consumer.tls.reload_if_changed().unwrap());

    let response = fed.send_envelope("getPerson", json!({})).await;
    assert_eq!(fault_code(response).await, "Server.ServerProxy.SslAuthFailed");
}

#[tokio::test]
async fn revoked_certificate_is_refused() {
    let fed = tls_federation().await;
    let pki = fed.pki.as_ref().unwrap();
    let current = fed.consumer.tls.current();
    let key = trustgate_conf::AuthKey {
        cert_chain: current.cert_chain.clone(),
        private_key: Vec::new(),
    };
    fed.consumer_keys
        .set_auth_ocsp_responses(vec![pki.status(&key, CertStatus::Revoked)]);

    let response = fed.send_envelope("getPerson", json!({})).await;
    assert_eq!(fault_code(response).await, "Server.ServerProxy.SslAuthFailed");
}

#[tokio::test]
async fn rotated_key_is_used_for_new_connections() {
    let fed = tls_federation().await;
    let response = fed.send_envelope("getPerson", json!({})).await;
    assert_eq!(response.status(), StatusCode::OK);

    let pki = fed.pki.as_ref().unwrap();
    let next = pki.issue("cons-2");
    let leaf = next.cert_chain[0].clone();
    fed.global.add_auth_cert(&consumer_server(), cert_hash(&leaf));
    let evidence = pki.good(&next);
    fed.consumer_keys.set_auth_key(next, vec![evidence]);

    let before = fed.consumer.tls.current();
    assert!(fed.consumer.tls.reload_if_changed().unwrap());
    let after = fed.consumer.tls.current();
    assert_eq!(after.generation, before.generation + 1);
    assert_eq!(after.leaf(), Some(leaf.as_slice()));
    // Holders of the previous identity keep a complete, consistent value.
    assert_ne!(before.leaf(), after.leaf());
    assert!(before.server.is_some());

    let response = fed.send_envelope("getPerson", json!({ "round": 2 })).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(fed.provider.trust.cache().len(), 2);
}

#[tokio::test]
async fn ocsp_relay_serves_own_evidence_over_tls() {
    let fed = tls_federation().await;
    let leaf = fed.provider.tls.current().cert_chain[0].clone();
    let hash = cert_hash(&leaf);
    let relay = trustgate_proxy::tls::relay_client(Duration::from_secs(2), Duration::from_secs(5)).unwrap();

    let evidence: Vec<OcspResponse> = relay
        .get(format!("https://{}/ocsp?cert={hash}", fed.provider_addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(evidence.len(), 1);
    assert_eq!(evidence[0].cert_hash, hash);

    let other = "0".repeat(64);
    let evidence: Vec<OcspResponse> = relay
        .get(format!("https://{}/ocsp?cert={other}", fed.provider_addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(evidence.is_empty());
}

#[tokio::test]
async fn plain_http_to_tls_listener_fails() {
    let fed = tls_federation().await;
    let result = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
        .get(format!("http://{}/health", fed.provider_addr))
        .send()
        .await;
    assert!(result.is_err());
}
