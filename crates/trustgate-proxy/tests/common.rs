#![allow(dead_code)]

use axum::body::Bytes;
use axum::extract::{Path, RawQuery};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use ed25519_dalek::SigningKey;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use trustgate_conf::{
    AccessRight, AuthKey, ClientStatus, DescriptionType, InMemoryGlobalConf, InMemoryKeyConf,
    InMemoryServerConf, IsAuthentication, ServiceDefinition,
};
use trustgate_observe::MemorySink;
use trustgate_proxy::admission::StaticProbe;
use trustgate_proxy::config::{AntiDosConfig, Config};
use trustgate_proxy::listener::PeerInfo;
use trustgate_proxy::{consumer_app, consumer_listener, provider_app, provider_listener, AppState, Collaborators};
use trustgate_trust::{cert_hash, sign_ocsp};
use trustgate_types::{CertStatus, OcspResponse, PartyId, SecurityServerId, ServiceId};

pub fn client() -> PartyId {
    PartyId::subsystem("EE", "GOV", "2", "app")
}

pub fn provider() -> PartyId {
    PartyId::subsystem("EE", "GOV", "1", "reg")
}

pub fn consumer_server() -> SecurityServerId {
    SecurityServerId::new(PartyId::member("EE", "GOV", "2"), "cons")
}

pub fn provider_server() -> SecurityServerId {
    SecurityServerId::new(PartyId::member("EE", "GOV", "1"), "prov")
}

pub fn client_key() -> SigningKey {
    SigningKey::from_bytes(&[2u8; 32])
}

pub fn provider_key() -> SigningKey {
    SigningKey::from_bytes(&[1u8; 32])
}

pub fn service(code: &str) -> ServiceId {
    ServiceId::new(provider(), code)
}

/// Test CA, leaf issuance and a trusted OCSP responder.
pub struct Pki {
    ca: rcgen::Certificate,
    ca_key: KeyPair,
    pub responder: SigningKey,
}

impl Pki {
    pub fn new() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, "EE test CA");
        let ca = params.self_signed(&ca_key).unwrap();
        Self {
            ca,
            ca_key,
            responder: SigningKey::from_bytes(&[9u8; 32]),
        }
    }

    pub fn ca_der(&self) -> Vec<u8> {
        self.ca.der().to_vec()
    }

    pub fn issue(&self, name: &str) -> AuthKey {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![format!("{name}.example")]).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        let cert = params.signed_by(&key, &self.ca, &self.ca_key).unwrap();
        AuthKey {
            cert_chain: vec![cert.der().to_vec()],
            private_key: key.serialize_der(),
        }
    }

    pub fn status(&self, key: &AuthKey, status: CertStatus) -> OcspResponse {
        sign_ocsp(
            &self.responder,
            "EE-OCSP",
            &cert_hash(&key.cert_chain[0]),
            status,
            Utc::now(),
            None,
        )
    }

    pub fn good(&self, key: &AuthKey) -> OcspResponse {
        self.status(key, CertStatus::Good)
    }
}

#[derive(Default)]
pub struct Options {
    pub tls: bool,
    pub anti_dos: Option<AntiDosConfig>,
}

/// Two security servers, one local service and a local client, all on
/// loopback.
pub struct Federation {
    pub global: Arc<InMemoryGlobalConf>,
    pub consumer_conf: Arc<InMemoryServerConf>,
    pub provider_conf: Arc<InMemoryServerConf>,
    pub consumer_keys: Arc<InMemoryKeyConf>,
    pub provider_keys: Arc<InMemoryKeyConf>,
    pub consumer_sink: Arc<MemorySink>,
    pub provider_sink: Arc<MemorySink>,
    pub consumer: Arc<AppState>,
    pub provider: Arc<AppState>,
    pub consumer_url: String,
    pub provider_addr: SocketAddr,
    pub pki: Option<Pki>,
    pub http: reqwest::Client,
}

async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

fn config(tls: bool) -> Config {
    let mut config = Config::default();
    config.tls.enabled = tls;
    config.client.connect_timeout_ms = 2_000;
    config.client.read_timeout_ms = 10_000;
    config
}

impl Federation {
    pub async fn start(options: Options) -> Self {
        let service_base = spawn_local_service().await;
        let (provider_tcp, provider_addr) = bind().await;

        let global = Arc::new(InMemoryGlobalConf::new("EE"));
        global.add_member(client(), Some(client_key().verifying_key()));
        global.add_member(provider(), Some(provider_key().verifying_key()));
        global.add_server(consumer_server(), "127.0.0.1:1", [client()]);
        global.add_server(provider_server(), provider_addr.to_string(), [provider()]);

        let consumer_conf = Arc::new(InMemoryServerConf::new(consumer_server()));
        consumer_conf.add_client(client(), ClientStatus::Registered, IsAuthentication::NoSsl, Vec::new());
        let consumer_keys = Arc::new(InMemoryKeyConf::new());
        consumer_keys.add_signing_key(&client(), client_key());

        let provider_conf = Arc::new(InMemoryServerConf::new(provider_server()));
        provider_conf.add_client(provider(), ClientStatus::Registered, IsAuthentication::NoSsl, Vec::new());
        register_services(&provider_conf, &service_base);
        let provider_keys = Arc::new(InMemoryKeyConf::new());
        provider_keys.add_signing_key(&provider(), provider_key());

        let pki = options.tls.then(|| {
            let pki = Pki::new();
            global.add_ca_cert("EE", pki.ca_der());
            global.add_ocsp_responder("EE", pki.responder.verifying_key());
            for (server, keys) in [
                (consumer_server(), &consumer_keys),
                (provider_server(), &provider_keys),
            ] {
                let key = pki.issue(&server.server_code);
                global.add_auth_cert(&server, cert_hash(&key.cert_chain[0]));
                let ocsp = pki.good(&key);
                keys.set_auth_key(key, vec![ocsp]);
            }
            pki
        });

        let consumer_sink = Arc::new(MemorySink::new());
        let consumer = Arc::new(
            AppState::new(
                config(options.tls),
                Collaborators {
                    global: global.clone(),
                    server: consumer_conf.clone(),
                    keys: consumer_keys.clone(),
                    message_log: consumer_sink.clone(),
                    monitor: consumer_sink.clone(),
                },
                Arc::new(StaticProbe::new(None)),
            )
            .unwrap(),
        );

        let provider_sink = Arc::new(MemorySink::new());
        let mut provider_config = config(options.tls);
        if let Some(anti_dos) = options.anti_dos {
            provider_config.anti_dos = anti_dos;
        }
        let provider = Arc::new(
            AppState::new(
                provider_config,
                Collaborators {
                    global: global.clone(),
                    server: provider_conf.clone(),
                    keys: provider_keys.clone(),
                    message_log: provider_sink.clone(),
                    monitor: provider_sink.clone(),
                },
                Arc::new(StaticProbe::new(None)),
            )
            .unwrap(),
        );

        let (consumer_tcp, consumer_addr) = bind().await;
        let listener = consumer_listener(&consumer, consumer_tcp).unwrap();
        let app = consumer_app(consumer.clone());
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<PeerInfo>())
                .await
                .unwrap();
        });
        let listener = provider_listener(&provider, provider_tcp).unwrap();
        let app = provider_app(provider.clone());
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<PeerInfo>())
                .await
                .unwrap();
        });

        Self {
            global,
            consumer_conf,
            provider_conf,
            consumer_keys,
            provider_keys,
            consumer_sink,
            provider_sink,
            consumer,
            provider,
            consumer_url: format!("http://{consumer_addr}"),
            provider_addr,
            pki,
            http: reqwest::Client::new(),
        }
    }

    /// Sends a REST GET with the request target exactly as given, bypassing
    /// client-side URL normalization. Returns the status and the raw body.
    pub async fn raw_rest_get(&self, target: &str) -> (u16, String) {
        let addr = self.consumer_url.trim_start_matches("http://");
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {target} HTTP/1.1\r\nHost: {addr}\r\nX-Road-Client: EE/GOV/2/app\r\nConnection: close\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        let raw = String::from_utf8_lossy(&raw).into_owned();
        let (head, body) = raw.split_once("\r\n\r\n").unwrap();
        let status = head.split(' ').nth(1).unwrap().parse().unwrap();
        (status, body.to_string())
    }

    /// Posts an envelope to the consumer listener.
    pub async fn send_envelope(&self, service_code: &str, body: Value) -> reqwest::Response {
        self.http
            .post(&self.consumer_url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(envelope(service_code, "q-1", body).to_string())
            .send()
            .await
            .unwrap()
    }
}

pub fn envelope(service_code: &str, id: &str, body: Value) -> Value {
    json!({
        "header": {
            "client": client(),
            "service": service(service_code),
            "id": id,
        },
        "body": body,
    })
}

fn register_services(conf: &InMemoryServerConf, base: &str) {
    let envelope_service = |code: &str, path: Option<&str>, allowed: bool| {
        let mut definition = ServiceDefinition::new(
            service(code),
            DescriptionType::Envelope,
            path.map(|p| format!("{base}{p}")),
        );
        if allowed {
            definition = definition.allow(AccessRight::any(client()));
        }
        definition
    };
    conf.add_service(envelope_service("getPerson", Some("/envelope"), true));
    conf.add_service(envelope_service("tampered", Some("/tampered"), true));
    conf.add_service(envelope_service("busy", Some("/fault"), true));
    conf.add_service(envelope_service("secret", Some("/envelope"), false));
    conf.add_service(envelope_service("noAddress", None, true));
    conf.add_service(
        ServiceDefinition::new(service("people"), DescriptionType::Rest, Some(format!("{base}/api")))
            .allow(AccessRight::endpoint(client(), "*", "/people/**")),
    );
    conf.add_service(
        ServiceDefinition::new(service("drafts"), DescriptionType::Rest, None)
            .allow(AccessRight::endpoint(client(), "*", "/**")),
    );
}

/// Polls `check` until it holds; records written after the response has
/// been streamed land a little later.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

async fn echo_envelope(body: Bytes) -> Json<Value> {
    let mut doc: Value = serde_json::from_slice(&body).unwrap();
    let request = doc["body"].take();
    doc["body"] = json!({ "echo": request });
    Json(doc)
}

async fn tampered_envelope(body: Bytes) -> Json<Value> {
    let mut doc: Value = serde_json::from_slice(&body).unwrap();
    doc["header"]["id"] = json!("someone-else");
    Json(doc)
}

async fn fault_envelope() -> Json<Value> {
    Json(json!({
        "fault": {
            "faultCode": "Server.Service.Busy",
            "faultString": "try again later",
        }
    }))
}

async fn get_person(Path(id): Path<String>, RawQuery(query): RawQuery, headers: HeaderMap) -> Json<Value> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
    Json(json!({
        "id": id,
        "query": query,
        "client": header("x-road-client"),
        "requestId": header("x-road-request-id"),
    }))
}

async fn create_person(headers: HeaderMap, body: Bytes) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or(header::HeaderValue::from_static("application/octet-stream"));
    (StatusCode::CREATED, [(header::CONTENT_TYPE, content_type)], body).into_response()
}

async fn spawn_local_service() -> String {
    let app = Router::new()
        .route("/envelope", post(echo_envelope))
        .route("/tampered", post(tampered_envelope))
        .route("/fault", post(fault_envelope))
        .route("/api/people/{id}", get(get_person))
        .route("/api/people", post(create_person));
    let (listener, addr) = bind().await;
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}
