use super::*;
use chrono::Utc;
use trustgate_types::{CodedError, ErrorCode, PartyId, ServiceId, PREFIX_SERVER_PROXY};

fn record(response: bool) -> MessageRecord {
    MessageRecord {
        role: ProxyRole::Producer,
        response,
        query_id: "EE-1".to_string(),
        x_request_id: "abc".to_string(),
        client: PartyId::subsystem("EE", "GOV", "2", "app"),
        service: ServiceId::new(PartyId::subsystem("EE", "GOV", "1", "reg"), "people"),
        message: "{}".to_string(),
        signature: Some("{\"value\":\"x\"}".to_string()),
        created_at: Utc::now(),
    }
}

#[test]
fn memory_sink_keeps_order() {
    let sink = MemorySink::new();
    sink.log(&record(false)).unwrap();
    sink.log(&record(true)).unwrap();
    let messages = sink.messages();
    assert_eq!(messages.len(), 2);
    assert!(!messages[0].response);
    assert!(messages[1].response);
}

#[test]
fn fault_is_recorded_in_monitoring_data() {
    let sink = MemorySink::new();
    let mut data = OpMonitoringData::new(ProxyRole::Producer);
    data.succeeded = true;
    data.set_fault(
        &CodedError::new(ErrorCode::AccessDenied, "not allowed").with_prefix(PREFIX_SERVER_PROXY),
    );
    sink.store(&data).unwrap();

    let stored = sink.monitoring();
    assert!(!stored[0].succeeded);
    assert_eq!(
        stored[0].fault_code.as_deref(),
        Some("Server.ServerProxy.AccessDenied")
    );
    assert_eq!(stored[0].fault_string.as_deref(), Some("not allowed"));
}

#[test]
fn json_lines_log_appends_one_document_per_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("exchange.log");
    {
        let log = JsonLinesLog::open(&path).unwrap();
        log.log(&record(false)).unwrap();
    }
    let log = JsonLinesLog::open(&path).unwrap();
    log.log(&record(true)).unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 2);
    let second: MessageRecord = serde_json::from_str(lines[1]).unwrap();
    assert!(second.response);
    assert_eq!(second.query_id, "EE-1");
}

#[test]
fn tracing_sink_accepts_records() {
    let sink = TracingSink;
    assert!(sink.log(&record(false)).is_ok());
    let mut data = OpMonitoringData::new(ProxyRole::Client);
    data.response_out_ts = Some(Utc::now());
    assert!(sink.store(&data).is_ok());
}

#[test]
fn role_labels_are_stable() {
    assert_eq!(ProxyRole::Client.to_string(), "Client");
    assert_eq!(
        serde_json::to_value(ProxyRole::Producer).unwrap(),
        serde_json::json!("Producer")
    );
    assert_eq!(
        serde_json::to_value(MessageProtocol::Rest).unwrap(),
        serde_json::json!("REST")
    );
}
