use gw_telemetry::{metrics, new_trace_id, record_online_edge, record_points_received};

#[test]
fn trace_ids_are_unique_hex() {
    let a = new_trace_id();
    let b = new_trace_id();
    assert_eq!(a.len(), 32);
    assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    assert_ne!(a, b);
}

#[test]
fn global_counters_only_grow() {
    let before = metrics().snapshot();
    record_points_received(3);
    record_online_edge(false);
    let after = metrics().snapshot();
    assert!(after.points_received >= before.points_received + 3);
    assert!(after.offline_edges > before.offline_edges);
}

#[test]
fn snapshot_serializes_camel_case() {
    let json = serde_json::to_value(metrics().snapshot()).expect("json");
    assert!(json.get("pointsReceived").is_some());
    assert!(json.get("offlineEdges").is_some());
}
