use api_contract::{DevicePointsRequest, HealthDto};
use serde_json::json;

#[test]
fn device_points_request_accepts_optional_values() {
    let payload = r#"{"deviceSn":"m-1","points":[{"pointName":"onOff","value":1},{"pointName":"temp"}]}"#;
    let req: DevicePointsRequest = serde_json::from_str(payload).expect("parse");
    assert_eq!(req.device_sn, "m-1");
    assert_eq!(req.points[0].value, Some(json!(1)));
    assert_eq!(req.points[1].value, None);
}

#[test]
fn device_points_request_accepts_id_alias() {
    let req: DevicePointsRequest =
        serde_json::from_str(r#"{"id":"m-2","points":[]}"#).expect("parse");
    assert_eq!(req.device_sn, "m-2");
}

#[test]
fn health_is_camel_case() {
    let value = serde_json::to_value(HealthDto {
        status: "ok".to_string(),
        connectors: 1,
        devices: 2,
        online: 1,
    })
    .expect("serialize");
    assert_eq!(value["connectors"], json!(1));
    assert!(value.get("online").is_some());
}
