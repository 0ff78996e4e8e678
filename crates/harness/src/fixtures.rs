//! Legacy snapshots shaped like real browser-store exports.

use serde_json::{Value, json};

use reliefsync_storage::LegacySnapshot;

pub fn operation(id: &str, name: &str) -> Value {
    json!({ "id": id, "name": name, "createdAt": 1_725_000_000_000_i64 })
}

pub fn facility(id: &str, operation_id: &str, name: &str, kind: &str) -> Value {
    json!({
        "id": id,
        "operationId": operation_id,
        "name": name,
        "type": kind,
        "status": "open",
    })
}

/// One operation with three facilities.
pub fn hurricane_response() -> LegacySnapshot {
    LegacySnapshot {
        operations: vec![operation("op-1", "Hurricane Response")],
        facilities: vec![
            facility("f-1", "op-1", "Central High Shelter", "shelter"),
            facility("f-2", "op-1", "Eastside Feeding Site", "feeding"),
            facility("f-3", "op-1", "County EOC", "operations"),
        ],
        ..LegacySnapshot::default()
    }
}

/// Every record kind, cross-referenced the way the old client stored them.
pub fn full_operation() -> LegacySnapshot {
    let mut snapshot = hurricane_response();
    snapshot.facilities[0]["capacity"] = json!({ "cots": 250, "pets": true });
    snapshot.facilities[0]["personnel"] = json!(12);
    snapshot.personnel = vec![
        json!({
            "id": "p-1",
            "facilityId": "f-1",
            "name": "R. Diaz",
            "position": "Shelter Manager",
            "status": "assigned",
        }),
        json!({ "id": "p-2", "name": "K. Osei", "position": "Mass Care Chief" }),
    ];
    snapshot.iap_documents = vec![json!({
        "id": "iap-1",
        "operationId": "op-1",
        "title": "IAP Operational Period 1",
        "period": 1,
        "objectives": ["Open shelters", "Stand up feeding"],
    })];
    snapshot.work_assignments = vec![json!({
        "id": "wa-1",
        "operationId": "op-1",
        "facilityId": "f-2",
        "title": "Stand up kitchen",
        "status": "pending",
    })];
    snapshot
}
