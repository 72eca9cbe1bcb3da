// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::collector::SignalSlot;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// An empty event carrying the fields every event starts out with: a fresh
/// id and the current time.
pub fn new_event() -> Value {
    json!({
        "event_id": Uuid::new_v4().simple().to_string(),
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        "platform": "native",
    })
}

/// Parses the `event_id` of an event built by [new_event].
pub fn event_id(event: &Value) -> Option<Uuid> {
    event
        .get("event_id")
        .and_then(Value::as_str)
        .and_then(|id| Uuid::parse_str(id).ok())
}

/// Builds the fatal event describing a fault.
///
/// `frames` holds raw instruction addresses innermost first, as produced by an
/// [crate::Unwinder]; the event lists them oldest to newest. Faults that are
/// not in the signal table are reported as `UNKNOWN_SIGNAL` with empty signal
/// metadata.
pub fn make_signal_event(slot: Option<&SignalSlot>, frames: &[usize]) -> Value {
    let mut signal_meta = Map::new();
    if let Some(slot) = slot {
        signal_meta.insert("name".to_string(), json!(slot.name));
        // Windows exception codes are reported as their i32 bit pattern.
        signal_meta.insert("number".to_string(), json!(slot.number as i32));
    }

    let frames: Vec<Value> = frames
        .iter()
        .rev()
        .map(|addr| json!({ "instruction_addr": format!("{addr:#x}") }))
        .collect();

    let exception = json!({
        "type": slot.map_or("UNKNOWN_SIGNAL", |slot| slot.name),
        "value": slot.map_or("UnknownSignal", |slot| slot.description),
        "mechanism": {
            "type": "signalhandler",
            "synthetic": true,
            "handled": false,
            "meta": { "signal": signal_meta },
        },
        "stacktrace": { "frames": frames },
    });

    let mut event = new_event();
    if let Some(object) = event.as_object_mut() {
        object.insert("level".to_string(), json!("fatal"));
        object.insert("exception".to_string(), json!({ "values": [exception] }));
    }
    event
}
