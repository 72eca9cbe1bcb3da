// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::crash_info::event_id;
use crate::sdk::Session;
use serde_json::{json, Map, Value};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Invalid JSON in envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Envelope header is not an object")]
    InvalidHeader,
    #[error("Envelope item header has no type")]
    MissingItemType,
    #[error("Envelope is truncated")]
    Truncated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeItem {
    item_type: String,
    payload: Vec<u8>,
}

impl EnvelopeItem {
    pub fn new(item_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            item_type: item_type.into(),
            payload,
        }
    }

    pub fn item_type(&self) -> &str {
        &self.item_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// A batch of items sent together: a JSON header line, then for every item a
/// JSON item header line carrying its `type` and `length`, followed by the
/// payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    id: Uuid,
    headers: Map<String, Value>,
    items: Vec<EnvelopeItem>,
}

impl Envelope {
    pub fn from_event(event: &Value) -> Result<Self, EnvelopeError> {
        let id = event_id(event).unwrap_or_else(Uuid::new_v4);
        let mut headers = Map::new();
        headers.insert("event_id".to_string(), json!(id.simple().to_string()));
        Ok(Self {
            id,
            headers,
            items: vec![EnvelopeItem::new("event", serde_json::to_vec(event)?)],
        })
    }

    pub fn from_session(session: &Session) -> Result<Self, EnvelopeError> {
        Ok(Self {
            id: Uuid::new_v4(),
            headers: Map::new(),
            items: vec![EnvelopeItem::new("session", serde_json::to_vec(session)?)],
        })
    }

    /// Identifies the envelope on disk. The event id for event envelopes.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn headers(&self) -> &Map<String, Value> {
        &self.headers
    }

    pub fn items(&self) -> &[EnvelopeItem] {
        &self.items
    }

    fn item_json<T: serde::de::DeserializeOwned>(
        &self,
        item_type: &str,
    ) -> Result<Option<T>, EnvelopeError> {
        self.items
            .iter()
            .find(|item| item.item_type == item_type)
            .map(|item| serde_json::from_slice(&item.payload))
            .transpose()
            .map_err(EnvelopeError::from)
    }

    pub fn event(&self) -> Result<Option<Value>, EnvelopeError> {
        self.item_json("event")
    }

    pub fn session(&self) -> Result<Option<Session>, EnvelopeError> {
        self.item_json("session")
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = serde_json::to_vec(&self.headers).unwrap_or_else(|_| b"{}".to_vec());
        out.push(b'\n');
        for item in &self.items {
            let header = json!({ "type": item.item_type, "length": item.payload.len() });
            out.extend_from_slice(header.to_string().as_bytes());
            out.push(b'\n');
            out.extend_from_slice(&item.payload);
            out.push(b'\n');
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let mut rest = bytes;
        let header_line = next_line(&mut rest).ok_or(EnvelopeError::Truncated)?;
        let headers = match serde_json::from_slice(header_line)? {
            Value::Object(headers) => headers,
            _ => return Err(EnvelopeError::InvalidHeader),
        };
        let id = headers
            .get("event_id")
            .and_then(Value::as_str)
            .and_then(|id| Uuid::parse_str(id).ok())
            .unwrap_or_else(Uuid::new_v4);

        let mut items = vec![];
        while let Some(line) = next_line(&mut rest) {
            if line.is_empty() {
                continue;
            }
            let item_header: Value = serde_json::from_slice(line)?;
            let item_type = item_header
                .get("type")
                .and_then(Value::as_str)
                .ok_or(EnvelopeError::MissingItemType)?;
            let payload = match item_header.get("length").and_then(Value::as_u64) {
                Some(length) => {
                    let length = length as usize;
                    if rest.len() < length {
                        return Err(EnvelopeError::Truncated);
                    }
                    let (payload, tail) = rest.split_at(length);
                    rest = tail.strip_prefix(b"\n").unwrap_or(tail);
                    payload
                }
                None => next_line(&mut rest).unwrap_or_default(),
            };
            items.push(EnvelopeItem::new(item_type, payload.to_vec()));
        }
        Ok(Self { id, headers, items })
    }
}

/// Splits off the next line, without its newline. Returns `None` once
/// nothing is left.
fn next_line<'a>(rest: &mut &'a [u8]) -> Option<&'a [u8]> {
    if rest.is_empty() {
        return None;
    }
    let (line, tail) = match rest.iter().position(|b| *b == b'\n') {
        Some(pos) => (&rest[..pos], &rest[pos + 1..]),
        None => (*rest, &[][..]),
    };
    *rest = tail;
    Some(line)
}
