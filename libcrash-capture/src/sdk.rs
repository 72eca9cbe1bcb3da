// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The parts of the surrounding SDK that crash capture talks to: the scope,
//! the current session, and user consent.

use crate::shared::constants::BREADCRUMBS_MAX;
use crate::sync::Mutex;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Ok,
    Exited,
    Crashed,
    Abnormal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub sid: Uuid,
    pub status: SessionStatus,
    pub started: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub errors: u64,
}

impl Session {
    pub fn start() -> Self {
        Self {
            sid: Uuid::new_v4(),
            status: SessionStatus::Ok,
            started: Utc::now(),
            timestamp: None,
            errors: 0,
        }
    }
}

/// Which optional parts of the scope [Scope::apply_to_event] copies.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ScopeMode {
    pub breadcrumbs: bool,
    pub modules: bool,
}

impl ScopeMode {
    pub const NONE: Self = Self {
        breadcrumbs: false,
        modules: false,
    };
    pub const ALL: Self = Self {
        breadcrumbs: true,
        modules: true,
    };
}

/// Contextual data attached to every event.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    pub release: Option<String>,
    pub environment: Option<String>,
    pub transaction: Option<String>,
    pub level: Option<String>,
    pub user: Option<Value>,
    pub tags: Map<String, Value>,
    pub extra: Map<String, Value>,
    pub contexts: Map<String, Value>,
    pub fingerprint: Vec<String>,
    pub breadcrumbs: Vec<Value>,
    pub modules: Map<String, Value>,
}

impl Scope {
    pub fn set_tag(&mut self, key: &str, value: &str) {
        self.tags.insert(key.to_string(), Value::from(value));
    }

    pub fn set_extra(&mut self, key: &str, value: Value) {
        self.extra.insert(key.to_string(), value);
    }

    pub fn set_context(&mut self, key: &str, value: Value) {
        self.contexts.insert(key.to_string(), value);
    }

    pub fn set_user(&mut self, user: Value) {
        self.user = Some(user);
    }

    /// Keeps the latest [BREADCRUMBS_MAX] breadcrumbs.
    pub fn add_breadcrumb(&mut self, breadcrumb: Value) {
        if self.breadcrumbs.len() >= BREADCRUMBS_MAX {
            self.breadcrumbs.remove(0);
        }
        self.breadcrumbs.push(breadcrumb);
    }

    /// Merges the scope into `event`. Values already present on the event
    /// win. Does nothing if `event` is not an object.
    pub fn apply_to_event(&self, event: &mut Value, mode: ScopeMode) {
        let Some(event) = event.as_object_mut() else {
            return;
        };

        let mut set_default = |key: &str, value: Option<Value>| {
            if let Some(value) = value {
                event.entry(key).or_insert(value);
            }
        };
        set_default("release", self.release.clone().map(Value::from));
        set_default("environment", self.environment.clone().map(Value::from));
        set_default("transaction", self.transaction.clone().map(Value::from));
        set_default("level", self.level.clone().map(Value::from));
        set_default("user", self.user.clone());
        if !self.fingerprint.is_empty() {
            set_default("fingerprint", Some(Value::from(self.fingerprint.clone())));
        }

        for (key, values) in [
            ("tags", &self.tags),
            ("extra", &self.extra),
            ("contexts", &self.contexts),
        ] {
            merge_map(event, key, values);
        }

        if mode.breadcrumbs && !self.breadcrumbs.is_empty() {
            let mut values = Map::new();
            values.insert("values".to_string(), Value::from(self.breadcrumbs.clone()));
            event
                .entry("breadcrumbs")
                .or_insert(Value::Object(values));
        }
        if mode.modules && !self.modules.is_empty() {
            merge_map(event, "modules", &self.modules);
        }
    }
}

fn merge_map(event: &mut Map<String, Value>, key: &str, values: &Map<String, Value>) {
    if values.is_empty() {
        return;
    }
    let target = event
        .entry(key)
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(target) = target.as_object_mut() {
        for (k, v) in values {
            target.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
}

/// What the crash pipeline and the backends need from the SDK.
///
/// Implementations are called from inside the crash handler. They should
/// guard their state with [crate::sync::Mutex] so that a thread interrupted
/// while holding a lock cannot deadlock the handler.
pub trait CrashHost: Send + Sync {
    /// Ends the current session with `status` and returns its final state, or
    /// `None` if no session was running. Later calls return `None`.
    fn end_current_session_with_status(&self, status: SessionStatus) -> Option<Session>;

    fn current_scope(&self) -> Scope;

    /// Enriches an event before it is captured.
    fn prepare_event(&self, mut event: Value) -> Value {
        self.current_scope().apply_to_event(&mut event, ScopeMode::ALL);
        event
    }

    /// Whether reports must not be uploaded, e.g. because the user has not
    /// given consent.
    fn should_skip_upload(&self) -> bool {
        false
    }
}

/// A ready-made [CrashHost] holding one scope and at most one session.
#[derive(Default)]
pub struct Hub {
    scope: Mutex<Scope>,
    session: Mutex<Option<Session>>,
    uploads_disabled: AtomicBool,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configure_scope<R>(&self, f: impl FnOnce(&mut Scope) -> R) -> R {
        f(&mut self.scope.lock())
    }

    /// Starts a new session, replacing any running one.
    pub fn start_session(&self) -> Uuid {
        let session = Session::start();
        let sid = session.sid;
        *self.session.lock() = Some(session);
        sid
    }

    pub fn session(&self) -> Option<Session> {
        self.session.lock().clone()
    }

    pub fn set_user_consent(&self, given: bool) {
        self.uploads_disabled.store(!given, Ordering::SeqCst);
    }
}

impl CrashHost for Hub {
    fn end_current_session_with_status(&self, status: SessionStatus) -> Option<Session> {
        let mut session = self.session.lock().take()?;
        session.status = status;
        session.timestamp = Some(Utc::now());
        if status == SessionStatus::Crashed {
            session.errors += 1;
        }
        Some(session)
    }

    fn current_scope(&self) -> Scope {
        self.scope.lock().clone()
    }

    fn should_skip_upload(&self) -> bool {
        self.uploads_disabled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_apply_respects_event_values() {
        let mut scope = Scope {
            release: Some("app@1.0".to_string()),
            level: Some("info".to_string()),
            ..Default::default()
        };
        scope.set_tag("region", "eu");
        scope.set_tag("shard", "scope");
        scope.add_breadcrumb(json!({ "message": "hi" }));

        let mut event = json!({ "level": "fatal", "tags": { "shard": "event" } });
        scope.apply_to_event(&mut event, ScopeMode::ALL);
        assert_eq!("fatal", event["level"]);
        assert_eq!("app@1.0", event["release"]);
        assert_eq!(json!({ "region": "eu", "shard": "event" }), event["tags"]);
        assert_eq!(json!([{ "message": "hi" }]), event["breadcrumbs"]["values"]);

        let mut bare = json!({});
        scope.apply_to_event(&mut bare, ScopeMode::NONE);
        assert!(bare.get("breadcrumbs").is_none());

        let mut not_an_object = json!([1, 2]);
        scope.apply_to_event(&mut not_an_object, ScopeMode::ALL);
        assert_eq!(json!([1, 2]), not_an_object);
    }

    #[test]
    fn test_breadcrumbs_are_capped() {
        let mut scope = Scope::default();
        for i in 0..BREADCRUMBS_MAX + 5 {
            scope.add_breadcrumb(json!(i));
        }
        assert_eq!(BREADCRUMBS_MAX, scope.breadcrumbs.len());
        assert_eq!(json!(5), scope.breadcrumbs[0]);
    }

    #[test]
    fn test_hub_session_ends_once() {
        let hub = Hub::new();
        assert!(hub
            .end_current_session_with_status(SessionStatus::Crashed)
            .is_none());

        let sid = hub.start_session();
        let ended = hub
            .end_current_session_with_status(SessionStatus::Crashed)
            .unwrap();
        assert_eq!(sid, ended.sid);
        assert_eq!(SessionStatus::Crashed, ended.status);
        assert_eq!(1, ended.errors);
        assert!(ended.timestamp.is_some());
        assert!(hub.session().is_none());
        assert!(hub
            .end_current_session_with_status(SessionStatus::Crashed)
            .is_none());
    }

    #[test]
    fn test_hub_consent_and_prepare() {
        let hub = Hub::new();
        assert!(!hub.should_skip_upload());
        hub.set_user_consent(false);
        assert!(hub.should_skip_upload());

        hub.configure_scope(|scope| scope.set_tag("k", "v"));
        let event = hub.prepare_event(json!({ "event_id": "abc" }));
        assert_eq!("v", event["tags"]["k"]);
        assert_eq!("abc", event["event_id"]);
    }

    #[test]
    fn test_session_status_serializes_snake_case() -> anyhow::Result<()> {
        let mut session = Session::start();
        session.status = SessionStatus::Crashed;
        let value = serde_json::to_value(&session)?;
        assert_eq!("crashed", value["status"]);
        assert!(value.get("timestamp").is_none());
        Ok(())
    }
}
