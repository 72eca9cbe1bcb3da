// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::PersistenceError;
use crate::sdk::{Scope, ScopeMode};
use crate::shared::constants::SCOPE_FILE_NAME;
use serde_json::{Map, Value};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

/// Side file holding a msgpack snapshot of the scope, so that a report built
/// after the crash can be enriched with it.
#[derive(Debug, Clone)]
pub struct ScopeFile {
    path: PathBuf,
}

impl ScopeFile {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(SCOPE_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn touch(&self) -> Result<(), PersistenceError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        Ok(())
    }

    /// Replaces the snapshot with the current contents of `scope`. Breadcrumbs
    /// and modules are left out: breadcrumbs live in their own ring, and
    /// modules don't change after startup.
    pub fn flush(&self, scope: &Scope) -> Result<(), PersistenceError> {
        // Start from an empty object rather than a new event, which would
        // carry an id and timestamp that don't belong in the snapshot.
        let mut snapshot = Value::Object(Map::new());
        scope.apply_to_event(&mut snapshot, ScopeMode::NONE);
        let mpack = rmp_serde::to_vec_named(&snapshot)?;
        fs::write(&self.path, mpack)?;
        Ok(())
    }
}

pub fn read_scope_snapshot(path: &Path) -> Result<Value, PersistenceError> {
    let bytes = fs::read(path)?;
    Ok(rmp_serde::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flush_excludes_breadcrumbs_and_modules() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = ScopeFile::new(dir.path());
        file.touch()?;

        let mut scope = Scope::default();
        scope.set_tag("shard", "7");
        scope.set_user(json!({ "id": "42" }));
        scope.add_breadcrumb(json!({ "message": "clicked" }));
        scope.modules.insert("libfoo".to_string(), json!("1.0"));
        file.flush(&scope)?;

        let snapshot = read_scope_snapshot(file.path())?;
        assert_eq!(json!("7"), snapshot["tags"]["shard"]);
        assert_eq!(json!("42"), snapshot["user"]["id"]);
        assert!(snapshot.get("breadcrumbs").is_none());
        assert!(snapshot.get("modules").is_none());
        assert!(snapshot.get("event_id").is_none());
        Ok(())
    }

    #[test]
    fn test_second_flush_replaces_first() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = ScopeFile::new(dir.path());

        let mut scope = Scope::default();
        scope.set_tag("stage", "first");
        scope.set_extra("only_in_first", json!(true));
        file.flush(&scope)?;

        let mut scope = Scope::default();
        scope.set_tag("stage", "second");
        file.flush(&scope)?;

        let snapshot = read_scope_snapshot(file.path())?;
        assert_eq!(json!({ "tags": { "stage": "second" } }), snapshot);
        Ok(())
    }

    #[test]
    fn test_empty_touched_file_does_not_decode() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = ScopeFile::new(dir.path());
        file.touch()?;
        assert!(read_scope_snapshot(file.path()).is_err());
        Ok(())
    }
}
