// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::persistence::{take_marker, PersistenceError};
use crate::shared::constants::{CRASH_MARKER_FILE_NAME, ENVELOPE_SUFFIX, RUN_DIR_SUFFIX};
use crate::transport::Envelope;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// The directory holding everything one run of the program persists:
/// envelopes written by the disk transport, the crash marker, the scope
/// snapshot and the breadcrumb files. Lives at `<database>/<uuid>.run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    id: Uuid,
    database_path: PathBuf,
    run_path: PathBuf,
}

impl Run {
    /// Creates a fresh run directory inside `database_path`, creating the
    /// database directory too if needed.
    pub fn new(database_path: &Path) -> Result<Self, PersistenceError> {
        let id = Uuid::new_v4();
        let run_path = database_path.join(format!("{id}{RUN_DIR_SUFFIX}"));
        fs::create_dir_all(&run_path)?;
        Ok(Self {
            id,
            database_path: database_path.to_path_buf(),
            run_path,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn run_path(&self) -> &Path {
        &self.run_path
    }

    pub fn marker_path(&self) -> PathBuf {
        self.run_path.join(CRASH_MARKER_FILE_NAME)
    }

    /// Persists `envelope` as `<run>/<envelope id>.envelope`.
    pub fn write_envelope(&self, envelope: &Envelope) -> Result<PathBuf, PersistenceError> {
        let path = self
            .run_path
            .join(format!("{}{ENVELOPE_SUFFIX}", envelope.id().simple()));
        fs::write(&path, envelope.to_bytes())?;
        Ok(path)
    }

    /// Reads back every envelope persisted in this run, in no particular
    /// order.
    pub fn envelopes(&self) -> Result<Vec<Envelope>, PersistenceError> {
        let mut envelopes = vec![];
        for entry in fs::read_dir(&self.run_path)? {
            let path = entry?.path();
            let is_envelope = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(ENVELOPE_SUFFIX));
            if is_envelope {
                envelopes.push(Envelope::from_bytes(&fs::read(&path)?)?);
            }
        }
        Ok(envelopes)
    }

    /// Removes the crash marker, returning the time of the crash it recorded
    /// if there was one.
    pub fn take_crash_marker(&self) -> Result<Option<i64>, PersistenceError> {
        take_marker(&self.marker_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_creates_run_dir() -> anyhow::Result<()> {
        let db = tempfile::tempdir()?;
        let database = db.path().join("nested").join("db");
        let run = Run::new(&database)?;
        assert!(run.run_path().is_dir());
        assert_eq!(database, run.database_path());
        assert_eq!(
            format!("{}.run", run.id()),
            run.run_path().file_name().unwrap().to_str().unwrap()
        );
        assert_ne!(run.run_path(), Run::new(&database)?.run_path());
        Ok(())
    }

    #[test]
    fn test_envelopes_roundtrip_through_run_dir() -> anyhow::Result<()> {
        let db = tempfile::tempdir()?;
        let run = Run::new(db.path())?;
        let event = crate::new_event();
        let envelope = Envelope::from_event(&event)?;
        let path = run.write_envelope(&envelope)?;
        assert_eq!(
            format!("{}.envelope", envelope.id().simple()),
            path.file_name().unwrap().to_str().unwrap()
        );
        fs::write(run.run_path().join("__scope"), b"not an envelope")?;

        let found = run.envelopes()?;
        assert_eq!(vec![envelope], found);
        assert_eq!(Some(event), found[0].event()?);
        Ok(())
    }

    #[test]
    fn test_take_crash_marker() -> anyhow::Result<()> {
        let db = tempfile::tempdir()?;
        let run = Run::new(db.path())?;
        assert_eq!(None, run.take_crash_marker()?);
        fs::write(run.marker_path(), "1700000000")?;
        assert_eq!(Some(1_700_000_000), run.take_crash_marker()?);
        assert_eq!(None, run.take_crash_marker()?);
        Ok(())
    }
}
