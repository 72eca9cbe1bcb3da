// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::PersistenceError;
use crate::shared::constants::{BREADCRUMBS_MAX, BREADCRUMB_FILE_NAMES};
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

/// Two alternating files of msgpack-encoded breadcrumbs.
///
/// Each file holds at most [BREADCRUMBS_MAX] records. The first
/// [BREADCRUMBS_MAX] breadcrumbs go to the first file, the next
/// [BREADCRUMBS_MAX] to the second, then the first file is truncated and
/// refilled, and so on. At most `2 * BREADCRUMBS_MAX` records are on disk,
/// the latest [BREADCRUMBS_MAX] are always among them, and no file is ever
/// rewritten as a whole on the hot path.
#[derive(Debug)]
pub struct BreadcrumbRing {
    paths: [PathBuf; 2],
    count: usize,
}

impl BreadcrumbRing {
    pub fn new(dir: &Path) -> Self {
        Self {
            paths: BREADCRUMB_FILE_NAMES.map(|name| dir.join(name)),
            count: 0,
        }
    }

    /// Creates both files if they don't exist yet, so that readers can rely on
    /// their presence.
    pub fn touch(&self) -> Result<(), PersistenceError> {
        for path in &self.paths {
            OpenOptions::new().create(true).append(true).open(path)?;
        }
        Ok(())
    }

    pub fn paths(&self) -> &[PathBuf; 2] {
        &self.paths
    }

    /// Number of breadcrumbs added so far, including ones that failed to be
    /// written.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Appends `breadcrumb` to the current file, or truncates the file first if
    /// `breadcrumb` is the first of a new cycle. The counter advances even if
    /// encoding or writing fails.
    pub fn add(&mut self, breadcrumb: Value) -> Result<(), PersistenceError> {
        let first_of_file = self.count % BREADCRUMBS_MAX == 0;
        let path = if self.count % (2 * BREADCRUMBS_MAX) < BREADCRUMBS_MAX {
            &self.paths[0]
        } else {
            &self.paths[1]
        };
        self.count += 1;

        let mpack = rmp_serde::to_vec_named(&breadcrumb)?;
        drop(breadcrumb);
        if first_of_file {
            fs::write(path, &mpack)?;
        } else {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?
                .write_all(&mpack)?;
        }
        Ok(())
    }
}

/// Decodes every record of a breadcrumb file, in the order they were added.
pub fn read_breadcrumbs(path: &Path) -> Result<Vec<Value>, PersistenceError> {
    let bytes = fs::read(path)?;
    let mut cursor = Cursor::new(bytes.as_slice());
    let mut records = vec![];
    while (cursor.position() as usize) < bytes.len() {
        records.push(rmp_serde::from_read(&mut cursor)?);
    }
    Ok(records)
}
