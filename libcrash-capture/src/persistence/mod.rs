// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! State kept on disk so that it survives the crash: the crash marker, the
//! breadcrumb ring and the scope snapshot.

mod breadcrumbs;
mod marker;
mod scope_flush;

pub use breadcrumbs::{read_breadcrumbs, BreadcrumbRing};
pub use marker::CrashMarker;
pub(crate) use marker::take_marker;
pub use scope_flush::{read_scope_snapshot, ScopeFile};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode value as msgpack: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("Failed to decode msgpack value: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("Failed to parse envelope: {0}")]
    Envelope(#[from] crate::transport::EnvelopeError),
    #[error("Path cannot be passed to the OS: {0:?}")]
    InvalidPath(PathBuf),
}
