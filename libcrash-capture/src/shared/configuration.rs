// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use crate::shared::constants;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which crash capture backend the SDK runs with. Exactly one backend is
/// active per process; the choice is made once, before startup.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Captures crashes from inside the faulting process.
    #[default]
    Inproc,
    /// Hands crashes to an external handler executable, after flushing the
    /// session and transport state in-process.
    OutOfProcess,
}

impl std::str::FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inproc" | "in_process" => Ok(Self::Inproc),
            "out_of_process" | "outofprocess" | "handler" => Ok(Self::OutOfProcess),
            other => anyhow::bail!("Unknown crash backend {other:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendOptions {
    // Files the out-of-process handler uploads along with its report
    attachments: Vec<PathBuf>,
    backend: BackendKind,
    create_alt_stack: bool,
    database_path: PathBuf,
    // Handler executable for the out-of-process backend. When unset, a
    // `crash_handler` next to the current executable is used.
    handler_path: Option<PathBuf>,
    max_frames: usize,
    minidump_url: Option<String>,
    signal_stack_size: usize,
    system_crash_reporter_enabled: bool,
}

impl BackendOptions {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: BackendKind,
        database_path: PathBuf,
        handler_path: Option<PathBuf>,
        minidump_url: Option<String>,
        attachments: Vec<PathBuf>,
        system_crash_reporter_enabled: bool,
        create_alt_stack: bool,
        signal_stack_size: Option<usize>,
        max_frames: Option<usize>,
    ) -> anyhow::Result<Self> {
        let signal_stack_size = signal_stack_size.unwrap_or(constants::SIGNAL_STACK_SIZE);
        anyhow::ensure!(
            !create_alt_stack || signal_stack_size >= constants::SIGNAL_STACK_SIZE,
            "Alternate signal stack of {signal_stack_size} bytes is too small, need at least {}",
            constants::SIGNAL_STACK_SIZE
        );
        let max_frames = max_frames.unwrap_or(constants::MAX_FRAMES);
        anyhow::ensure!(
            (1..=constants::MAX_FRAMES).contains(&max_frames),
            "max_frames must be between 1 and {}, got {max_frames}",
            constants::MAX_FRAMES
        );
        anyhow::ensure!(
            !database_path.as_os_str().is_empty(),
            "database_path cannot be empty"
        );

        Ok(Self {
            attachments,
            backend,
            create_alt_stack,
            database_path,
            handler_path,
            max_frames,
            minidump_url,
            signal_stack_size,
            system_crash_reporter_enabled,
        })
    }

    /// Options for the given database with everything else defaulted.
    pub fn with_database(backend: BackendKind, database_path: PathBuf) -> anyhow::Result<Self> {
        Self::new(
            backend,
            database_path,
            None,
            None,
            vec![],
            true,
            true,
            None,
            None,
        )
    }

    /// Defaults overlaid with `LIBCRASH_BACKEND`, `LIBCRASH_HANDLER_PATH` and
    /// `LIBCRASH_DATABASE_PATH` from the environment. Without a database path
    /// in the environment, `.crash-db` under the working directory is used.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let backend = match lookup(constants::ENV_BACKEND) {
            Some(value) => value.parse()?,
            None => BackendKind::default(),
        };
        let database_path = lookup(constants::ENV_DATABASE_PATH)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".crash-db"));
        let mut options = Self::with_database(backend, database_path)?;
        options.handler_path = lookup(constants::ENV_HANDLER_PATH)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);
        Ok(options)
    }

    pub fn attachments(&self) -> &[PathBuf] {
        &self.attachments
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn create_alt_stack(&self) -> bool {
        self.create_alt_stack
    }

    pub fn database_path(&self) -> &PathBuf {
        &self.database_path
    }

    pub fn handler_path(&self) -> &Option<PathBuf> {
        &self.handler_path
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    pub fn minidump_url(&self) -> &Option<String> {
        &self.minidump_url
    }

    pub fn signal_stack_size(&self) -> usize {
        self.signal_stack_size
    }

    pub fn system_crash_reporter_enabled(&self) -> bool {
        self.system_crash_reporter_enabled
    }

    pub fn set_attachments(&mut self, attachments: Vec<PathBuf>) {
        self.attachments = attachments;
    }

    pub fn set_handler_path(&mut self, handler_path: Option<PathBuf>) {
        self.handler_path = handler_path;
    }

    pub fn set_minidump_url(&mut self, minidump_url: Option<String>) {
        self.minidump_url = minidump_url;
    }

    pub fn set_system_crash_reporter_enabled(&mut self, enabled: bool) {
        self.system_crash_reporter_enabled = enabled;
    }

    pub fn set_create_alt_stack(&mut self, create_alt_stack: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            !create_alt_stack || self.signal_stack_size >= constants::SIGNAL_STACK_SIZE,
            "Alternate signal stack of {} bytes is too small",
            self.signal_stack_size
        );
        self.create_alt_stack = create_alt_stack;
        Ok(())
    }

    pub fn set_max_frames(&mut self, max_frames: usize) -> anyhow::Result<()> {
        anyhow::ensure!(
            (1..=constants::MAX_FRAMES).contains(&max_frames),
            "max_frames must be between 1 and {}, got {max_frames}",
            constants::MAX_FRAMES
        );
        self.max_frames = max_frames;
        Ok(())
    }
}
