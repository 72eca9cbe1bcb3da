// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared pieces of the crash tests: how the crashing app is driven, and how
//! the tests read back what a crashed process left in its crash database.

use anyhow::Context;
use libcrash_capture::constants::{ENVELOPE_SUFFIX, RUN_DIR_SUFFIX};
use libcrash_capture::{Envelope, Session};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Exit code of the SIGSEGV handler the `chained` mode registers before the
/// crash backend starts.
pub const CHAINED_EXIT_CODE: i32 = 42;
/// Envelopes waiting in the app's transport queue when it crashes.
pub const QUEUED_ENVELOPES: usize = 2;
/// Written by the previously registered handler in `chained` mode.
pub const PREVIOUS_HANDLER_FILE: &str = "previous_handler_ran";
/// Written by the fake out-of-process handler: its arguments, as JSON.
pub const HANDLER_ARGS_FILE: &str = "handler_args.json";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    /// In-process capture, then the default disposition kills the process.
    Inproc,
    /// In-process capture, then a handler registered earlier exits cleanly.
    Chained,
    /// An external handler is launched, the in-process hook only hands off.
    OutOfProcess,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Inproc => "inproc",
            Self::Chained => "chained",
            Self::OutOfProcess => "out_of_process",
        };
        f.write_str(name)
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inproc" => Ok(Self::Inproc),
            "chained" => Ok(Self::Chained),
            "out_of_process" => Ok(Self::OutOfProcess),
            other => anyhow::bail!("Unknown mode {other:?}"),
        }
    }
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// The one run directory a crashed process created in `database`.
pub fn find_run(database: &Path) -> anyhow::Result<PathBuf> {
    let mut runs = vec![];
    for entry in std::fs::read_dir(database).context("reading the crash database")? {
        let path = entry?.path();
        let is_run = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(RUN_DIR_SUFFIX));
        if is_run && path.is_dir() {
            runs.push(path);
        }
    }
    anyhow::ensure!(runs.len() == 1, "expected exactly one run, found {runs:?}");
    Ok(runs.remove(0))
}

pub fn read_envelopes(run_path: &Path) -> anyhow::Result<Vec<Envelope>> {
    let mut envelopes = vec![];
    for entry in std::fs::read_dir(run_path)? {
        let path = entry?.path();
        if path.to_string_lossy().ends_with(ENVELOPE_SUFFIX) {
            let bytes = std::fs::read(&path)?;
            envelopes.push(
                Envelope::from_bytes(&bytes)
                    .with_context(|| format!("decoding {}", path.display()))?,
            );
        }
    }
    Ok(envelopes)
}

/// Events carrying an exception, i.e. crash events, as opposed to whatever
/// the app had queued.
pub fn crash_events(envelopes: &[Envelope]) -> anyhow::Result<Vec<Value>> {
    let mut events = vec![];
    for envelope in envelopes {
        if let Some(event) = envelope.event()? {
            if event.get("exception").is_some() {
                events.push(event);
            }
        }
    }
    Ok(events)
}

pub fn sessions(envelopes: &[Envelope]) -> anyhow::Result<Vec<Session>> {
    let mut sessions = vec![];
    for envelope in envelopes {
        sessions.extend(envelope.session()?);
    }
    Ok(sessions)
}

/// Polls until `path` exists. Returns false on timeout.
pub fn wait_for_file(path: &Path, timeout: Duration) -> bool {
    let start = Instant::now();
    while !path.exists() {
        if start.elapsed() > timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_names() {
        for mode in [Mode::Inproc, Mode::Chained, Mode::OutOfProcess] {
            assert_eq!(mode, mode.to_string().parse().unwrap());
        }
        assert!("segfault".parse::<Mode>().is_err());
    }
}
