// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Number of breadcrumbs held by one breadcrumb file. Two files alternate, so
/// at most twice this many are on disk at any time.
pub const BREADCRUMBS_MAX: usize = 100;

/// Upper bound on the number of frames recorded for a crash.
///
/// This limit prevents runaway frame walking in case of stack corruption.
pub const MAX_FRAMES: usize = 128;

/// Minimum size of the alternate stack the signal dispatcher runs on.
/// Unwinding and building the event needs quite a bit of room.
pub const SIGNAL_STACK_SIZE: usize = 65536;

pub const SCOPE_FILE_NAME: &str = "__scope";
pub const BREADCRUMB_FILE_NAMES: [&str; 2] = ["__breadcrumb1", "__breadcrumb2"];
pub const CRASH_MARKER_FILE_NAME: &str = "last_crash";
pub const SETTINGS_FILE_NAME: &str = "settings.json";

pub const RUN_DIR_SUFFIX: &str = ".run";
pub const ENVELOPE_SUFFIX: &str = ".envelope";

#[cfg(windows)]
pub const DEFAULT_HANDLER_NAME: &str = "crash_handler.exe";
#[cfg(not(windows))]
pub const DEFAULT_HANDLER_NAME: &str = "crash_handler";

pub const ENV_BACKEND: &str = "LIBCRASH_BACKEND";
pub const ENV_HANDLER_PATH: &str = "LIBCRASH_HANDLER_PATH";
pub const ENV_DATABASE_PATH: &str = "LIBCRASH_DATABASE_PATH";
