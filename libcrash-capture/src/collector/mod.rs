// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod crash_handler;
mod exception_filter;
mod signal_handler_manager;
mod signals;
mod ucontext;
mod unwind;

pub use crash_handler::{handle_ucontext, run_pipeline, CaptureOutcome, CrashContext, PipelineMode};
pub(crate) use crash_handler::{clear_context, update_context};
#[cfg(windows)]
pub use exception_filter::{
    exception_filter_installed, install_exception_filter, uninstall_exception_filter,
};
#[cfg(unix)]
pub use signal_handler_manager::{
    handler_chain_installed, install_handler_chain, uninstall_handler_chain, HandlerChainError,
};
pub use signals::{find_slot, signal_slots, SignalNumber, SignalSlot};
pub use ucontext::Ucontext;
pub use unwind::{BacktraceUnwinder, Unwinder};
