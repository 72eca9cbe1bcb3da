// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process crash capture.
//!
//! This crate detects that the host process is about to die, either from a
//! fatal POSIX signal or from an unhandled structured exception on Windows,
//! and synchronously persists a crash report before the process terminates.
//!
//! The main pieces are:
//! - a handler chain that installs a single dispatcher for every fatal signal
//!   and remembers whatever handler was registered before it, so that control
//!   is always handed back to it once capture finishes;
//! - a capture pipeline that writes a crash marker, swaps the active transport
//!   for one that writes envelopes to disk, marks the session as crashed,
//!   builds a crash event from the faulting context and dumps whatever the old
//!   transport still had queued;
//! - a breadcrumb ring and scope snapshot file that keep enough state on disk
//!   for an out-of-process handler to enrich its own report;
//! - two backends sharing one lifecycle contract: one capturing in-process,
//!   the other delegating to an external handler executable.
//!
//! The fault path runs inside a signal handler. It never logs through
//! `tracing`, and every allocation it makes is served by the page allocator
//! from `libcrash-alloc` when the program installs
//! [`libcrash_alloc::SignalSafeAlloc`] as its global allocator.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod backend;
mod collector;
mod crash_info;
mod persistence;
mod run;
mod sdk;
mod shared;
pub mod sync;
mod transport;

pub use backend::{Backend, BackendError, BackendOps, StartupContext};
pub use collector::{
    find_slot, handle_ucontext, run_pipeline, signal_slots, BacktraceUnwinder, CaptureOutcome,
    CrashContext, PipelineMode, SignalNumber, SignalSlot, Ucontext, Unwinder,
};
#[cfg(unix)]
pub use collector::{
    handler_chain_installed, install_handler_chain, uninstall_handler_chain, HandlerChainError,
};
#[cfg(windows)]
pub use collector::{
    exception_filter_installed, install_exception_filter, uninstall_exception_filter,
};
pub use crash_info::{make_signal_event, new_event};
pub use persistence::{
    read_breadcrumbs, read_scope_snapshot, BreadcrumbRing, CrashMarker, PersistenceError,
    ScopeFile,
};
pub use run::Run;
pub use sdk::{CrashHost, Hub, Scope, ScopeMode, Session, SessionStatus};
pub use shared::configuration::{BackendKind, BackendOptions};
pub use shared::constants;
pub use transport::{
    DiskTransport, Envelope, EnvelopeError, EnvelopeItem, QueuedTransport, Transport, TransportSlot,
};
