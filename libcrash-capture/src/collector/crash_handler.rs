// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::signals::find_slot;
use super::ucontext::Ucontext;
use super::unwind::{BacktraceUnwinder, Unwinder};
use crate::crash_info::{event_id, make_signal_event};
use crate::persistence::{CrashMarker, PersistenceError};
use crate::run::Run;
use crate::sdk::{CrashHost, SessionStatus};
use crate::shared::constants::MAX_FRAMES;
use crate::transport::{Envelope, TransportSlot};
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicPtr, AtomicUsize};
use std::sync::Arc;
use uuid::Uuid;

// Note that the fault path of this file only makes use of the following
// async-signal safe functions.
// <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
// - close, open, time, write (crash marker)
// - raise, sigaction (chaining)
// Everything else it does is file I/O through std and allocation, which is
// served by the page allocator while capture runs.

/// What the pipeline does after the crashed session has been recorded.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PipelineMode {
    /// Build and persist a crash event from the faulting stack.
    Capture,
    /// An external handler produces the report. Persist everything else and
    /// hand over.
    Handoff,
}

/// Everything the fault path needs, assembled ahead of time so that nothing
/// has to be looked up or created while handling a crash.
pub struct CrashContext {
    run: Run,
    marker: CrashMarker,
    transport: Arc<TransportSlot>,
    host: Arc<dyn CrashHost>,
    max_frames: usize,
    mode: PipelineMode,
}

impl CrashContext {
    pub fn new(
        run: Run,
        transport: Arc<TransportSlot>,
        host: Arc<dyn CrashHost>,
        max_frames: usize,
        mode: PipelineMode,
    ) -> Result<Self, PersistenceError> {
        let marker = CrashMarker::new(run.marker_path())?;
        Ok(Self {
            run,
            marker,
            transport,
            host,
            max_frames: max_frames.clamp(1, MAX_FRAMES),
            mode,
        })
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn mode(&self) -> PipelineMode {
        self.mode
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }
}

/// What one pass of the pipeline managed to persist.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CaptureOutcome {
    pub marker_written: bool,
    pub session_ended: bool,
    pub event_id: Option<Uuid>,
    /// Envelopes moved from the previous transport's queue into the run.
    pub dumped: usize,
}

// Either null or `Box::into_raw()`.
static CONTEXT: AtomicPtr<CrashContext> = AtomicPtr::new(ptr::null_mut());
// Id of the thread capturing a fault, or 0. A fault raised by the pipeline
// itself is chained without being captured; a fault on another thread waits
// for the capture in progress to finish.
static CAPTURING_THREAD: AtomicUsize = AtomicUsize::new(0);

/// Makes `context` the one used by the next fault.
///
/// PRECONDITIONS:
///     None
/// SAFETY:
///     Crash-tracking functions are not guaranteed to be reentrant.
///     No other crash-handler functions should be called concurrently.
/// ATOMICITY:
///     This function uses a swap on an atomic pointer.
pub(crate) fn update_context(context: CrashContext) {
    let old = CONTEXT.swap(Box::into_raw(Box::new(context)), SeqCst);
    if !old.is_null() {
        // Safety: This can only come from a box above.
        unsafe { drop(Box::from_raw(old)) };
    }
}

/// Removes the context, so that later faults are chained without capture.
/// Same safety contract as [update_context].
pub(crate) fn clear_context() {
    let old = CONTEXT.swap(ptr::null_mut(), SeqCst);
    if !old.is_null() {
        // Safety: This can only come from a box in `update_context`.
        unsafe { drop(Box::from_raw(old)) };
    }
}

#[cfg(windows)]
pub(crate) fn current_mode() -> Option<PipelineMode> {
    // SAFETY: the context is only dropped by `update_context`/`clear_context`.
    unsafe { CONTEXT.load(SeqCst).as_ref() }.map(CrashContext::mode)
}

/// Persists everything known about the fault described by `uctx`: the crash
/// marker, the crashed session, the crash event (in [PipelineMode::Capture])
/// and whatever the previous transport still had queued. Each step is
/// attempted even if an earlier one failed.
///
/// This is the body of the fault path, without the guard, allocator and
/// chaining around it, see [handle_ucontext].
pub fn run_pipeline(
    context: &CrashContext,
    uctx: &Ucontext,
    unwinder: &dyn Unwinder,
) -> CaptureOutcome {
    let marker_written = context.marker.write();

    let previous = context.transport.enforce_disk_transport(&context.run);

    let session_ended = match context
        .host
        .end_current_session_with_status(SessionStatus::Crashed)
    {
        Some(session) => {
            if let Ok(envelope) = Envelope::from_session(&session) {
                context.transport.send_envelope(envelope);
            }
            true
        }
        None => false,
    };

    let event_id = match context.mode {
        PipelineMode::Capture => capture_event(context, uctx, unwinder),
        PipelineMode::Handoff => None,
    };

    let dumped = previous.map_or(0, |previous| {
        let dumped = previous.dump_queue(&context.run);
        // Dropping may take locks or join workers owned by the transport.
        std::mem::forget(previous);
        dumped
    });

    CaptureOutcome {
        marker_written,
        session_ended,
        event_id,
        dumped,
    }
}

fn capture_event(
    context: &CrashContext,
    uctx: &Ucontext,
    unwinder: &dyn Unwinder,
) -> Option<Uuid> {
    let mut frames = [0usize; MAX_FRAMES];
    let frames = &mut frames[..context.max_frames];
    let count = unwinder.unwind(uctx, frames).min(frames.len());

    let event = make_signal_event(find_slot(uctx.signal_number()), &frames[..count]);
    let event = context.host.prepare_event(event);
    let id = event_id(&event);
    let envelope = Envelope::from_event(&event).ok()?;
    context.transport.send_envelope(envelope);
    id
}

/// Entry point of the fault path: runs the pipeline for the installed
/// [CrashContext], then, on POSIX, restores the original handlers and hands
/// the signal to the one that was registered before us.
///
/// Without a context nothing is captured and the fault is only chained. A
/// fault raised while this thread is already capturing is chained right away.
/// A fault on any other thread spins until the capture in progress is done.
pub fn handle_ucontext(uctx: &Ucontext) {
    if acquire_capture() {
        #[cfg(unix)]
        {
            libcrash_alloc::enable_page_allocator();
            crate::sync::enter_signal_handler();
        }

        // SAFETY: the context is only dropped by `update_context` and
        // `clear_context`, which must not run concurrently with a crash.
        if let Some(context) = unsafe { CONTEXT.load(SeqCst).as_ref() } {
            run_pipeline(context, uctx, &BacktraceUnwinder);
        }

        #[cfg(unix)]
        {
            crate::sync::leave_signal_handler();
            // Pages handed out during capture stay mapped.
            libcrash_alloc::disable_page_allocator();
        }
        CAPTURING_THREAD.store(0, SeqCst);
    }

    #[cfg(unix)]
    {
        super::signal_handler_manager::reset_signal_handlers();
        // SAFETY: `uctx` is what the dispatcher, or a synchronous report,
        // handed us.
        unsafe { super::signal_handler_manager::invoke_previous_handler(uctx) };
    }
}

/// Returns true once the calling thread owns the capture, false if it
/// already did, i.e. the pipeline itself faulted.
fn acquire_capture() -> bool {
    let me = crate::sync::current_thread();
    loop {
        match CAPTURING_THREAD.compare_exchange(0, me, SeqCst, SeqCst) {
            Ok(_) => return true,
            Err(owner) if owner == me => return false,
            Err(_) => std::hint::spin_loop(),
        }
    }
}
