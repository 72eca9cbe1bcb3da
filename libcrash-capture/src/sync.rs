// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Locking that stays usable while a crash is being captured.
//!
//! A signal can interrupt a thread while it holds an ordinary mutex. If the
//! handler then tries to take the same mutex it deadlocks on itself. While the
//! process-wide signal-handler flag is raised, [Mutex] therefore changes
//! behaviour: the thread running the handler skips the lock entirely, and
//! every other thread spins until the handler is done.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::PoisonError;

static IN_SIGNAL_HANDLER: AtomicBool = AtomicBool::new(false);
static SIGNAL_HANDLING_THREAD: AtomicUsize = AtomicUsize::new(0);

#[cfg(unix)]
pub(crate) fn current_thread() -> usize {
    // SAFETY: pthread_self has no preconditions and cannot fail.
    unsafe { libc::pthread_self() as usize }
}

#[cfg(windows)]
pub(crate) fn current_thread() -> usize {
    // SAFETY: GetCurrentThreadId has no preconditions and cannot fail.
    unsafe { windows_sys::Win32::System::Threading::GetCurrentThreadId() as usize }
}

/// Marks the calling thread as the one running the crash handler.
///
/// # Atomicity
///   The thread id is published before the flag, so a thread observing the
///   flag also observes the right owner.
pub fn enter_signal_handler() {
    SIGNAL_HANDLING_THREAD.store(current_thread(), SeqCst);
    IN_SIGNAL_HANDLER.store(true, SeqCst);
}

/// Clears the flag raised by [enter_signal_handler]. Threads spinning in
/// [block_for_signal_handler] resume.
pub fn leave_signal_handler() {
    IN_SIGNAL_HANDLER.store(false, SeqCst);
}

pub fn in_signal_handler() -> bool {
    IN_SIGNAL_HANDLER.load(SeqCst)
}

/// Waits for a running crash handler on another thread to finish.
///
/// Returns false when called from the thread that is running the handler, in
/// which case the caller must not take any lock. Returns true otherwise, once
/// no handler is active.
pub fn block_for_signal_handler() -> bool {
    while IN_SIGNAL_HANDLER.load(SeqCst) {
        if SIGNAL_HANDLING_THREAD.load(SeqCst) == current_thread() {
            return false;
        }
        std::hint::spin_loop();
    }
    true
}

/// A mutex that degrades to no locking for the thread running the crash
/// handler. See the module docs.
///
/// Poisoning is ignored: a panic while holding the lock leaves the data as it
/// was, which is what a crash handler wants to look at anyway.
#[derive(Default)]
pub struct Mutex<T> {
    lock: std::sync::Mutex<()>,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `lock`, except for the single
// thread that is running the crash handler while every other thread spins.
unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            lock: std::sync::Mutex::new(()),
            data: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        let inner = if block_for_signal_handler() {
            Some(self.lock.lock().unwrap_or_else(PoisonError::into_inner))
        } else {
            None
        };
        MutexGuard { mutex: self, _inner: inner }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
    _inner: Option<std::sync::MutexGuard<'a, ()>>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: see the `Sync` impl on `Mutex`.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: see the `Sync` impl on `Mutex`.
        unsafe { &mut *self.mutex.data.get() }
    }
}
