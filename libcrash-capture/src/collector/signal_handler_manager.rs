// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

use super::crash_handler::handle_ucontext;
use super::signals::{signal_slots, slot_index};
use super::ucontext::Ucontext;
use crate::shared::constants::SIGNAL_STACK_SIZE;
use crate::shared::log::signal_safe_eprint;
use libc::{c_int, c_void, siginfo_t, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_NONE, PROT_READ};
use libc::{PROT_WRITE, SIGSTKSZ};
use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::SeqCst;
use thiserror::Error;
use tracing::debug;

const SIGNAL_COUNT: usize = 6;

#[derive(Debug, Error)]
pub enum HandlerChainError {
    #[error("The crash handler chain is already installed")]
    AlreadyInstalled,
    #[error("Unable to query the current handler for signal {signum}: {source}")]
    Query { signum: c_int, source: Errno },
    #[error("Unable to register the crash handler for signal {signum}: {source}")]
    Install { signum: c_int, source: Errno },
    #[error("Failed to set up the alternate signal stack: {0}")]
    AltStack(#[source] std::io::Error),
}

/// What was in place before the chain was installed. Published through
/// [CHAIN] once complete, and never mutated afterwards.
struct HandlerChain {
    previous: [libc::sigaction; SIGNAL_COUNT],
    alt_stack: Option<AltStack>,
}

// Either null or a `Box::into_raw()` of a fully initialized chain. Using
// mutexes inside a signal handler is not allowed, so the dispatcher only ever
// loads this pointer.
static CHAIN: AtomicPtr<HandlerChain> = AtomicPtr::new(ptr::null_mut());

/// Installs the crash dispatcher for every signal in the signal table,
/// remembering the handlers it replaces so that they can be chained to and
/// restored later.
///
/// PRECONDITIONS:
///     A [super::crash_handler::CrashContext] should be installed first,
///     otherwise faults are chained without being captured.
/// SAFETY:
///     Crash-tracking functions are not guaranteed to be reentrant.
///     No other crash-handler functions should be called concurrently.
/// ATOMICITY:
///     The previous handlers are all recorded and published before the first
///     dispatcher is installed, so a fault at any point during installation
///     finds a complete chain. If installing the dispatcher fails for one
///     signal, the signals already switched over are restored and an error is
///     returned.
pub fn install_handler_chain(
    create_alt_stack: bool,
    signal_stack_size: usize,
) -> Result<(), HandlerChainError> {
    if !CHAIN.load(SeqCst).is_null() {
        return Err(HandlerChainError::AlreadyInstalled);
    }

    // SAFETY: sigaction is zero-initializable.
    let mut previous: [libc::sigaction; SIGNAL_COUNT] = unsafe { std::mem::zeroed() };
    for (slot, previous) in signal_slots().iter().zip(previous.iter_mut()) {
        // SAFETY: a null `act` only queries the current disposition.
        if unsafe { libc::sigaction(slot.number, ptr::null(), previous) } != 0 {
            return Err(HandlerChainError::Query {
                signum: slot.number,
                source: Errno::last(),
            });
        }
    }

    let alt_stack = if create_alt_stack {
        // SAFETY: no preconditions.
        Some(unsafe { AltStack::create(signal_stack_size.max(SIGNAL_STACK_SIZE))? })
    } else {
        None
    };

    let chain = Box::into_raw(Box::new(HandlerChain {
        previous,
        alt_stack,
    }));
    if CHAIN
        .compare_exchange(ptr::null_mut(), chain, SeqCst, SeqCst)
        .is_err()
    {
        // SAFETY: never published.
        release_chain(unsafe { Box::from_raw(chain) });
        return Err(HandlerChainError::AlreadyInstalled);
    }

    // Without a stack of our own, threads that have a small alternate stack
    // (every thread spawned by std has one) would run the dispatcher on it.
    let flags = if create_alt_stack {
        SaFlags::SA_SIGINFO | SaFlags::SA_ONSTACK
    } else {
        SaFlags::SA_SIGINFO
    };
    let action = SigAction::new(
        SigHandler::SigAction(handle_posix_sigaction),
        flags,
        SigSet::empty(),
    );
    for (index, slot) in signal_slots().iter().enumerate() {
        let installed = Signal::try_from(slot.number)
            // SAFETY: the dispatcher only calls async-signal-safe functions
            // before chaining.
            .and_then(|sig| unsafe { signal::sigaction(sig, &action) });
        if let Err(source) = installed {
            // SAFETY: `previous` holds what each signal had before.
            unsafe { restore_previous(&previous[..index]) };
            let chain = CHAIN.swap(ptr::null_mut(), SeqCst);
            if !chain.is_null() {
                // SAFETY: published by us above.
                release_chain(unsafe { Box::from_raw(chain) });
            }
            return Err(HandlerChainError::Install {
                signum: slot.number,
                source,
            });
        }
    }
    debug!(
        alt_stack = create_alt_stack,
        "Installed crash handlers for {} signals", SIGNAL_COUNT
    );
    Ok(())
}

/// Restores the handlers that were in place before [install_handler_chain].
///
/// A signal whose handler is no longer ours was taken over by someone else
/// after startup; their handler is left in place. Returns false if the chain
/// was not installed.
pub fn uninstall_handler_chain() -> bool {
    let chain = CHAIN.swap(ptr::null_mut(), SeqCst);
    if chain.is_null() {
        return false;
    }
    // SAFETY: `CHAIN` only ever holds pointers from `Box::into_raw`, and the
    // swap made us the owner.
    let chain = unsafe { Box::from_raw(chain) };
    let ours = handle_posix_sigaction as *const () as libc::sighandler_t;
    for (slot, previous) in signal_slots().iter().zip(chain.previous.iter()) {
        let mut current = MaybeUninit::<libc::sigaction>::zeroed();
        // SAFETY: both pointers are valid for the duration of the call.
        if unsafe { libc::sigaction(slot.number, previous, current.as_mut_ptr()) } != 0 {
            debug!("Unable to restore the handler for {}", slot.name);
            continue;
        }
        // SAFETY: filled in by the successful call above.
        let current = unsafe { current.assume_init() };
        if current.sa_sigaction != ours {
            // SAFETY: puts back exactly what was installed a moment ago.
            unsafe { libc::sigaction(slot.number, &current, ptr::null_mut()) };
            debug!(
                "Handler for {} was replaced after startup, leaving it in place",
                slot.name
            );
        }
    }
    release_chain(chain);
    true
}

pub fn handler_chain_installed() -> bool {
    !CHAIN.load(SeqCst).is_null()
}

fn release_chain(chain: Box<HandlerChain>) {
    if let Some(alt_stack) = chain.alt_stack {
        alt_stack.release();
    }
}

/// SAFETY: `previous` must hold dispositions for a prefix of the signal table.
unsafe fn restore_previous(previous: &[libc::sigaction]) {
    for (slot, previous) in signal_slots().iter().zip(previous) {
        libc::sigaction(slot.number, previous, ptr::null_mut());
    }
}

/// Puts back every handler recorded at install time, without giving up
/// ownership of the chain. Called on the fault path before chaining, so that
/// whatever the previous handler does, including re-raising, is not seen by
/// the dispatcher again.
pub(crate) fn reset_signal_handlers() {
    // SAFETY: the chain is never mutated once published.
    if let Some(chain) = unsafe { CHAIN.load(SeqCst).as_ref() } {
        // SAFETY: the chain holds one disposition per slot.
        unsafe { restore_previous(&chain.previous) };
    }
}

pub(crate) extern "C" fn handle_posix_sigaction(
    signum: c_int,
    sig_info: *mut siginfo_t,
    ucontext: *mut c_void,
) {
    // SAFETY: only queries and updates this signal's disposition.
    if unsafe { on_undersized_alt_stack() } {
        unsafe { redeliver_on_thread_stack(signum) };
        return;
    }
    let uctx = Ucontext {
        signum,
        siginfo: sig_info,
        user_context: ucontext,
    };
    handle_ucontext(&uctx);
}

/// Whether the dispatcher is running on an alternate stack too small for
/// capture. Only the thread that installed the chain gets our stack; other
/// threads may have a guard-sized one of their own.
unsafe fn on_undersized_alt_stack() -> bool {
    let mut current: libc::stack_t = std::mem::zeroed();
    if libc::sigaltstack(ptr::null(), &mut current) != 0 {
        return false;
    }
    current.ss_flags & libc::SS_ONSTACK != 0 && current.ss_size < SIGNAL_STACK_SIZE
}

/// Stops delivering `signum` on the alternate stack and sends it again, so
/// that it is taken on the thread's own stack once we return.
///
/// The signal is blocked while its handler runs, so the raise stays pending
/// until then. It is delivered before the interrupted code resumes, which for
/// a hardware fault means before the faulting instruction runs again.
unsafe fn redeliver_on_thread_stack(signum: c_int) {
    let mut action: libc::sigaction = std::mem::zeroed();
    if libc::sigaction(signum, ptr::null(), &mut action) != 0 {
        return;
    }
    action.sa_flags &= !libc::SA_ONSTACK;
    if libc::sigaction(signum, &action, ptr::null_mut()) != 0 {
        return;
    }
    libc::raise(signum);
}

/// Once the fault has been captured, hand it to whatever handled the signal
/// before us.
///
/// SAFETY:
///     `uctx` must be the context the dispatcher received, or one with null
///     siginfo and user context for a synchronously reported fault.
///     If the chain is missing there is nothing to hand over to; the default
///     disposition is restored and the signal re-raised so that the fault is
///     never swallowed.
pub(crate) unsafe fn invoke_previous_handler(uctx: &Ucontext) {
    let signum = uctx.signum;
    let previous = CHAIN
        .load(SeqCst)
        .as_ref()
        .zip(slot_index(signum))
        .map(|(chain, index)| chain.previous[index]);
    let Some(previous) = previous else {
        signal_safe_eprint(&["Crash handler chain is missing, restoring default disposition"]);
        raise_with_default_disposition(signum);
        return;
    };

    // How we chain depends on what kind of handler we're chaining to.
    // https://man7.org/linux/man-pages/man2/sigaction.2.html
    let handler = previous.sa_sigaction;
    if handler == libc::SIG_DFL {
        // The default handler was restored by `reset_signal_handlers`. The
        // signal is blocked while we run, so this re-raise is delivered as
        // soon as we return, and a hardware fault re-triggers on its own.
        libc::raise(signum);
    } else if previous.sa_flags & libc::SA_SIGINFO != 0 {
        let f: extern "C" fn(c_int, *mut siginfo_t, *mut c_void) = std::mem::transmute(handler);
        f(signum, uctx.siginfo, uctx.user_context);
    } else if handler != libc::SIG_IGN {
        let f: extern "C" fn(c_int) = std::mem::transmute(handler);
        f(signum);
    }
}

unsafe fn raise_with_default_disposition(signum: c_int) {
    let mut default: libc::sigaction = std::mem::zeroed();
    default.sa_sigaction = libc::SIG_DFL;
    libc::sigaction(signum, &default, ptr::null_mut());
    libc::raise(signum);
}

/// A signal altstack with a guard page at its low end.
/// Inspired by https://github.com/rust-lang/rust/pull/69969/files
struct AltStack {
    mapping: *mut c_void,
    mapping_len: usize,
    previous: libc::stack_t,
}

impl AltStack {
    /// Maps the stack and makes it the calling thread's signal stack. Its
    /// usable size is the greater of `size` and SIGSTKSZ.
    unsafe fn create(size: usize) -> Result<Self, HandlerChainError> {
        let page_size = page_size::get();
        let stack_size = std::cmp::max(SIGSTKSZ, size).next_multiple_of(page_size);
        let mapping_len = stack_size + page_size;
        let mapping = libc::mmap(
            ptr::null_mut(),
            mapping_len,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANON,
            -1,
            0,
        );
        if mapping == MAP_FAILED {
            return Err(HandlerChainError::AltStack(std::io::Error::last_os_error()));
        }
        let fail = |mapping: *mut c_void| {
            let error = std::io::Error::last_os_error();
            libc::munmap(mapping, mapping_len);
            Err(HandlerChainError::AltStack(error))
        };
        if libc::mprotect(mapping, page_size, PROT_NONE) != 0 {
            return fail(mapping);
        }

        let stack = libc::stack_t {
            ss_sp: mapping.add(page_size),
            ss_flags: 0,
            ss_size: stack_size,
        };
        let mut previous: libc::stack_t = std::mem::zeroed();
        if libc::sigaltstack(&stack, &mut previous) != 0 {
            return fail(mapping);
        }
        Ok(Self {
            mapping,
            mapping_len,
            previous,
        })
    }

    /// Gives the calling thread back the stack it had before, then unmaps
    /// ours. The alternate stack is per thread: if the calling thread isn't
    /// using this one, another thread may be, and the mapping is leaked.
    fn release(self) {
        // SAFETY: querying with a null new stack has no side effects.
        let mut current: libc::stack_t = unsafe { std::mem::zeroed() };
        if unsafe { libc::sigaltstack(ptr::null(), &mut current) } != 0 {
            return;
        }
        let base = self.mapping as usize;
        let current_sp = current.ss_sp as usize;
        if current_sp < base || current_sp >= base + self.mapping_len {
            debug!("Alternate signal stack belongs to another thread, leaking it");
            return;
        }
        let mut previous = self.previous;
        if previous.ss_sp.is_null() || previous.ss_flags & libc::SS_DISABLE != 0 {
            previous.ss_flags = libc::SS_DISABLE;
        }
        // SAFETY: restoring a stack that was in use when we replaced it, or
        // disabling the alternate stack.
        if unsafe { libc::sigaltstack(&previous, ptr::null_mut()) } == 0 {
            // SAFETY: the stack is no longer installed on this thread.
            unsafe { libc::munmap(self.mapping, self.mapping_len) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::tests::global_state_lock;

    fn current_handler(signum: c_int) -> libc::sighandler_t {
        let mut current: libc::sigaction = unsafe { std::mem::zeroed() };
        assert_eq!(0, unsafe {
            libc::sigaction(signum, ptr::null(), &mut current)
        });
        current.sa_sigaction
    }

    fn all_handlers() -> Vec<libc::sighandler_t> {
        signal_slots()
            .iter()
            .map(|slot| current_handler(slot.number))
            .collect()
    }

    extern "C" fn third_party(_: c_int) {}

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_install_and_uninstall_restores() {
        let _guard = global_state_lock();
        let before = all_handlers();

        install_handler_chain(false, 0).unwrap();
        assert!(handler_chain_installed());
        let ours = handle_posix_sigaction as *const () as libc::sighandler_t;
        assert!(all_handlers().iter().all(|h| *h == ours));
        assert!(matches!(
            install_handler_chain(false, 0),
            Err(HandlerChainError::AlreadyInstalled)
        ));

        assert!(uninstall_handler_chain());
        assert!(!handler_chain_installed());
        assert_eq!(before, all_handlers());
        assert!(!uninstall_handler_chain());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_uninstall_keeps_third_party_handler() {
        let _guard = global_state_lock();
        let before = all_handlers();
        let mut original: libc::sigaction = unsafe { std::mem::zeroed() };
        unsafe { libc::sigaction(libc::SIGILL, ptr::null(), &mut original) };

        install_handler_chain(false, 0).unwrap();
        let mut replacement: libc::sigaction = unsafe { std::mem::zeroed() };
        replacement.sa_sigaction = third_party as *const () as libc::sighandler_t;
        unsafe { libc::sigaction(libc::SIGILL, &replacement, ptr::null_mut()) };

        assert!(uninstall_handler_chain());
        assert_eq!(third_party as *const () as libc::sighandler_t, current_handler(libc::SIGILL));
        for (slot, before) in signal_slots().iter().zip(before) {
            if slot.number != libc::SIGILL {
                assert_eq!(before, current_handler(slot.number), "{}", slot.name);
            }
        }
        unsafe { libc::sigaction(libc::SIGILL, &original, ptr::null_mut()) };
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_alt_stack_is_installed_and_released() {
        let _guard = global_state_lock();
        let query = || {
            let mut stack: libc::stack_t = unsafe { std::mem::zeroed() };
            assert_eq!(0, unsafe { libc::sigaltstack(ptr::null(), &mut stack) });
            stack
        };
        let before = query();

        install_handler_chain(true, crate::constants::SIGNAL_STACK_SIZE).unwrap();
        let during = query();
        assert_eq!(0, during.ss_flags & libc::SS_DISABLE);
        assert!(during.ss_size >= crate::constants::SIGNAL_STACK_SIZE);
        assert_ne!(before.ss_sp, during.ss_sp);

        assert!(uninstall_handler_chain());
        let after = query();
        assert_eq!(before.ss_flags & libc::SS_DISABLE, after.ss_flags & libc::SS_DISABLE);
        if before.ss_flags & libc::SS_DISABLE == 0 {
            assert_eq!(before.ss_sp, after.ss_sp);
        }
    }
}
