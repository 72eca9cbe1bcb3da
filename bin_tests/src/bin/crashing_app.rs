// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Starts a crash backend and dereferences null.
//!
//! Usage: crashing_app <mode> <database dir> [handler executable]

#[cfg(not(unix))]
fn main() {}

#[cfg(unix)]
#[global_allocator]
static GLOBAL: libcrash_alloc::SignalSafeAlloc = libcrash_alloc::SignalSafeAlloc::new();

#[cfg(unix)]
fn main() -> anyhow::Result<()> {
    unix::main()
}

#[cfg(unix)]
mod unix {
    use anyhow::Context;
    use bin_tests::{Mode, CHAINED_EXIT_CODE, HANDLER_ARGS_FILE, PREVIOUS_HANDLER_FILE};
    use libcrash_capture::{
        new_event, Backend, BackendKind, BackendOptions, CrashHost, Envelope, Hub,
        QueuedTransport, Run, StartupContext, Transport, TransportSlot,
    };
    use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
    use serde_json::json;
    use std::env;
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicPtr, Ordering::SeqCst};
    use std::sync::Arc;
    use std::time::Duration;

    static PREVIOUS_HANDLER_PATH: AtomicPtr<libc::c_char> = AtomicPtr::new(std::ptr::null_mut());

    extern "C" fn previous_segv_handler(_signum: libc::c_int) {
        let path = PREVIOUS_HANDLER_PATH.load(SeqCst);
        if !path.is_null() {
            // SAFETY: a NUL terminated path leaked by `install_previous_handler`.
            unsafe {
                let fd = libc::open(path, libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC, 0o644);
                if fd >= 0 {
                    libc::close(fd);
                }
            }
        }
        // SAFETY: async-signal safe.
        unsafe { libc::_exit(CHAINED_EXIT_CODE) };
    }

    fn install_previous_handler(database: &Path) -> anyhow::Result<()> {
        let path = CString::new(database.join(PREVIOUS_HANDLER_FILE).as_os_str().as_bytes())?;
        PREVIOUS_HANDLER_PATH.store(path.into_raw(), SeqCst);
        let action = SigAction::new(
            SigHandler::Handler(previous_segv_handler),
            SaFlags::empty(),
            SigSet::empty(),
        );
        // SAFETY: the handler only calls async-signal safe functions.
        unsafe { signal::sigaction(Signal::SIGSEGV, &action) }?;
        Ok(())
    }

    #[inline(never)]
    unsafe fn fn3() {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            std::arch::asm!("mov eax, [0]", options(nostack));
        }

        #[cfg(target_arch = "aarch64")]
        {
            std::arch::asm!("mov x0, #0", "ldr x1, [x0]", options(nostack));
        }
    }

    #[inline(never)]
    fn fn2() {
        unsafe { fn3() }
    }

    #[inline(never)]
    fn fn1() {
        fn2()
    }

    #[inline(never)]
    pub fn main() -> anyhow::Result<()> {
        let mut args = env::args().skip(1);
        let mode: Mode = args.next().context("Unexpected number of arguments 1")?.parse()?;
        let database = PathBuf::from(args.next().context("Unexpected number of arguments 2")?);
        let handler = args.next().map(PathBuf::from);
        anyhow::ensure!(args.next().is_none(), "unexpected extra arguments");
        bin_tests::init_logging();

        if mode == Mode::Chained {
            install_previous_handler(&database)?;
        }

        let hub = Arc::new(Hub::new());
        hub.start_session();
        hub.configure_scope(|scope| {
            scope.release = Some("crashing_app@1.0.0".to_string());
            scope.set_tag("mode", &mode.to_string());
        });
        let queue = QueuedTransport::new();
        for _ in 0..bin_tests::QUEUED_ENVELOPES {
            queue.send_envelope(Envelope::from_event(&new_event())?);
        }
        let transport = Arc::new(TransportSlot::new(Box::new(queue)));

        let kind = match mode {
            Mode::Inproc | Mode::Chained => BackendKind::Inproc,
            Mode::OutOfProcess => BackendKind::OutOfProcess,
        };
        let mut options = BackendOptions::with_database(kind, database.clone())?;
        options.set_handler_path(handler);
        let context = StartupContext {
            run: Run::new(&database)?,
            host: hub.clone(),
            transport,
        };
        let mut backend = Backend::new(kind)?;
        backend.startup(&options, &context)?;

        backend.add_breadcrumb(json!({ "message": "about to crash" }));
        hub.configure_scope(|scope| scope.set_tag("stage", "crashing"));
        backend.flush_scope(&hub.current_scope());

        if mode == Mode::OutOfProcess {
            let started = database.join(HANDLER_ARGS_FILE);
            anyhow::ensure!(
                bin_tests::wait_for_file(&started, Duration::from_secs(10)),
                "crash handler did not start"
            );
        }

        fn1();
        Ok(())
    }
}
