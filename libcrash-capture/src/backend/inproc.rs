// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Captures crashes inside the crashing process.

use super::{
    ensure_hook_available, install_hook, uninstall_hook, BackendError, BackendOps, SideFiles,
    StartupContext,
};
use crate::collector::{handle_ucontext, PipelineMode, Ucontext};
use crate::sdk::Scope;
use crate::shared::configuration::BackendOptions;
use serde_json::Value;

#[derive(Default)]
pub struct InprocBackend {
    side_files: Option<SideFiles>,
    started: bool,
}

impl InprocBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }
}

impl BackendOps for InprocBackend {
    fn startup(
        &mut self,
        options: &BackendOptions,
        context: &StartupContext,
    ) -> Result<(), BackendError> {
        ensure_hook_available()?;
        let side_files = SideFiles::create(&context.run, &context.host.current_scope())?;
        install_hook(options, context, PipelineMode::Capture)?;
        self.side_files = Some(side_files);
        self.started = true;
        Ok(())
    }

    fn shutdown(&mut self) {
        if std::mem::take(&mut self.started) {
            uninstall_hook();
        }
    }

    fn except(&self, uctx: &Ucontext) {
        if self.started {
            handle_ucontext(uctx);
        }
    }

    fn flush_scope(&self, scope: &Scope) {
        if let Some(side_files) = &self.side_files {
            side_files.flush_scope(scope);
        }
    }

    fn add_breadcrumb(&mut self, breadcrumb: Value) {
        if let Some(side_files) = &mut self.side_files {
            side_files.add_breadcrumb(breadcrumb);
        }
    }

    fn free(&mut self) {
        self.shutdown();
        self.side_files = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::startup_context;
    use crate::sync::tests::global_state_lock;
    use crate::{read_breadcrumbs, read_scope_snapshot, BackendKind, CrashHost, Hub};
    use serde_json::json;

    fn options(db: &std::path::Path) -> BackendOptions {
        BackendOptions::with_database(BackendKind::Inproc, db.to_path_buf()).unwrap()
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_startup_and_shutdown() -> anyhow::Result<()> {
        let _guard = global_state_lock();
        let db = tempfile::tempdir()?;
        let (context, hub) = startup_context(db.path());
        hub.configure_scope(|scope| scope.set_tag("backend", "inproc"));

        let mut backend = InprocBackend::new();
        backend.startup(&options(db.path()), &context)?;
        assert!(backend.is_started());
        #[cfg(unix)]
        assert!(crate::handler_chain_installed());

        let run_path = context.run.run_path();
        let scope_path = run_path.join(crate::constants::SCOPE_FILE_NAME);
        assert_eq!("inproc", read_scope_snapshot(&scope_path)?["tags"]["backend"]);

        backend.add_breadcrumb(json!({ "message": "clicked" }));
        let breadcrumb_path = run_path.join(crate::constants::BREADCRUMB_FILE_NAMES[0]);
        assert_eq!(1, read_breadcrumbs(&breadcrumb_path)?.len());

        backend.shutdown();
        assert!(!backend.is_started());
        #[cfg(unix)]
        assert!(!crate::handler_chain_installed());
        backend.free();
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    #[cfg_attr(miri, ignore)]
    fn test_second_backend_fails_to_start() -> anyhow::Result<()> {
        let _guard = global_state_lock();
        let db = tempfile::tempdir()?;
        let (context, hub) = startup_context(db.path());
        hub.configure_scope(|scope| scope.set_tag("owner", "first"));

        let mut first = InprocBackend::new();
        first.startup(&options(db.path()), &context)?;
        let scope_path = context.run.run_path().join(crate::constants::SCOPE_FILE_NAME);
        first.add_breadcrumb(json!({ "message": "from first" }));

        hub.configure_scope(|scope| scope.set_tag("owner", "second"));
        let mut second = InprocBackend::new();
        assert!(matches!(
            second.startup(&options(db.path()), &context),
            Err(BackendError::HandlerChain(
                crate::HandlerChainError::AlreadyInstalled
            ))
        ));
        assert!(!second.is_started());
        // The rejected startup left the first backend's files alone.
        assert_eq!("first", read_scope_snapshot(&scope_path)?["tags"]["owner"]);
        let breadcrumb_path = context
            .run
            .run_path()
            .join(crate::constants::BREADCRUMB_FILE_NAMES[0]);
        assert_eq!(1, read_breadcrumbs(&breadcrumb_path)?.len());
        second.free();
        assert!(crate::handler_chain_installed());

        first.free();
        assert!(!crate::handler_chain_installed());
        Ok(())
    }

    #[test]
    fn test_except_before_startup_is_ignored() {
        let backend = InprocBackend::new();
        #[cfg(unix)]
        backend.except(&Ucontext::from_signal(libc::SIGSEGV));
        backend.flush_scope(&Hub::new().current_scope());
        assert!(!backend.is_started());
    }
}
