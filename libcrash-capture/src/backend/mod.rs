// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The lifecycle every crash backend follows, and the backends themselves.
//!
//! Exactly one backend is active per process. It is created when the SDK is
//! initialized, started once the options are final, shut down at teardown and
//! then freed. Every operation is optional: the defaults on [BackendOps] do
//! nothing.

#[cfg(feature = "inproc")]
pub mod inproc;
#[cfg(feature = "out_of_process")]
pub mod out_of_process;

use crate::collector::{clear_context, update_context, CrashContext, PipelineMode, Ucontext};
use crate::persistence::{BreadcrumbRing, PersistenceError, ScopeFile};
use crate::run::Run;
use crate::sdk::{CrashHost, Scope};
use crate::shared::configuration::{BackendKind, BackendOptions};
use crate::transport::TransportSlot;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("The {0:?} backend is not compiled in")]
    Unsupported(BackendKind),
    #[cfg(unix)]
    #[error(transparent)]
    HandlerChain(#[from] crate::collector::HandlerChainError),
    #[cfg(windows)]
    #[error("The unhandled exception filter is already installed")]
    FilterAlreadyInstalled,
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("Unable to locate the crash handler: {0}")]
    HandlerPath(#[source] std::io::Error),
    #[error("Crash handler {0} is not a file")]
    HandlerNotFound(PathBuf),
    #[error("Failed to launch the crash handler: {0}")]
    HandlerLaunch(#[source] std::io::Error),
    #[error("Crash database I/O failed: {0}")]
    Database(#[from] std::io::Error),
    #[error("Unable to encode the crash database settings: {0}")]
    Settings(#[from] serde_json::Error),
}

/// What a backend is started with besides its options: the run it persists
/// into, and the SDK state it reports on.
#[derive(Clone)]
pub struct StartupContext {
    pub run: Run,
    pub host: Arc<dyn CrashHost>,
    pub transport: Arc<TransportSlot>,
}

/// The operations may be called from any thread. Calls that mutate the
/// backend take `&mut self`, so sharing one across threads takes a lock.
pub trait BackendOps: Send + Sync {
    /// Installs the crash hooks and sets up everything persisted on disk.
    /// Never blocks. A failure leaves the backend inactive.
    fn startup(
        &mut self,
        _options: &BackendOptions,
        _context: &StartupContext,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    /// Restores the handlers that were in place before [BackendOps::startup],
    /// unless a third party has replaced ours since.
    fn shutdown(&mut self) {}

    /// Reports a fault synchronously, through the same pipeline a signal or
    /// exception goes through.
    fn except(&self, _uctx: &Ucontext) {}

    fn flush_scope(&self, _scope: &Scope) {}

    fn add_breadcrumb(&mut self, _breadcrumb: Value) {}

    fn user_consent_changed(&self) {}

    /// Releases everything the backend holds. Must tolerate a backend that was
    /// never started.
    fn free(&mut self) {}
}

/// The backend selected by [BackendOptions::backend].
pub enum Backend {
    #[cfg(feature = "inproc")]
    Inproc(inproc::InprocBackend),
    #[cfg(feature = "out_of_process")]
    OutOfProcess(out_of_process::OutOfProcessBackend),
}

impl Backend {
    pub fn new(kind: BackendKind) -> Result<Self, BackendError> {
        match kind {
            #[cfg(feature = "inproc")]
            BackendKind::Inproc => Ok(Self::Inproc(inproc::InprocBackend::new())),
            #[cfg(feature = "out_of_process")]
            BackendKind::OutOfProcess => {
                Ok(Self::OutOfProcess(out_of_process::OutOfProcessBackend::new()))
            }
            #[allow(unreachable_patterns)]
            kind => Err(BackendError::Unsupported(kind)),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            #[cfg(feature = "inproc")]
            Self::Inproc(_) => BackendKind::Inproc,
            #[cfg(feature = "out_of_process")]
            Self::OutOfProcess(_) => BackendKind::OutOfProcess,
        }
    }

    fn ops(&self) -> &dyn BackendOps {
        match self {
            #[cfg(feature = "inproc")]
            Self::Inproc(backend) => backend,
            #[cfg(feature = "out_of_process")]
            Self::OutOfProcess(backend) => backend,
        }
    }

    fn ops_mut(&mut self) -> &mut dyn BackendOps {
        match self {
            #[cfg(feature = "inproc")]
            Self::Inproc(backend) => backend,
            #[cfg(feature = "out_of_process")]
            Self::OutOfProcess(backend) => backend,
        }
    }

    /// Starts the backend. A failure is logged and returned, but the host
    /// keeps running without crash capture.
    pub fn startup(
        &mut self,
        options: &BackendOptions,
        context: &StartupContext,
    ) -> anyhow::Result<()> {
        if let Err(e) = self.ops_mut().startup(options, context) {
            debug!(backend = ?self.kind(), "Unable to start the crash backend: {e}");
            return Err(e.into());
        }
        debug!(backend = ?self.kind(), run = %context.run.run_path().display(), "Crash backend started");
        Ok(())
    }

    pub fn shutdown(&mut self) {
        self.ops_mut().shutdown()
    }

    pub fn except(&self, uctx: &Ucontext) {
        self.ops().except(uctx)
    }

    pub fn flush_scope(&self, scope: &Scope) {
        self.ops().flush_scope(scope)
    }

    pub fn add_breadcrumb(&mut self, breadcrumb: Value) {
        self.ops_mut().add_breadcrumb(breadcrumb)
    }

    pub fn user_consent_changed(&self) {
        self.ops().user_consent_changed()
    }

    pub fn free(&mut self) {
        self.ops_mut().free()
    }
}

/// The breadcrumb ring and scope snapshot a backend keeps in its run
/// directory.
pub(crate) struct SideFiles {
    ring: BreadcrumbRing,
    scope: ScopeFile,
}

impl SideFiles {
    /// Creates the files and writes `scope` right away, so that a crash before
    /// the first scope change still has it.
    pub(crate) fn create(run: &Run, scope: &Scope) -> Result<Self, PersistenceError> {
        let ring = BreadcrumbRing::new(run.run_path());
        ring.touch()?;
        let side_files = Self {
            ring,
            scope: ScopeFile::new(run.run_path()),
        };
        side_files.scope.touch()?;
        side_files.scope.flush(scope)?;
        Ok(side_files)
    }

    pub(crate) fn paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.scope.path().to_path_buf()];
        paths.extend(self.ring.paths().iter().cloned());
        paths
    }

    pub(crate) fn flush_scope(&self, scope: &Scope) {
        if let Err(e) = self.scope.flush(scope) {
            debug!("Flushing the scope failed: {e}");
        }
    }

    pub(crate) fn add_breadcrumb(&mut self, breadcrumb: Value) {
        if let Err(e) = self.ring.add(breadcrumb) {
            debug!(count = self.ring.count(), "Flushing the breadcrumb failed: {e}");
        }
    }
}

/// Fails if the platform hook is already held, by this backend or another
/// one. Checked before anything is written into the run directory.
pub(crate) fn ensure_hook_available() -> Result<(), BackendError> {
    #[cfg(unix)]
    if crate::collector::handler_chain_installed() {
        return Err(crate::collector::HandlerChainError::AlreadyInstalled.into());
    }
    #[cfg(windows)]
    if crate::collector::exception_filter_installed() {
        return Err(BackendError::FilterAlreadyInstalled);
    }
    Ok(())
}

/// Installs the platform hook, then publishes the crash context it captures
/// with. Nothing is installed or replaced on failure.
pub(crate) fn install_hook(
    options: &BackendOptions,
    context: &StartupContext,
    mode: PipelineMode,
) -> Result<(), BackendError> {
    let crash_context = CrashContext::new(
        context.run.clone(),
        context.transport.clone(),
        context.host.clone(),
        options.max_frames(),
        mode,
    )?;

    #[cfg(unix)]
    crate::collector::install_handler_chain(
        options.create_alt_stack(),
        options.signal_stack_size(),
    )?;
    #[cfg(windows)]
    if !crate::collector::install_exception_filter() {
        return Err(BackendError::FilterAlreadyInstalled);
    }

    // A fault before this point is chained without being captured.
    update_context(crash_context);
    Ok(())
}

pub(crate) fn uninstall_hook() {
    #[cfg(unix)]
    let uninstalled = crate::collector::uninstall_handler_chain();
    #[cfg(windows)]
    let uninstalled = crate::collector::uninstall_exception_filter();
    if !uninstalled {
        debug!("Crash hook was not installed");
    }
    clear_context();
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sdk::Hub;
    use crate::transport::QueuedTransport;

    pub(crate) fn startup_context(db: &std::path::Path) -> (StartupContext, Arc<Hub>) {
        let hub = Arc::new(Hub::new());
        hub.start_session();
        let context = StartupContext {
            run: Run::new(db).unwrap(),
            host: hub.clone(),
            transport: Arc::new(TransportSlot::new(Box::new(QueuedTransport::new()))),
        };
        (context, hub)
    }

    #[test]
    fn test_side_files() -> anyhow::Result<()> {
        let db = tempfile::tempdir()?;
        let run = Run::new(db.path())?;
        let mut scope = Scope::default();
        scope.set_tag("stage", "startup");

        let mut side_files = SideFiles::create(&run, &scope)?;
        let paths = side_files.paths();
        assert_eq!(3, paths.len());
        assert!(paths.iter().all(|p| p.is_file() && p.starts_with(run.run_path())));
        let snapshot = crate::read_scope_snapshot(&paths[0])?;
        assert_eq!("startup", snapshot["tags"]["stage"]);

        scope.set_tag("stage", "running");
        side_files.flush_scope(&scope);
        assert_eq!("running", crate::read_scope_snapshot(&paths[0])?["tags"]["stage"]);

        side_files.add_breadcrumb(serde_json::json!({ "message": "one" }));
        assert_eq!(1, crate::read_breadcrumbs(&paths[1])?.len());
        Ok(())
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_backends_are_shareable() {
        assert_send_sync::<Backend>();
        assert_send_sync::<StartupContext>();
    }

    #[test]
    #[cfg(all(feature = "inproc", feature = "out_of_process"))]
    fn test_backend_kinds() {
        assert_eq!(BackendKind::Inproc, Backend::new(BackendKind::Inproc).unwrap().kind());
        assert_eq!(
            BackendKind::OutOfProcess,
            Backend::new(BackendKind::OutOfProcess).unwrap().kind()
        );
    }

    #[test]
    #[cfg(all(feature = "inproc", feature = "out_of_process"))]
    fn test_never_started_backend_can_be_freed() {
        for kind in [BackendKind::Inproc, BackendKind::OutOfProcess] {
            let mut backend = Backend::new(kind).unwrap();
            backend.flush_scope(&Scope::default());
            backend.add_breadcrumb(serde_json::json!({}));
            backend.user_consent_changed();
            backend.shutdown();
            backend.free();
        }
    }
}
