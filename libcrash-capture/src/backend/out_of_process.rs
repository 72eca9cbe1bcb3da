// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delegates crash reports to an external handler executable.
//!
//! The handler is launched at startup and watches the process from outside.
//! When a fault happens, the in-process hook only persists what the handler
//! cannot see (the crash marker, the crashed session and the queued envelopes)
//! and then hands the fault on. The handler picks up the scope snapshot and
//! breadcrumb files from the run directory as attachments.

use super::{
    ensure_hook_available, install_hook, uninstall_hook, BackendError, BackendOps, SideFiles,
    StartupContext,
};
use crate::collector::{PipelineMode, Ucontext};
use crate::sdk::{CrashHost, Scope};
use crate::shared::configuration::BackendOptions;
use crate::shared::constants::{DEFAULT_HANDLER_NAME, SETTINGS_FILE_NAME};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use tracing::debug;

/// Everything the external handler is started with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerLaunch {
    pub handler_path: PathBuf,
    pub database_path: PathBuf,
    pub metrics_dir: PathBuf,
    pub url: Option<String>,
    pub attachments: Vec<PathBuf>,
    pub system_crash_reporter_enabled: bool,
}

/// Talks to the external crash handler.
pub trait CrashReporterClient: Send + Sync {
    fn start_handler(&mut self, launch: &HandlerLaunch) -> Result<(), BackendError>;

    /// Asks the handler to write a report for `uctx` and terminate the
    /// process. Returns false if the client has no way of doing so.
    fn dump_and_crash(&self, _uctx: &Ucontext) -> bool {
        false
    }
}

/// Spawns the handler as a detached child process.
#[derive(Debug, Default)]
pub struct ProcessHandlerClient {
    child: Option<Child>,
}

impl ProcessHandlerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arguments(launch: &HandlerLaunch) -> Vec<OsString> {
        let with_value = |flag: &str, value: &Path| {
            let mut arg = OsString::from(flag);
            arg.push(value);
            arg
        };
        let mut args = vec![
            with_value("--database=", &launch.database_path),
            with_value("--metrics-dir=", &launch.metrics_dir),
        ];
        if let Some(url) = &launch.url {
            args.push(format!("--url={url}").into());
        }
        args.extend(
            launch
                .attachments
                .iter()
                .map(|path| with_value("--attachment=", path)),
        );
        args.push("--no-rate-limit".into());
        if !launch.system_crash_reporter_enabled {
            args.push("--no-system-crash-reporter".into());
        }
        args
    }

    pub fn child_id(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }
}

impl CrashReporterClient for ProcessHandlerClient {
    fn start_handler(&mut self, launch: &HandlerLaunch) -> Result<(), BackendError> {
        let child = Command::new(&launch.handler_path)
            .args(Self::arguments(launch))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(BackendError::HandlerLaunch)?;
        debug!(pid = child.id(), "Started crash handler");
        self.child = Some(child);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Settings {
    uploads_enabled: bool,
}

/// The directory the handler writes its reports into, and the settings it
/// shares with this process.
#[derive(Debug)]
pub struct CrashDatabase {
    path: PathBuf,
}

impl CrashDatabase {
    pub fn initialize(path: &Path) -> Result<Self, BackendError> {
        std::fs::create_dir_all(path)?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn settings_path(&self) -> PathBuf {
        self.path.join(SETTINGS_FILE_NAME)
    }

    pub fn set_uploads_enabled(&self, uploads_enabled: bool) -> Result<(), BackendError> {
        let settings = serde_json::to_vec(&Settings { uploads_enabled })?;
        std::fs::write(self.settings_path(), settings)?;
        Ok(())
    }

    /// `None` until the settings have been written once.
    pub fn uploads_enabled(&self) -> Result<Option<bool>, BackendError> {
        match std::fs::read(self.settings_path()) {
            Ok(bytes) => Ok(Some(
                serde_json::from_slice::<Settings>(&bytes)?.uploads_enabled,
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Finds the handler executable: `configured` if set, otherwise
/// [DEFAULT_HANDLER_NAME] next to the current executable. The result is
/// absolute and known to be a file.
pub fn resolve_handler_path(configured: Option<&Path>) -> Result<PathBuf, BackendError> {
    let path = match configured {
        Some(path) => path.to_path_buf(),
        None => {
            let exe = std::env::current_exe().map_err(BackendError::HandlerPath)?;
            exe.parent()
                .map(|dir| dir.join(DEFAULT_HANDLER_NAME))
                .ok_or_else(|| BackendError::HandlerNotFound(exe.clone()))?
        }
    };
    let absolute = std::path::absolute(&path).map_err(BackendError::HandlerPath)?;
    if !absolute.is_file() {
        return Err(BackendError::HandlerNotFound(absolute));
    }
    Ok(absolute)
}

struct State {
    database: Option<CrashDatabase>,
    host: Arc<dyn CrashHost>,
    side_files: SideFiles,
    hook_installed: bool,
}

pub struct OutOfProcessBackend {
    client: Box<dyn CrashReporterClient>,
    state: Option<State>,
}

impl Default for OutOfProcessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl OutOfProcessBackend {
    pub fn new() -> Self {
        Self::with_client(Box::new(ProcessHandlerClient::new()))
    }

    pub fn with_client(client: Box<dyn CrashReporterClient>) -> Self {
        Self {
            client,
            state: None,
        }
    }

    pub fn is_started(&self) -> bool {
        self.state.is_some()
    }
}

impl BackendOps for OutOfProcessBackend {
    fn startup(
        &mut self,
        options: &BackendOptions,
        context: &StartupContext,
    ) -> Result<(), BackendError> {
        let handler_path = resolve_handler_path(options.handler_path().as_deref())?;
        debug!(handler = %handler_path.display(), "Starting the out-of-process crash backend");
        ensure_hook_available()?;

        let side_files = SideFiles::create(&context.run, &context.host.current_scope())?;
        let mut attachments = options.attachments().to_vec();
        attachments.extend(side_files.paths());

        // The consent has to be persisted before the handler reads it.
        let database = CrashDatabase::initialize(options.database_path())?;
        self.state = Some(State {
            database: Some(database),
            host: context.host.clone(),
            side_files,
            hook_installed: false,
        });
        self.user_consent_changed();

        let launch = HandlerLaunch {
            handler_path,
            database_path: options.database_path().clone(),
            metrics_dir: options.database_path().clone(),
            url: options.minidump_url().clone(),
            attachments,
            system_crash_reporter_enabled: options.system_crash_reporter_enabled(),
        };
        // A handler is only launched once the hook is in, and the hook comes
        // back out if the launch fails.
        if let Err(e) = install_hook(options, context, PipelineMode::Handoff) {
            self.state = None;
            return Err(e);
        }
        if let Err(e) = self.client.start_handler(&launch) {
            uninstall_hook();
            self.state = None;
            return Err(e);
        }
        if let Some(state) = &mut self.state {
            state.hook_installed = true;
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        let Some(state) = &mut self.state else {
            return;
        };
        state.database = None;
        if std::mem::take(&mut state.hook_installed) {
            uninstall_hook();
        }
    }

    fn except(&self, uctx: &Ucontext) {
        if self.state.is_some() && !self.client.dump_and_crash(uctx) {
            debug!("The crash handler client cannot dump on request");
        }
    }

    fn flush_scope(&self, scope: &Scope) {
        if let Some(state) = &self.state {
            state.side_files.flush_scope(scope);
        }
    }

    fn add_breadcrumb(&mut self, breadcrumb: Value) {
        if let Some(state) = &mut self.state {
            state.side_files.add_breadcrumb(breadcrumb);
        }
    }

    fn user_consent_changed(&self) {
        let Some(state) = &self.state else {
            return;
        };
        let Some(database) = &state.database else {
            return;
        };
        if let Err(e) = database.set_uploads_enabled(!state.host.should_skip_upload()) {
            debug!("Unable to persist the upload consent: {e}");
        }
    }

    fn free(&mut self) {
        self.shutdown();
        self.state = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::startup_context;
    use crate::sync::tests::global_state_lock;
    use crate::BackendKind;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct RecordingClient {
        launches: Arc<Mutex<Vec<HandlerLaunch>>>,
        fail: bool,
    }

    impl CrashReporterClient for RecordingClient {
        fn start_handler(&mut self, launch: &HandlerLaunch) -> Result<(), BackendError> {
            if self.fail {
                return Err(BackendError::HandlerLaunch(std::io::Error::other("refused")));
            }
            self.launches.lock().unwrap().push(launch.clone());
            Ok(())
        }
    }

    struct Setup {
        db: tempfile::TempDir,
        handler: PathBuf,
        options: BackendOptions,
    }

    fn setup() -> anyhow::Result<Setup> {
        let db = tempfile::tempdir()?;
        let handler = db.path().join(DEFAULT_HANDLER_NAME);
        std::fs::write(&handler, b"")?;
        let mut options =
            BackendOptions::with_database(BackendKind::OutOfProcess, db.path().join("db"))?;
        options.set_handler_path(Some(handler.clone()));
        options.set_minidump_url(Some("http://localhost:8000/minidump".to_string()));
        options.set_attachments(vec![db.path().join("app.log")]);
        options.set_system_crash_reporter_enabled(false);
        Ok(Setup {
            db,
            handler,
            options,
        })
    }

    #[test]
    fn test_resolve_handler_path() -> anyhow::Result<()> {
        let setup = setup()?;
        assert_eq!(setup.handler, resolve_handler_path(Some(&setup.handler))?);
        assert!(matches!(
            resolve_handler_path(Some(&setup.db.path().join("missing"))),
            Err(BackendError::HandlerNotFound(_))
        ));
        // A directory is not a handler.
        assert!(matches!(
            resolve_handler_path(Some(setup.db.path())),
            Err(BackendError::HandlerNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_arguments() {
        let launch = HandlerLaunch {
            handler_path: PathBuf::from("/opt/crash_handler"),
            database_path: PathBuf::from("/tmp/db"),
            metrics_dir: PathBuf::from("/tmp/db"),
            url: Some("http://example.com/api/minidump".to_string()),
            attachments: vec![PathBuf::from("/tmp/a"), PathBuf::from("/tmp/b")],
            system_crash_reporter_enabled: true,
        };
        let args = ProcessHandlerClient::arguments(&launch);
        let expected: Vec<OsString> = [
            "--database=/tmp/db",
            "--metrics-dir=/tmp/db",
            "--url=http://example.com/api/minidump",
            "--attachment=/tmp/a",
            "--attachment=/tmp/b",
            "--no-rate-limit",
        ]
        .iter()
        .map(OsString::from)
        .collect();
        assert_eq!(expected, args);

        let launch = HandlerLaunch {
            url: None,
            attachments: vec![],
            system_crash_reporter_enabled: false,
            ..launch
        };
        let args = ProcessHandlerClient::arguments(&launch);
        assert_eq!(Some(&OsString::from("--no-system-crash-reporter")), args.last());
        assert_eq!(4, args.len());
    }

    #[test]
    fn test_database_settings() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let database = CrashDatabase::initialize(&dir.path().join("nested"))?;
        assert_eq!(None, database.uploads_enabled()?);
        database.set_uploads_enabled(false)?;
        assert_eq!(Some(false), database.uploads_enabled()?);
        database.set_uploads_enabled(true)?;
        assert_eq!(Some(true), database.uploads_enabled()?);
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_startup_launches_handler_and_installs_hook() -> anyhow::Result<()> {
        let _guard = global_state_lock();
        let setup = setup()?;
        let (context, hub) = startup_context(setup.db.path());
        hub.set_user_consent(false);
        let client = RecordingClient::default();
        let mut backend = OutOfProcessBackend::with_client(Box::new(client.clone()));

        backend.startup(&setup.options, &context)?;
        assert!(backend.is_started());
        #[cfg(unix)]
        assert!(crate::handler_chain_installed());

        let launches = client.launches.lock().unwrap().clone();
        assert_eq!(1, launches.len());
        let launch = &launches[0];
        assert_eq!(setup.handler, launch.handler_path);
        assert_eq!(setup.options.database_path(), &launch.database_path);
        assert_eq!(setup.options.minidump_url(), &launch.url);
        assert!(!launch.system_crash_reporter_enabled);
        // The user attachment, then the scope and both breadcrumb files.
        assert_eq!(4, launch.attachments.len());
        assert_eq!(setup.db.path().join("app.log"), launch.attachments[0]);
        assert!(launch.attachments[1..]
            .iter()
            .all(|p| p.starts_with(context.run.run_path()) && p.is_file()));

        let database = CrashDatabase::initialize(setup.options.database_path())?;
        assert_eq!(Some(false), database.uploads_enabled()?);
        hub.set_user_consent(true);
        backend.user_consent_changed();
        assert_eq!(Some(true), database.uploads_enabled()?);

        backend.shutdown();
        #[cfg(unix)]
        assert!(!crate::handler_chain_installed());
        // The database is released on shutdown, consent is no longer written.
        hub.set_user_consent(false);
        backend.user_consent_changed();
        assert_eq!(Some(true), database.uploads_enabled()?);
        backend.free();
        assert!(!backend.is_started());
        Ok(())
    }

    #[test]
    fn test_startup_aborts_without_handler() -> anyhow::Result<()> {
        let setup = setup()?;
        let (context, _hub) = startup_context(setup.db.path());
        let mut options = setup.options.clone();
        options.set_handler_path(Some(setup.db.path().join("missing")));
        let client = RecordingClient::default();
        let mut backend = OutOfProcessBackend::with_client(Box::new(client.clone()));

        assert!(matches!(
            backend.startup(&options, &context),
            Err(BackendError::HandlerNotFound(_))
        ));
        assert!(!backend.is_started());
        assert!(client.launches.lock().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn test_startup_aborts_when_launch_fails() -> anyhow::Result<()> {
        let _guard = global_state_lock();
        let setup = setup()?;
        let (context, _hub) = startup_context(setup.db.path());
        let client = RecordingClient {
            fail: true,
            ..Default::default()
        };
        let mut backend = OutOfProcessBackend::with_client(Box::new(client));

        assert!(matches!(
            backend.startup(&setup.options, &context),
            Err(BackendError::HandlerLaunch(_))
        ));
        assert!(!backend.is_started());
        // The hook that went in ahead of the launch is taken back out.
        #[cfg(unix)]
        assert!(!crate::handler_chain_installed());
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    #[cfg_attr(miri, ignore)]
    fn test_startup_with_hook_taken_launches_nothing() -> anyhow::Result<()> {
        let _guard = global_state_lock();
        let setup = setup()?;
        let (context, _hub) = startup_context(setup.db.path());
        crate::install_handler_chain(false, 0)?;
        let client = RecordingClient::default();
        let mut backend = OutOfProcessBackend::with_client(Box::new(client.clone()));

        assert!(matches!(
            backend.startup(&setup.options, &context),
            Err(BackendError::HandlerChain(
                crate::HandlerChainError::AlreadyInstalled
            ))
        ));
        assert!(!backend.is_started());
        assert!(client.launches.lock().unwrap().is_empty());
        // Nothing was written for the rejected run either.
        assert!(!context
            .run
            .run_path()
            .join(crate::constants::SCOPE_FILE_NAME)
            .exists());
        // The hook that was already there is left in place.
        assert!(crate::handler_chain_installed());
        assert!(crate::uninstall_handler_chain());
        Ok(())
    }

    #[test]
    #[cfg(target_os = "linux")]
    #[cfg_attr(miri, ignore)]
    fn test_process_client_spawns() -> anyhow::Result<()> {
        let setup = setup()?;
        let mut client = ProcessHandlerClient::new();
        let launch = HandlerLaunch {
            handler_path: PathBuf::from("/bin/sh"),
            database_path: setup.db.path().to_path_buf(),
            metrics_dir: setup.db.path().to_path_buf(),
            url: None,
            attachments: vec![],
            system_crash_reporter_enabled: true,
        };
        client.start_handler(&launch)?;
        assert!(client.child_id().is_some());

        let mut missing = ProcessHandlerClient::new();
        let launch = HandlerLaunch {
            handler_path: setup.db.path().join("missing"),
            ..launch
        };
        assert!(matches!(
            missing.start_handler(&launch),
            Err(BackendError::HandlerLaunch(_))
        ));
        Ok(())
    }
}
