//! Engine session supervision.
//!
//! The supervisor owns at most one engine process. `start` and `stop` are
//! serialised by an operation lock; everything that describes the live session
//! (process handle, telemetry collector, system proxy flag, state) sits behind
//! a second lock that the background tasks also take:
//!
//! - the log scanner reads engine stderr into the ring buffer and the sink,
//! - the exit watcher owns the child and runs the crash path when the process
//!   dies while still owned,
//! - the teardown task spawned by `stop` interrupts, waits, then kills.
//!
//! Each launch gets a generation number. The exit watcher only treats an exit
//! as a crash if its generation is still the owned one, so an exit caused by
//! `stop` is never reported as a lost connection.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStderr};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config;
use crate::engine::{self, config::SynthOptions};
use crate::error::{AppError, Result};
use crate::events::{ConnectionStatus, Event, EventSink};
use crate::installer::Installer;
use crate::link::ConnectionDescriptor;
use crate::logbuf::LogRingBuffer;
use crate::privilege::{Elevation, DEFAULT_PROMPT_TIMEOUT};
use crate::process::ProcessController;
use crate::settings::{RunMode, Settings};
use crate::shared::latency::{self, ProbeOptions};
use crate::store::Store;
use crate::sysproxy::SystemProxy;
use crate::telemetry::{self, TelemetryHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
    /// The engine died on its own; cleanup is in progress.
    Crashed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Disconnected,
    NotRunning,
}

/// Collaborators the supervisor drives. All calls except the sink are
/// blocking and run off the async workers.
pub struct SupervisorDeps {
    pub store: Arc<dyn Store>,
    pub installer: Arc<dyn Installer>,
    pub system_proxy: Arc<dyn SystemProxy>,
    pub elevation: Arc<dyn Elevation>,
    pub process: Arc<dyn ProcessController>,
    pub sink: Arc<dyn EventSink>,
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Engine working directory; `config.json` is written here.
    pub work_dir: PathBuf,
    /// Engine control API address, also probed for stale listeners.
    pub admin_addr: String,
    /// How long a fresh engine must stay up before the start counts.
    pub settle_delay: Duration,
    /// Grace period between interrupt and kill on stop.
    pub stop_timeout: Duration,
    pub stale_probe_attempts: u32,
    pub stale_probe_timeout: Duration,
    pub stale_probe_grace: Duration,
    pub elevation_timeout: Duration,
    pub telemetry_backoff: Duration,
    pub probe: ProbeOptions,
}

impl SupervisorOptions {
    #[must_use]
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            admin_addr: engine::config::ADMIN_ADDR.to_string(),
            settle_delay: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(1),
            stale_probe_attempts: 5,
            stale_probe_timeout: Duration::from_millis(200),
            stale_probe_grace: Duration::from_millis(300),
            elevation_timeout: DEFAULT_PROMPT_TIMEOUT,
            telemetry_backoff: telemetry::RECONNECT_BACKOFF,
            probe: ProbeOptions::default(),
        }
    }
}

struct EngineHandle {
    pid: u32,
    generation: u64,
    /// Flips to true once the child has been reaped.
    exited: watch::Receiver<bool>,
}

struct ActiveSession {
    run_mode: RunMode,
    mixed_port: u16,
}

struct Inner {
    state: SessionState,
    engine: Option<EngineHandle>,
    session: Option<ActiveSession>,
    telemetry: Option<TelemetryHandle>,
    teardown: Option<JoinHandle<()>>,
    /// Port the system proxy was pointed at, if we changed it.
    proxy_applied: Option<u16>,
    next_generation: u64,
}

impl Inner {
    fn transition(&mut self, next: SessionState) {
        debug!(from = ?self.state, to = ?next, "session_state");
        self.state = next;
    }

    fn owns(&self, generation: u64) -> bool {
        self.engine
            .as_ref()
            .is_some_and(|e| e.generation == generation)
    }
}

struct Shared {
    deps: SupervisorDeps,
    opts: SupervisorOptions,
    op_lock: Mutex<()>,
    inner: Mutex<Inner>,
    logs: LogRingBuffer,
}

#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Supervisor {
    #[must_use]
    pub fn new(deps: SupervisorDeps, opts: SupervisorOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                deps,
                opts,
                op_lock: Mutex::new(()),
                inner: Mutex::new(Inner {
                    state: SessionState::Idle,
                    engine: None,
                    session: None,
                    telemetry: None,
                    teardown: None,
                    proxy_applied: None,
                    next_generation: 0,
                }),
                logs: LogRingBuffer::default(),
            }),
        }
    }

    pub async fn state(&self) -> SessionState {
        self.shared.inner.lock().await.state
    }

    pub async fn is_running(&self) -> bool {
        self.shared.inner.lock().await.engine.is_some()
    }

    pub async fn engine_pid(&self) -> Option<u32> {
        self.shared.inner.lock().await.engine.as_ref().map(|e| e.pid)
    }

    /// Recent engine and supervisor log lines, oldest first.
    #[must_use]
    pub fn logs(&self) -> Vec<String> {
        self.shared.logs.snapshot()
    }

    /// Start a session for `key`, a profile id or a `vless://` link.
    pub async fn start(&self, key: &str) -> Result<StartOutcome> {
        let _op = self.shared.op_lock.lock().await;

        self.shared.await_teardown().await;
        {
            let mut inner = self.shared.inner.lock().await;
            if inner.state != SessionState::Idle || inner.engine.is_some() {
                return Err(AppError::AlreadyRunning);
            }
            inner.transition(SessionState::Starting);
        }

        let result = Arc::clone(&self.shared).launch(key).await;
        if let Err(e) = &result {
            warn!(error = %e, "start_failed");
            self.shared.log(e.to_string());
            let mut inner = self.shared.inner.lock().await;
            if inner.engine.is_none() && inner.state != SessionState::Idle {
                inner.transition(SessionState::Idle);
            }
        }
        result.map(|()| StartOutcome::Connected)
    }

    pub async fn stop(&self) -> StopOutcome {
        let _op = self.shared.op_lock.lock().await;
        Arc::clone(&self.shared).stop_locked().await
    }

    /// Stop and wait for the engine to be gone. Used on application exit.
    pub async fn shutdown(&self) {
        let _op = self.shared.op_lock.lock().await;
        let outcome = Arc::clone(&self.shared).stop_locked().await;
        self.shared.await_teardown().await;
        debug!(outcome = ?outcome, "supervisor_shutdown");
    }

    /// Latency to the server behind `key` in milliseconds, or `-1`.
    ///
    /// While a session runs the figure is a real request through the tunnel;
    /// otherwise it is a plain TCP connect to the server.
    pub async fn measure(&self, key: &str) -> i64 {
        let proxied_port = {
            let inner = self.shared.inner.lock().await;
            match (&inner.engine, &inner.session) {
                (Some(_), Some(session)) => Some(session.mixed_port),
                _ => None,
            }
        };

        let opts = &self.shared.opts.probe;
        let result = match proxied_port {
            Some(port) => latency::proxied_latency(port, opts).await,
            None => {
                let (link, _) = self.shared.resolve_key(key).await;
                match ConnectionDescriptor::parse(&link) {
                    Ok(desc) => latency::tcp_latency(&desc.host, desc.port, opts).await,
                    Err(e) => Err(e.to_string()),
                }
            }
        };

        if let Err(e) = &result {
            self.shared.deps.sink.emit(Event::Log(format!("Latency: {}", e)));
        }
        latency::millis_or_unreachable(&result)
    }

    /// Reconnect the last used profile when settings ask for it.
    pub async fn auto_connect(&self) -> Result<Option<StartOutcome>> {
        let store = Arc::clone(&self.shared.deps.store);
        let settings = blocking(move || store.load_settings()).await?;
        if !settings.auto_connect {
            return Ok(None);
        }
        let Some(profile_id) = settings.last_profile_id else {
            return Ok(None);
        };

        let store = Arc::clone(&self.shared.deps.store);
        let profiles = blocking(move || store.load_profiles()).await?;
        if !profiles.iter().any(|p| p.id == profile_id) {
            warn!(profile_id = %profile_id, "auto_connect_profile_missing");
            return Ok(None);
        }

        self.shared.log("Auto-connecting...".to_string());
        self.start(&profile_id).await.map(Some)
    }
}

impl Shared {
    fn log(&self, line: String) {
        self.logs.push(line.clone());
        self.deps.sink.emit(Event::Log(line));
    }

    /// A profile id maps to its link; anything else is taken as a link, owned
    /// by the profile that stores it verbatim, if any.
    async fn resolve_key(&self, key: &str) -> (String, Option<String>) {
        let key = key.trim();
        let store = Arc::clone(&self.deps.store);
        let profiles = match blocking(move || store.load_profiles()).await {
            Ok(profiles) => profiles,
            Err(e) => {
                warn!(error = %e, "profiles_load_failed");
                Vec::new()
            }
        };

        if let Some(profile) = profiles.iter().find(|p| p.id == key) {
            return (profile.key.clone(), Some(profile.id.clone()));
        }
        let identity = profiles.iter().find(|p| p.key == key).map(|p| p.id.clone());
        (key.to_string(), identity)
    }

    async fn await_teardown(&self) {
        let teardown = self.inner.lock().await.teardown.take();
        if let Some(task) = teardown {
            if let Err(e) = task.await {
                warn!(error = ?e.to_string(), "teardown_join_failed");
            }
        }
    }

    async fn launch(self: Arc<Self>, key: &str) -> Result<()> {
        let (link, identity) = self.resolve_key(key).await;
        let descriptor = ConnectionDescriptor::parse(&link)?;

        let installer = Arc::clone(&self.deps.installer);
        let binary = blocking(move || {
            installer
                .ensure_binary_present()
                .map_err(|e| AppError::Install(format!("{:#}", e)))
        })
        .await?;

        let settings = self.session_settings(identity).await;

        self.probe_stale_listener().await;

        if settings.run_mode == RunMode::Tun {
            self.ensure_privilege(binary.clone()).await?;
        }

        let options = SynthOptions {
            admin_addr: self.opts.admin_addr.clone(),
            ..SynthOptions::default()
        };
        let document =
            engine::config::synthesize_with(&descriptor, &settings, &options).to_json_pretty()?;
        config::ensure_dir(&self.opts.work_dir)?;
        let config_path = config::engine_config_path(&self.opts.work_dir);
        tokio::fs::write(&config_path, document).await?;
        debug!(path = %config_path.display(), "engine_config_written");

        let mut child = self
            .deps
            .process
            .launch(&binary, &config_path, &self.opts.work_dir)
            .map_err(AppError::Spawn)?;
        let Some(pid) = child.id() else {
            return Err(AppError::Spawn(std::io::Error::new(
                std::io::ErrorKind::Other,
                "engine exited before reporting a pid",
            )));
        };
        let stderr = child.stderr.take();

        let (exited_tx, exited_rx) = watch::channel(false);
        let generation = {
            let mut inner = self.inner.lock().await;
            inner.next_generation += 1;
            let generation = inner.next_generation;
            inner.engine = Some(EngineHandle {
                pid,
                generation,
                exited: exited_rx,
            });
            inner.session = Some(ActiveSession {
                run_mode: settings.run_mode,
                mixed_port: settings.mixed_port,
            });
            inner.transition(SessionState::Running);
            generation
        };
        info!(
            pid = pid,
            host = %descriptor.host,
            run_mode = %settings.run_mode,
            routing_mode = %settings.routing_mode,
            "engine_spawned"
        );

        let scanner = stderr.map(|stderr| tokio::spawn(Arc::clone(&self).scan_log(stderr)));
        tokio::spawn(Arc::clone(&self).watch_exit(child, scanner, generation, exited_tx));

        tokio::time::sleep(self.opts.settle_delay).await;

        // The system proxy call blocks on external commands; keep the state
        // lock free while it runs and re-check ownership afterwards.
        let proxy_port = {
            let inner = self.inner.lock().await;
            if !inner.owns(generation) {
                return Err(AppError::PrematureExit);
            }
            inner
                .session
                .as_ref()
                .filter(|s| s.run_mode == RunMode::Proxy)
                .map(|s| s.mixed_port)
        };
        let mut applied_port = None;
        if let Some(mixed_port) = proxy_port {
            let proxy = Arc::clone(&self.deps.system_proxy);
            let applied = blocking(move || {
                proxy
                    .set_system_proxy(true, mixed_port)
                    .map_err(|e| AppError::Other(format!("{:#}", e)))
            })
            .await;
            match applied {
                Ok(()) => applied_port = Some(mixed_port),
                Err(e) => self.log(format!("Failed to set system proxy: {}", e)),
            }
        }

        let mut inner = self.inner.lock().await;
        if !inner.owns(generation) {
            drop(inner);
            // The exit watcher ran before the proxy was recorded.
            if let Some(port) = applied_port {
                self.revert_system_proxy(port).await;
            }
            return Err(AppError::PrematureExit);
        }
        inner.proxy_applied = applied_port;
        inner.telemetry = Some(TelemetryHandle::spawn(
            telemetry::traffic_url(&self.opts.admin_addr),
            Arc::clone(&self.deps.sink),
            self.opts.telemetry_backoff,
        ));
        self.deps
            .sink
            .emit(Event::ConnectionStatus(ConnectionStatus::Connected));
        Ok(())
    }

    /// Settings snapshot for this session. Records the profile being used.
    async fn session_settings(&self, identity: Option<String>) -> Settings {
        let store = Arc::clone(&self.deps.store);
        let mut settings = match blocking(move || store.load_settings()).await {
            Ok(settings) => settings,
            Err(e) => {
                warn!(error = %e, "settings_load_failed");
                Settings::default()
            }
        };

        if let Some(id) = identity {
            if settings.last_profile_id.as_deref() != Some(id.as_str()) {
                settings.last_profile_id = Some(id);
                let store = Arc::clone(&self.deps.store);
                let snapshot = settings.clone();
                if let Err(e) = blocking(move || store.save_settings(&snapshot)).await {
                    warn!(error = %e, "last_profile_save_failed");
                }
            }
        }
        settings
    }

    /// A previous engine that is still shutting down holds the admin port.
    /// Give it a moment; a listener that stays is reported but not fatal.
    async fn probe_stale_listener(&self) {
        let addr = self.opts.admin_addr.as_str();
        for attempt in 0..self.opts.stale_probe_attempts {
            let connect = tokio::time::timeout(self.opts.stale_probe_timeout, TcpStream::connect(addr));
            match connect.await {
                Ok(Ok(_stream)) => {
                    debug!(addr = %addr, attempt = attempt, "admin_port_busy");
                    tokio::time::sleep(self.opts.stale_probe_grace).await;
                }
                _ => return,
            }
        }
        warn!(addr = %addr, "admin_port_still_busy");
        self.log(format!(
            "Control port {} is still in use; the engine may fail to bind it",
            addr
        ));
    }

    /// Waits at most `elevation_timeout`. The blocking prompt is not
    /// cancelled when the wait gives up, so `Elevation` implementations must
    /// bound their own prompts to the same budget.
    async fn ensure_privilege(&self, binary: PathBuf) -> Result<()> {
        let elevation = Arc::clone(&self.deps.elevation);
        let task = tokio::task::spawn_blocking(move || elevation.ensure_privilege(&binary));
        let denied = match tokio::time::timeout(self.opts.elevation_timeout, task).await {
            Ok(Ok(Ok(()))) => return Ok(()),
            Ok(Ok(Err(e))) => format!("{:#}", e),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!(
                "no answer to the privilege prompt within {}s",
                self.opts.elevation_timeout.as_secs()
            ),
        };
        self.log("Error: Admin permissions required for TUN mode".to_string());
        Err(AppError::PermissionDenied(denied))
    }

    async fn scan_log(self: Arc<Self>, stderr: ChildStderr) {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let fatal = engine::is_fatal_line(&line);
                    if fatal {
                        self.deps.sink.emit(Event::Error(format!("Core Error: {}", line)));
                    }
                    self.log(line);
                }
                Ok(None) => break,
                Err(e) => {
                    self.log(format!("Log read error: {}", e));
                    break;
                }
            }
        }
    }

    async fn watch_exit(
        self: Arc<Self>,
        mut child: Child,
        scanner: Option<JoinHandle<()>>,
        generation: u64,
        exited: watch::Sender<bool>,
    ) {
        let status = child.wait().await;
        exited.send_replace(true);
        if let Some(scanner) = scanner {
            let _ = scanner.await;
        }

        let mut inner = self.inner.lock().await;
        if !inner.owns(generation) {
            debug!(generation = generation, "engine_exit_observed");
            return;
        }

        let msg = match status {
            Ok(status) if status.success() => "Core process stopped unexpectedly".to_string(),
            Ok(status) => format!("Core process stopped unexpectedly: {}", status),
            Err(e) => format!("Core process stopped unexpectedly: {}", e),
        };
        warn!(generation = generation, reason = %msg, "engine_crashed");

        inner.transition(SessionState::Crashed);
        inner.engine = None;
        inner.session = None;
        if let Some(telemetry) = inner.telemetry.take() {
            telemetry.cancel_and_join().await;
        }
        if let Some(port) = inner.proxy_applied.take() {
            self.revert_system_proxy(port).await;
        }

        self.log(msg.clone());
        self.deps.sink.emit(Event::ConnectionLost(msg));
        self.deps
            .sink
            .emit(Event::ConnectionStatus(ConnectionStatus::Disconnected));
        inner.transition(SessionState::Idle);
    }

    async fn stop_locked(self: Arc<Self>) -> StopOutcome {
        let mut inner = self.inner.lock().await;

        if let Some(telemetry) = inner.telemetry.take() {
            telemetry.cancel_and_join().await;
        }
        if let Some(port) = inner.proxy_applied.take() {
            self.revert_system_proxy(port).await;
        }

        let Some(engine) = inner.engine.take() else {
            return StopOutcome::NotRunning;
        };
        inner.session = None;
        inner.transition(SessionState::Stopping);
        info!(pid = engine.pid, "engine_stopping");

        let task = tokio::spawn(Arc::clone(&self).teardown(engine));
        inner.teardown = Some(task);
        StopOutcome::Disconnected
    }

    async fn teardown(self: Arc<Self>, engine: EngineHandle) {
        let EngineHandle {
            pid, mut exited, ..
        } = engine;

        if !*exited.borrow() {
            if let Err(e) = self.deps.process.graceful_stop(pid) {
                debug!(pid = pid, error = ?e.to_string(), "engine_interrupt_failed");
            }
            let graceful = tokio::time::timeout(self.opts.stop_timeout, exited.wait_for(|done| *done))
                .await
                .is_ok();
            if !graceful {
                warn!(pid = pid, "engine_stop_timeout");
                if let Err(e) = self.deps.process.kill(pid) {
                    warn!(pid = pid, error = ?e.to_string(), "engine_kill_failed");
                }
                let _ = exited.wait_for(|done| *done).await;
            }
        }

        self.log(">>> Core shutdown complete".to_string());
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Stopping {
            inner.transition(SessionState::Idle);
        }
        self.deps
            .sink
            .emit(Event::ConnectionStatus(ConnectionStatus::Disconnected));
    }

    async fn revert_system_proxy(&self, port: u16) {
        let proxy = Arc::clone(&self.deps.system_proxy);
        let reverted = blocking(move || {
            proxy
                .set_system_proxy(false, port)
                .map_err(|e| AppError::Other(format!("{:#}", e)))
        })
        .await;
        if let Err(e) = reverted {
            self.log(format!("Failed to reset system proxy: {}", e));
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Other(format!("blocking task failed: {}", e)))?
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::events::ChannelSink;
    use crate::process::{pid_alive, SystemController};
    use crate::settings::Profile;

    const LINK: &str = "vless://11111111-2222-3333-4444-555555555555@127.0.0.1:9?security=tls#Test";

    const LONG_RUNNING: &str = "echo 'INFO[0000] sing-box started' >&2\nexec sleep 30\n";
    const IGNORES_INTERRUPT: &str = "trap '' INT\nexec sleep 30\n";
    const CRASHES_LATER: &str = "echo 'FATAL[0000] start service: boom' >&2\nsleep 0.5\nexit 1\n";
    const EXITS_AT_ONCE: &str = "exit 3\n";

    struct MemoryStore {
        settings: StdMutex<Settings>,
        profiles: Vec<Profile>,
    }

    impl Store for MemoryStore {
        fn load_settings(&self) -> Result<Settings> {
            Ok(self.settings.lock().expect("settings lock").clone())
        }

        fn save_settings(&self, settings: &Settings) -> Result<()> {
            *self.settings.lock().expect("settings lock") = settings.clone();
            Ok(())
        }

        fn load_profiles(&self) -> Result<Vec<Profile>> {
            Ok(self.profiles.clone())
        }
    }

    struct FixedInstaller(Option<PathBuf>);

    impl Installer for FixedInstaller {
        fn ensure_binary_present(&self) -> anyhow::Result<PathBuf> {
            self.0.clone().ok_or_else(|| anyhow::anyhow!("core_missing"))
        }
    }

    /// Side effects across collaborators, in the order they happened.
    type CallOrder = Arc<StdMutex<Vec<&'static str>>>;

    #[derive(Default)]
    struct RecordingProxy {
        calls: StdMutex<Vec<(bool, u16)>>,
        order: CallOrder,
        delay: Duration,
    }

    impl SystemProxy for RecordingProxy {
        fn set_system_proxy(&self, enable: bool, port: u16) -> anyhow::Result<()> {
            self.calls.lock().expect("calls lock").push((enable, port));
            std::thread::sleep(self.delay);
            let step = if enable { "proxy_on" } else { "proxy_off" };
            self.order.lock().expect("order lock").push(step);
            Ok(())
        }
    }

    enum FakeElevation {
        Grant,
        Deny,
        Hang(Duration),
    }

    impl Elevation for FakeElevation {
        fn ensure_privilege(&self, _binary: &std::path::Path) -> anyhow::Result<()> {
            match self {
                Self::Grant => Ok(()),
                Self::Deny => anyhow::bail!("dismissed"),
                Self::Hang(d) => {
                    std::thread::sleep(*d);
                    Ok(())
                }
            }
        }
    }

    /// Runs the "binary" through `sh` so freshly written scripts need no exec bit,
    /// and counts calls.
    #[derive(Default)]
    struct ShellController {
        launches: AtomicUsize,
        kills: AtomicUsize,
        order: CallOrder,
    }

    impl ProcessController for ShellController {
        fn launch(
            &self,
            binary: &std::path::Path,
            config: &std::path::Path,
            work_dir: &std::path::Path,
        ) -> std::io::Result<Child> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            tokio::process::Command::new("sh")
                .arg(binary)
                .args(engine::run_args(config, work_dir))
                .current_dir(work_dir)
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::piped())
                .spawn()
        }

        fn graceful_stop(&self, pid: u32) -> anyhow::Result<()> {
            self.order.lock().expect("order lock").push("interrupt");
            SystemController.graceful_stop(pid)
        }

        fn kill(&self, pid: u32) -> anyhow::Result<()> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            self.order.lock().expect("order lock").push("kill");
            SystemController.kill(pid)
        }
    }

    struct Harness {
        _tmp: tempfile::TempDir,
        supervisor: Supervisor,
        store: Arc<MemoryStore>,
        proxy: Arc<RecordingProxy>,
        process: Arc<ShellController>,
        order: CallOrder,
        events: UnboundedReceiver<Event>,
        work_dir: PathBuf,
    }

    struct Setup {
        script: Option<&'static str>,
        settings: Settings,
        profiles: Vec<Profile>,
        elevation: FakeElevation,
        elevation_timeout: Duration,
        settle: Duration,
        proxy_delay: Duration,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self {
                script: Some(LONG_RUNNING),
                settings: Settings {
                    run_mode: RunMode::Proxy,
                    ..Settings::default()
                },
                profiles: Vec::new(),
                elevation: FakeElevation::Grant,
                elevation_timeout: Duration::from_secs(5),
                settle: Duration::from_millis(150),
                proxy_delay: Duration::ZERO,
            }
        }
    }

    fn unused_addr() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").to_string()
    }

    fn harness(setup: Setup) -> Harness {
        let tmp = tempfile::tempdir().expect("tempdir");
        let work_dir = tmp.path().join("work");
        let binary = setup.script.map(|body| {
            let path = tmp.path().join("fake-engine.sh");
            std::fs::write(&path, body).expect("write script");
            path
        });

        let store = Arc::new(MemoryStore {
            settings: StdMutex::new(setup.settings),
            profiles: setup.profiles,
        });
        let order = CallOrder::default();
        let proxy = Arc::new(RecordingProxy {
            order: Arc::clone(&order),
            delay: setup.proxy_delay,
            ..RecordingProxy::default()
        });
        let process = Arc::new(ShellController {
            order: Arc::clone(&order),
            ..ShellController::default()
        });
        let (sink, events) = ChannelSink::new();

        let mut opts = SupervisorOptions::new(&work_dir);
        opts.admin_addr = unused_addr();
        opts.settle_delay = setup.settle;
        opts.stop_timeout = Duration::from_millis(300);
        opts.stale_probe_attempts = 1;
        opts.elevation_timeout = setup.elevation_timeout;
        opts.telemetry_backoff = Duration::from_millis(50);

        let supervisor = Supervisor::new(
            SupervisorDeps {
                store: store.clone(),
                installer: Arc::new(FixedInstaller(binary)),
                system_proxy: proxy.clone(),
                elevation: Arc::new(setup.elevation),
                process: process.clone(),
                sink: Arc::new(sink),
            },
            opts,
        );

        Harness {
            _tmp: tmp,
            supervisor,
            store,
            proxy,
            process,
            order,
            events,
            work_dir,
        }
    }

    fn drain(events: &mut UnboundedReceiver<Event>) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn statuses(events: &[Event]) -> Vec<ConnectionStatus> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::ConnectionStatus(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    async fn wait_for_state(supervisor: &Supervisor, want: SessionState) {
        for _ in 0..100 {
            if supervisor.state().await == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("state never became {:?}", want);
    }

    async fn wait_for_log(supervisor: &Supervisor, needle: &str) {
        for _ in 0..100 {
            if supervisor.logs().iter().any(|l| l.contains(needle)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("log line {:?} never appeared", needle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_then_stop_in_proxy_mode() {
        let mut h = harness(Setup::default());

        let outcome = h.supervisor.start(LINK).await.expect("start");
        assert_eq!(outcome, StartOutcome::Connected);
        assert_eq!(h.supervisor.state().await, SessionState::Running);
        assert!(h.supervisor.is_running().await);
        let pid = h.supervisor.engine_pid().await.expect("pid");

        let written = std::fs::read_to_string(config::engine_config_path(&h.work_dir))
            .expect("config written");
        let json: serde_json::Value = serde_json::from_str(&written).expect("config json");
        assert_eq!(json["inbounds"][0]["listen_port"], 2080);
        assert_eq!(*h.proxy.calls.lock().expect("calls"), vec![(true, 2080)]);
        wait_for_log(&h.supervisor, "sing-box started").await;

        assert_eq!(h.supervisor.stop().await, StopOutcome::Disconnected);
        h.supervisor.shutdown().await;

        assert_eq!(h.supervisor.state().await, SessionState::Idle);
        assert!(!pid_alive(pid));
        assert_eq!(
            *h.proxy.calls.lock().expect("calls"),
            vec![(true, 2080), (false, 2080)]
        );
        // The desktop proxy is restored before the engine is asked to exit.
        assert_eq!(
            h.order.lock().expect("order")[..3],
            ["proxy_on", "proxy_off", "interrupt"]
        );
        assert!(h
            .supervisor
            .logs()
            .iter()
            .any(|l| l == ">>> Core shutdown complete"));

        let events = drain(&mut h.events);
        assert_eq!(
            statuses(&events),
            vec![ConnectionStatus::Connected, ConnectionStatus::Disconnected]
        );
        assert!(!events.iter().any(|e| matches!(e, Event::ConnectionLost(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn state_is_readable_while_system_proxy_applies() {
        let h = harness(Setup {
            proxy_delay: Duration::from_millis(800),
            ..Setup::default()
        });
        let supervisor = h.supervisor.clone();
        let start = tokio::spawn(async move { supervisor.start(LINK).await });

        // Past the settle delay, inside the slow proxy call.
        tokio::time::sleep(Duration::from_millis(450)).await;
        let state = tokio::time::timeout(Duration::from_millis(150), h.supervisor.state())
            .await
            .expect("state lock is free");
        assert_eq!(state, SessionState::Running);

        start.await.expect("join").expect("start");
        assert_eq!(*h.proxy.calls.lock().expect("calls"), vec![(true, 2080)]);
        h.supervisor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_start_is_rejected_without_side_effects() {
        let h = harness(Setup::default());
        h.supervisor.start(LINK).await.expect("start");
        let config_path = config::engine_config_path(&h.work_dir);
        let modified = std::fs::metadata(&config_path)
            .and_then(|m| m.modified())
            .expect("mtime");

        let err = h.supervisor.start(LINK).await.unwrap_err();
        assert!(matches!(err, AppError::AlreadyRunning));
        // The running session is reported even when the new key would not parse.
        let err = h.supervisor.start("garbage").await.unwrap_err();
        assert!(matches!(err, AppError::AlreadyRunning));
        let other = "vless://99999999-2222-3333-4444-555555555555@127.0.0.2:10#Other";
        let err = h.supervisor.start(other).await.unwrap_err();
        assert!(matches!(err, AppError::AlreadyRunning));
        assert_eq!(h.process.launches.load(Ordering::SeqCst), 1);
        assert_eq!(
            std::fs::metadata(&config_path)
                .and_then(|m| m.modified())
                .expect("mtime"),
            modified
        );
        assert_eq!(h.supervisor.state().await, SessionState::Running);

        h.supervisor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn crash_reports_connection_lost_once() {
        let mut h = harness(Setup {
            script: Some(CRASHES_LATER),
            settle: Duration::from_millis(100),
            ..Setup::default()
        });

        h.supervisor.start(LINK).await.expect("start");
        let lost = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match h.events.recv().await {
                    Some(Event::ConnectionLost(msg)) => return msg,
                    Some(_) => continue,
                    None => panic!("sink closed"),
                }
            }
        })
        .await
        .expect("connection lost in time");
        assert!(lost.starts_with("Core process stopped unexpectedly"));

        wait_for_state(&h.supervisor, SessionState::Idle).await;
        assert_eq!(h.supervisor.stop().await, StopOutcome::NotRunning);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let rest = drain(&mut h.events);
        assert!(!rest.iter().any(|e| matches!(e, Event::ConnectionLost(_))));
        assert_eq!(statuses(&rest), vec![ConnectionStatus::Disconnected]);
        assert_eq!(
            *h.proxy.calls.lock().expect("calls"),
            vec![(true, 2080), (false, 2080)]
        );
        assert!(h
            .supervisor
            .logs()
            .iter()
            .any(|l| l.starts_with("FATAL")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fatal_lines_also_raise_errors() {
        let mut h = harness(Setup {
            script: Some(CRASHES_LATER),
            settle: Duration::from_millis(100),
            ..Setup::default()
        });
        h.supervisor.start(LINK).await.expect("start");
        wait_for_state(&h.supervisor, SessionState::Idle).await;

        let events = drain(&mut h.events);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Error(msg) if msg.starts_with("Core Error: FATAL"))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn engine_dying_during_settle_is_premature_exit() {
        let h = harness(Setup {
            script: Some(EXITS_AT_ONCE),
            settle: Duration::from_millis(500),
            ..Setup::default()
        });

        let err = h.supervisor.start(LINK).await.unwrap_err();
        assert!(matches!(err, AppError::PrematureExit));
        assert_eq!(h.supervisor.state().await, SessionState::Idle);
        assert!(h.proxy.calls.lock().expect("calls").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restart_waits_for_previous_engine() {
        let h = harness(Setup::default());

        h.supervisor.start(LINK).await.expect("first start");
        let first = h.supervisor.engine_pid().await.expect("first pid");
        assert_eq!(h.supervisor.stop().await, StopOutcome::Disconnected);

        h.supervisor.start(LINK).await.expect("second start");
        assert!(!pid_alive(first));
        let second = h.supervisor.engine_pid().await.expect("second pid");
        assert_ne!(first, second);
        assert_eq!(h.process.launches.load(Ordering::SeqCst), 2);

        h.supervisor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stubborn_engine_is_killed_after_timeout() {
        let h = harness(Setup {
            script: Some(IGNORES_INTERRUPT),
            ..Setup::default()
        });
        h.supervisor.start(LINK).await.expect("start");
        let pid = h.supervisor.engine_pid().await.expect("pid");

        h.supervisor.shutdown().await;
        assert_eq!(h.process.kills.load(Ordering::SeqCst), 1);
        assert!(!pid_alive(pid));
        assert_eq!(h.supervisor.state().await, SessionState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bad_link_and_missing_core_fail_before_launch() {
        let h = harness(Setup::default());
        let err = h.supervisor.start("vless://@nohost").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidLink(_)));

        let h2 = harness(Setup {
            script: None,
            ..Setup::default()
        });
        let err = h2.supervisor.start(LINK).await.unwrap_err();
        assert!(matches!(err, AppError::Install(ref msg) if msg.contains("core_missing")));
        assert_eq!(err.status_message(), "Core installation failed: core_missing");

        for case in [&h, &h2] {
            assert_eq!(case.process.launches.load(Ordering::SeqCst), 0);
            assert_eq!(case.supervisor.state().await, SessionState::Idle);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tun_mode_requires_privilege() {
        let denied = harness(Setup {
            settings: Settings::default(),
            elevation: FakeElevation::Deny,
            ..Setup::default()
        });
        let err = denied.supervisor.start(LINK).await.unwrap_err();
        assert!(matches!(err, AppError::PermissionDenied(_)));
        assert_eq!(denied.process.launches.load(Ordering::SeqCst), 0);
        assert_eq!(denied.supervisor.state().await, SessionState::Idle);

        let hung = harness(Setup {
            settings: Settings::default(),
            elevation: FakeElevation::Hang(Duration::from_millis(800)),
            elevation_timeout: Duration::from_millis(100),
            ..Setup::default()
        });
        let started = std::time::Instant::now();
        let err = hung.supervisor.start(LINK).await.unwrap_err();
        assert!(matches!(err, AppError::PermissionDenied(_)));
        assert!(started.elapsed() < Duration::from_millis(700));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn profile_id_resolves_and_is_remembered() {
        let profile = Profile {
            id: "p-1".to_string(),
            name: "Test".to_string(),
            key: LINK.to_string(),
            subscription_id: None,
            created_at: 0,
        };
        let h = harness(Setup {
            profiles: vec![profile],
            ..Setup::default()
        });

        h.supervisor.start("p-1").await.expect("start by id");
        assert_eq!(
            h.store
                .settings
                .lock()
                .expect("settings")
                .last_profile_id
                .as_deref(),
            Some("p-1")
        );
        h.supervisor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn auto_connect_uses_last_profile() {
        let profile = Profile {
            id: "p-1".to_string(),
            name: "Test".to_string(),
            key: LINK.to_string(),
            subscription_id: None,
            created_at: 0,
        };
        let off = harness(Setup {
            profiles: vec![profile.clone()],
            ..Setup::default()
        });
        assert_eq!(off.supervisor.auto_connect().await.expect("noop"), None);

        let on = harness(Setup {
            profiles: vec![profile],
            settings: Settings {
                run_mode: RunMode::Proxy,
                auto_connect: true,
                last_profile_id: Some("p-1".to_string()),
                ..Settings::default()
            },
            ..Setup::default()
        });
        assert_eq!(
            on.supervisor.auto_connect().await.expect("connect"),
            Some(StartOutcome::Connected)
        );
        on.supervisor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn measure_unreachable_server_logs_and_returns_sentinel() {
        let mut h = harness(Setup::default());
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let link = format!("vless://id@127.0.0.1:{}", port);

        assert_eq!(h.supervisor.measure(&link).await, latency::UNREACHABLE);
        let events = drain(&mut h.events);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Log(msg) if msg.starts_with("Latency:"))));
    }
}
