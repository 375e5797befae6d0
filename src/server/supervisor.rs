//! Inference server supervisor: owns the single llama-server subprocess.
//!
//! State machine: `Stopped → Starting → Running → Stopping → Stopped`.
//! Launching while a server is up stops it first, so at most one process is
//! ever alive. Dropping the supervisor runs the shutdown ladder.

use super::process::{ServerChild, Spawner, StopSignal};
use super::{LaunchConfig, ServerError};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Per-rung wait in the shutdown ladder.
pub const DEFAULT_RUNG_TIMEOUT: Duration = Duration::from_secs(1);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    /// The process had already exited on its own.
    AlreadyExited,
    Interrupted,
    Terminated,
    Killed,
    /// Even the kill did not take. Logged, never escalated.
    KillFailed,
}

/// The one live server process.
pub struct ServerHandle {
    pub model_path: PathBuf,
    pub address: String,
    pub port: u16,
    pub pid: u32,
    child: Box<dyn ServerChild>,
}

impl ServerHandle {
    pub fn endpoint(&self) -> String {
        super::completions_endpoint(&self.address, self.port)
    }

    pub fn recent_output(&self) -> Vec<String> {
        self.child.recent_output()
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("model_path", &self.model_path)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("pid", &self.pid)
            .finish()
    }
}

type TransitionObserver = Box<dyn FnMut(ServerState) + Send>;

pub struct Supervisor {
    spawner: Box<dyn Spawner>,
    state: ServerState,
    handle: Option<ServerHandle>,
    rung_timeout: Duration,
    observer: Option<TransitionObserver>,
}

/// Supervisor shared between the session and the interrupt handler.
pub type SharedSupervisor = Arc<Mutex<Supervisor>>;

impl Supervisor {
    pub fn new(spawner: Box<dyn Spawner>) -> Self {
        Self {
            spawner,
            state: ServerState::Stopped,
            handle: None,
            rung_timeout: DEFAULT_RUNG_TIMEOUT,
            observer: None,
        }
    }

    pub fn with_rung_timeout(mut self, timeout: Duration) -> Self {
        self.rung_timeout = timeout;
        self
    }

    /// Called with every state the supervisor enters.
    pub fn on_transition(&mut self, observer: impl FnMut(ServerState) + Send + 'static) {
        self.observer = Some(Box::new(observer));
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn handle(&self) -> Option<&ServerHandle> {
        self.handle.as_ref()
    }

    pub fn running_model(&self) -> Option<&Path> {
        self.handle.as_ref().map(|h| h.model_path.as_path())
    }

    /// Start a server for `config`, stopping any running one first.
    ///
    /// `Running` is optimistic: there is no readiness handshake, so the first
    /// request may fail while the model is still loading.
    pub fn launch(&mut self, config: &LaunchConfig) -> Result<&ServerHandle, ServerError> {
        if self.handle.is_some() {
            self.stop();
        }

        self.transition(ServerState::Starting);
        let child = match self.spawner.spawn(config) {
            Ok(child) => child,
            Err(e) => {
                log::error!("[SERVER] Launch failed: {}", e);
                self.transition(ServerState::Stopped);
                return Err(e);
            }
        };

        let pid = child.id();
        log::info!(
            "[SERVER] Started pid {} for {} on {}:{}",
            pid,
            config.model_path.display(),
            config.address,
            config.port
        );
        self.transition(ServerState::Running);
        Ok(self.handle.insert(ServerHandle {
            model_path: config.model_path.clone(),
            address: config.address.clone(),
            port: config.port,
            pid,
            child,
        }))
    }

    /// Stop the running server: interrupt, then terminate, then kill, each
    /// rung waiting up to the rung timeout. Blocks the caller.
    pub fn stop(&mut self) -> StopOutcome {
        let Some(mut handle) = self.handle.take() else {
            return StopOutcome::NotRunning;
        };

        self.transition(ServerState::Stopping);
        let outcome = shutdown_ladder(handle.child.as_mut(), self.rung_timeout);
        match outcome {
            StopOutcome::KillFailed => log::error!(
                "[SERVER] pid {} survived SIGKILL — abandoning it",
                handle.pid
            ),
            other => log::info!("[SERVER] pid {} stopped ({:?})", handle.pid, other),
        }
        self.transition(ServerState::Stopped);
        outcome
    }

    /// Notice a server that died on its own and settle to `Stopped`.
    /// Returns whether the server is still running.
    pub fn check_alive(&mut self) -> bool {
        let exited = match self.handle.as_mut() {
            None => return false,
            Some(h) => h.child.has_exited().unwrap_or(false),
        };
        if exited {
            if let Some(h) = self.handle.take() {
                log::warn!("[SERVER] pid {} exited unexpectedly", h.pid);
                for line in h.recent_output().iter().rev().take(5).rev() {
                    log::warn!("[SERVER]   {}", line);
                }
            }
            self.transition(ServerState::Stopped);
        }
        !exited
    }

    fn transition(&mut self, next: ServerState) {
        log::debug!("[SERVER] {:?} -> {:?}", self.state, next);
        self.state = next;
        if let Some(observer) = self.observer.as_mut() {
            observer(next);
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

fn shutdown_ladder(child: &mut dyn ServerChild, timeout: Duration) -> StopOutcome {
    if child.has_exited().unwrap_or(false) {
        return StopOutcome::AlreadyExited;
    }

    let rungs = [
        (StopSignal::Interrupt, StopOutcome::Interrupted),
        (StopSignal::Terminate, StopOutcome::Terminated),
    ];
    for (signal, outcome) in rungs {
        match child.signal(signal) {
            Ok(()) => {
                if wait_for_exit(child, timeout) {
                    return outcome;
                }
                log::warn!("[SERVER] pid {} ignored {:?}", child.id(), signal);
            }
            Err(e) => log::warn!("[SERVER] Could not send {:?} to pid {}: {}", signal, child.id(), e),
        }
    }

    if let Err(e) = child.kill() {
        log::warn!("[SERVER] kill failed for pid {}: {}", child.id(), e);
    }
    if wait_for_exit(child, timeout) {
        StopOutcome::Killed
    } else {
        StopOutcome::KillFailed
    }
}

fn wait_for_exit(child: &mut dyn ServerChild, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match child.has_exited() {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => {
                log::warn!("[SERVER] Could not poll pid {}: {}", child.id(), e);
                return false;
            }
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(EXIT_POLL_INTERVAL);
    }
}

/// Stop the shared server even if another thread panicked while holding it.
pub fn stop_shared(supervisor: &SharedSupervisor) -> StopOutcome {
    supervisor
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .stop()
}

/// Stop the server when the host receives Ctrl-C, SIGTERM or SIGHUP, then exit.
pub fn stop_on_interrupt(supervisor: SharedSupervisor) -> Result<(), ServerError> {
    ctrlc::set_handler(move || {
        log::info!("[SERVER] Interrupt received — shutting down server");
        stop_shared(&supervisor);
        std::process::exit(130);
    })
    .map_err(|e| ServerError::SignalHandler(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted fake: exits after receiving the signal named in `dies_on`.
    #[derive(Clone, Copy)]
    enum DiesOn {
        Interrupt,
        Terminate,
        Kill,
        Never,
    }

    struct FakeChild {
        pid: u32,
        dies_on: DiesOn,
        exited: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ServerChild for FakeChild {
        fn id(&self) -> u32 {
            self.pid
        }
        fn has_exited(&mut self) -> std::io::Result<bool> {
            Ok(self.exited)
        }
        fn signal(&mut self, signal: StopSignal) -> std::io::Result<()> {
            self.log.lock().unwrap().push(format!("{:?}", signal));
            self.exited = matches!(
                (signal, self.dies_on),
                (StopSignal::Interrupt, DiesOn::Interrupt) | (StopSignal::Terminate, DiesOn::Terminate)
            );
            Ok(())
        }
        fn kill(&mut self) -> std::io::Result<()> {
            self.log.lock().unwrap().push("Kill".into());
            self.exited = matches!(self.dies_on, DiesOn::Kill);
            Ok(())
        }
    }

    struct FakeSpawner {
        dies_on: DiesOn,
        next_pid: AtomicU32,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Spawner for FakeSpawner {
        fn spawn(&self, config: &LaunchConfig) -> Result<Box<dyn ServerChild>, ServerError> {
            self.log
                .lock()
                .unwrap()
                .push(format!("spawn {}", config.model_path.display()));
            Ok(Box::new(FakeChild {
                pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
                dies_on: self.dies_on,
                exited: false,
                log: self.log.clone(),
            }))
        }
    }

    fn supervisor(dies_on: DiesOn) -> (Supervisor, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let spawner = FakeSpawner {
            dies_on,
            next_pid: AtomicU32::new(100),
            log: log.clone(),
        };
        let sup = Supervisor::new(Box::new(spawner)).with_rung_timeout(Duration::from_millis(50));
        (sup, log)
    }

    fn config(model: &str) -> LaunchConfig {
        LaunchConfig {
            executable: "llama-server".into(),
            model_path: PathBuf::from(model),
            address: "127.0.0.1".into(),
            port: 5175,
            threads: 0,
            gpu_layers: 0,
            batch_size: 0,
            context_size: 0,
        }
    }

    #[test]
    fn stop_when_idle_is_noop() {
        let (mut sup, _) = supervisor(DiesOn::Interrupt);
        assert_eq!(sup.stop(), StopOutcome::NotRunning);
        assert_eq!(sup.state(), ServerState::Stopped);
    }

    #[test]
    fn interrupt_is_enough_for_a_polite_server() {
        let (mut sup, log) = supervisor(DiesOn::Interrupt);
        sup.launch(&config("a.gguf")).unwrap();
        assert_eq!(sup.state(), ServerState::Running);
        assert_eq!(sup.stop(), StopOutcome::Interrupted);
        assert_eq!(*log.lock().unwrap(), vec!["spawn a.gguf", "Interrupt"]);
    }

    #[test]
    fn ladder_escalates_to_terminate_then_kill() {
        let (mut sup, log) = supervisor(DiesOn::Terminate);
        sup.launch(&config("a.gguf")).unwrap();
        assert_eq!(sup.stop(), StopOutcome::Terminated);

        let (mut sup, log2) = supervisor(DiesOn::Kill);
        sup.launch(&config("a.gguf")).unwrap();
        assert_eq!(sup.stop(), StopOutcome::Killed);
        assert_eq!(
            *log2.lock().unwrap(),
            vec!["spawn a.gguf", "Interrupt", "Terminate", "Kill"]
        );
        drop(log);
    }

    #[test]
    fn shared_stop_survives_a_poisoned_lock() {
        let (mut sup, log) = supervisor(DiesOn::Interrupt);
        sup.launch(&config("a.gguf")).unwrap();
        let shared: SharedSupervisor = Arc::new(Mutex::new(sup));

        let holder = shared.clone();
        let _ = std::thread::spawn(move || {
            let _guard = holder.lock().unwrap();
            panic!("poison the supervisor lock");
        })
        .join();
        assert!(shared.is_poisoned());

        assert_eq!(stop_shared(&shared), StopOutcome::Interrupted);
        assert_eq!(*log.lock().unwrap(), vec!["spawn a.gguf", "Interrupt"]);
    }

    #[test]
    fn unkillable_server_is_abandoned() {
        let (mut sup, _) = supervisor(DiesOn::Never);
        sup.launch(&config("a.gguf")).unwrap();
        assert_eq!(sup.stop(), StopOutcome::KillFailed);
        assert_eq!(sup.state(), ServerState::Stopped);
        assert!(sup.handle().is_none());
    }

    #[test]
    fn relaunch_passes_through_stopping() {
        let (mut sup, _) = supervisor(DiesOn::Interrupt);
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = states.clone();
        sup.on_transition(move |s| sink.lock().unwrap().push(s));

        sup.launch(&config("a.gguf")).unwrap();
        let handle = sup.launch(&config("b.gguf")).unwrap();
        assert_eq!(handle.model_path, PathBuf::from("b.gguf"));
        assert_eq!(
            *states.lock().unwrap(),
            vec![
                ServerState::Starting,
                ServerState::Running,
                ServerState::Stopping,
                ServerState::Stopped,
                ServerState::Starting,
                ServerState::Running,
            ]
        );
    }

    #[test]
    fn drop_stops_the_server() {
        let (mut sup, log) = supervisor(DiesOn::Interrupt);
        sup.launch(&config("a.gguf")).unwrap();
        drop(sup);
        assert_eq!(log.lock().unwrap().last().map(String::as_str), Some("Interrupt"));
    }

    #[test]
    fn spawn_failure_returns_to_stopped() {
        struct Failing;
        impl Spawner for Failing {
            fn spawn(&self, config: &LaunchConfig) -> Result<Box<dyn ServerChild>, ServerError> {
                Err(ServerError::ExecutableNotFound(config.executable.clone()))
            }
        }
        let mut sup = Supervisor::new(Box::new(Failing));
        assert!(sup.launch(&config("a.gguf")).is_err());
        assert_eq!(sup.state(), ServerState::Stopped);
    }
}
