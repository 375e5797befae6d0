//! Process seam: spawning and signalling the server subprocess.
//!
//! The supervisor talks to [`Spawner`] and [`ServerChild`] only, so its state
//! machine and shutdown ladder run unchanged against fake processes in tests.

use super::{LaunchConfig, ServerError};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};

/// Lines of server output kept for diagnostics.
const OUTPUT_TAIL_LINES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGINT: llama-server finishes in-flight work and exits.
    Interrupt,
    /// SIGTERM
    Terminate,
}

/// A running server process.
pub trait ServerChild: Send {
    fn id(&self) -> u32;

    /// `Ok(true)` once the process has exited.
    fn has_exited(&mut self) -> std::io::Result<bool>;

    fn signal(&mut self, signal: StopSignal) -> std::io::Result<()>;

    fn kill(&mut self) -> std::io::Result<()>;

    /// Most recent stdout/stderr lines.
    fn recent_output(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Starts server processes.
pub trait Spawner: Send {
    fn spawn(&self, config: &LaunchConfig) -> Result<Box<dyn ServerChild>, ServerError>;
}

/// Spawns real OS processes.
#[derive(Debug, Default)]
pub struct OsSpawner;

impl Spawner for OsSpawner {
    fn spawn(&self, config: &LaunchConfig) -> Result<Box<dyn ServerChild>, ServerError> {
        let executable = resolve_executable(&config.executable)?;
        let args = config.args();
        log::info!("[SERVER] Spawning {} {}", executable.display(), args.join(" "));

        let mut child = Command::new(&executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ServerError::Spawn {
                executable: executable.clone(),
                source,
            })?;

        let output = Arc::new(Mutex::new(VecDeque::with_capacity(OUTPUT_TAIL_LINES)));
        if let Some(stdout) = child.stdout.take() {
            drain_output(stdout, output.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            drain_output(stderr, output.clone());
        }

        Ok(Box::new(OsChild { child, output }))
    }
}

/// Find the server executable. Bare names are looked up on `PATH`.
pub fn resolve_executable(name: &str) -> Result<PathBuf, ServerError> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        if candidate.exists() {
            return Ok(candidate.to_path_buf());
        }
        return Err(ServerError::ExecutableNotFound(name.to_string()));
    }
    which::which(name).map_err(|_| ServerError::ExecutableNotFound(name.to_string()))
}

/// Keep the pipe drained so the server never blocks on a full buffer, and
/// retain the tail for diagnostics.
fn drain_output<R: Read + Send + 'static>(stream: R, sink: Arc<Mutex<VecDeque<String>>>) {
    std::thread::spawn(move || {
        for line in BufReader::new(stream).lines() {
            let Ok(line) = line else { break };
            log::debug!("[SERVER] {}", line);
            if let Ok(mut tail) = sink.lock() {
                if tail.len() == OUTPUT_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
    });
}

struct OsChild {
    child: Child,
    output: Arc<Mutex<VecDeque<String>>>,
}

impl ServerChild for OsChild {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn has_exited(&mut self) -> std::io::Result<bool> {
        Ok(self.child.try_wait()?.is_some())
    }

    #[cfg(unix)]
    fn signal(&mut self, signal: StopSignal) -> std::io::Result<()> {
        let signo = match signal {
            StopSignal::Interrupt => libc::SIGINT,
            StopSignal::Terminate => libc::SIGTERM,
        };
        let pid = libc::pid_t::try_from(self.child.id())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
        // Safety: kill(2) with a pid we spawned and have not yet reaped.
        let rc = unsafe { libc::kill(pid, signo) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn signal(&mut self, _signal: StopSignal) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "graceful signals are unix-only",
        ))
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill()
    }

    fn recent_output(&self) -> Vec<String> {
        self.output
            .lock()
            .map(|tail| tail.iter().cloned().collect())
            .unwrap_or_default()
    }
}
