//! lmngen: chat engine for a locally hosted llama.cpp server.
//!
//! This is the shell that wires together:
//! - Model catalog (models/) and layered settings (settings/)
//! - Inference server supervision (server/)
//! - Streaming completions (llm/) and conversation state (chat/)
//! - The session context and the terminal front-end

pub mod chat;
pub mod config;
pub mod frontend;
pub mod llm;
pub mod models;
pub mod persist;
pub mod server;
pub mod session;
pub mod settings;
pub mod terminal;

use config::{AppConfig, ConfigError};
use server::{OsSpawner, SharedSupervisor, Supervisor};
use session::Session;
use std::sync::{Arc, Mutex};
use terminal::Terminal;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Settings schema is inconsistent: {0}")]
    Schema(#[from] settings::schema::SchemaError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to start async runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Entry point for the `lmngen` binary.
pub fn run() -> Result<(), StartupError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    settings::schema::validate()?;
    let config = AppConfig::load()?;
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;

    let supervisor: SharedSupervisor = Arc::new(Mutex::new(Supervisor::new(Box::new(OsSpawner))));
    if let Err(e) = server::stop_on_interrupt(supervisor.clone()) {
        log::warn!("[SERVER] {}; Ctrl-C will not stop the server cleanly", e);
    }

    log::info!("lmngen starting up");
    let (mut session, events) = Session::new(config, supervisor, runtime.handle().clone());
    let mut term = Terminal::start(runtime.handle(), events);

    terminal::run_loop(&mut session, &mut term);
    session.shutdown();
    runtime.shutdown_background();
    Ok(())
}
