//! Launch configuration: merged settings turned into llama-server flags.

use super::ServerError;
use crate::settings::{MergedSettings, Setting};
use std::path::{Path, PathBuf};

/// Everything needed to start one server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Executable name or path, resolved by the spawner.
    pub executable: String,
    pub model_path: PathBuf,
    pub address: String,
    pub port: u16,
    pub threads: u32,
    pub gpu_layers: u32,
    pub batch_size: u32,
    pub context_size: u32,
}

impl LaunchConfig {
    /// Build the launch config for `model_path`.
    ///
    /// `model_layers` is the catalog's layer count, used to resolve
    /// `gpu_layers = Auto/All`. `executable_override` (from the environment)
    /// wins over the profile's `server_path`.
    pub fn from_settings(
        model_path: &Path,
        model_layers: Option<u32>,
        merged: &MergedSettings,
        executable_override: Option<&Path>,
    ) -> Result<Self, ServerError> {
        let port = merged.integer(Setting::Port);
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p > 0)
            .ok_or(ServerError::InvalidPort(port))?;

        let executable = match executable_override {
            Some(path) => path.display().to_string(),
            None => merged.text(Setting::ServerPath),
        };

        Ok(Self {
            executable,
            model_path: model_path.to_path_buf(),
            address: merged.text(Setting::Address),
            port,
            threads: non_negative(merged.integer(Setting::Threads)),
            gpu_layers: merged.gpu_layers().resolve(model_layers),
            batch_size: non_negative(merged.integer(Setting::BatchSize)),
            context_size: non_negative(merged.integer(Setting::ContextSize)),
        })
    }

    /// Command-line flags. Thread count, GPU layers, batch size and context
    /// size are passed only when positive.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--model".to_string(),
            self.model_path.display().to_string(),
            "--host".to_string(),
            self.address.clone(),
            "--port".to_string(),
            self.port.to_string(),
        ];

        let optional = [
            ("--threads", self.threads),
            ("--n-gpu-layers", self.gpu_layers),
            ("--batch-size", self.batch_size),
            ("--ctx-size", self.context_size),
        ];
        for (flag, value) in optional {
            if value > 0 {
                args.push(flag.to_string());
                args.push(value.to_string());
            }
        }
        args
    }

    pub fn endpoint(&self) -> String {
        completions_endpoint(&self.address, self.port)
    }
}

/// `http://<address>:<port>/v1/chat/completions`
pub fn completions_endpoint(address: &str, port: u16) -> String {
    format!("http://{}:{}/v1/chat/completions", address, port)
}

fn non_negative(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}
