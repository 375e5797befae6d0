//! Layered settings: profile, model and chat scopes merged per launch.

pub mod schema;
mod store;

pub use schema::{GpuLayers, Scope, Setting, SettingKind, SettingValue, UNKNOWN_MODEL_GPU_LAYERS};
pub use store::{
    chat_settings_path, merge, model_settings_path, LayerRef, MergedSettings, SettingsError,
    SettingsLayer, SettingsStore, DEFAULT_PROFILE,
};
