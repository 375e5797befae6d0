//! Settings store: three independently persisted layers and their merge.
//!
//! Layout on disk:
//!   profile: `<data>/profiles/<name>.json`, active name in `active_profile.json`
//!   model:   next to the model file, extension swapped to `.json`
//!   chat:    next to the chat file, `<chat>.settings.json`
//!
//! Every layer document is `{"settings": {...}}`. Writing one layer never
//! touches another.

use super::schema::{GpuLayers, Scope, Setting, SettingValue};
use crate::persist::{self, PersistError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

pub const DEFAULT_PROFILE: &str = "default";

static PROFILE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9 _.-]{0,63}$").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Setting '{setting}' is not allowed in the {scope} scope")]
    IllegalScope { setting: Setting, scope: Scope },

    #[error("'{value}' is not a valid value for '{setting}'")]
    InvalidValue { setting: Setting, value: String },

    #[error("The {0} scope has no override flag")]
    NoOverrideFlag(Scope),

    #[error("Invalid profile name '{0}'")]
    InvalidProfileName(String),

    #[error("Profile '{0}' already exists")]
    ProfileExists(String),

    #[error("Profile '{0}' does not exist")]
    NoSuchProfile(String),

    #[error("Cannot delete the active profile '{0}'")]
    ProfileActive(String),

    #[error(transparent)]
    Persist(#[from] PersistError),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LayerDocument {
    #[serde(default)]
    settings: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ActiveProfileDocument {
    #[serde(default)]
    active: String,
}

/// One persisted settings layer.
#[derive(Debug, Clone)]
pub struct SettingsLayer {
    scope: Scope,
    file: PathBuf,
    values: BTreeMap<Setting, SettingValue>,
    override_enabled: bool,
}

impl SettingsLayer {
    /// Fresh layer holding the scope's declared defaults. The profile scope
    /// carries every setting; model and chat layers start empty and disabled.
    pub fn with_defaults(scope: Scope, file: PathBuf) -> Self {
        let values = match scope {
            Scope::Profile => Setting::ALL
                .into_iter()
                .map(|s| (s, s.default_value()))
                .collect(),
            Scope::Model | Scope::Chat => BTreeMap::new(),
        };
        Self {
            scope,
            file,
            values,
            override_enabled: false,
        }
    }

    /// Load a layer from `file`. Missing or corrupt files reset to defaults;
    /// illegal keys and ill-typed values are dropped. Either way the cleaned
    /// layer is written straight back.
    pub fn load(scope: Scope, file: PathBuf) -> Self {
        let doc = match persist::read_json::<LayerDocument>(&file) {
            Ok(Some(doc)) => doc,
            Ok(None) => {
                log::info!("[SETTINGS] No {} settings at {} — seeding defaults", scope, file.display());
                return Self::seeded(scope, file);
            }
            Err(e) => {
                log::warn!("[SETTINGS] {} — resetting {} settings", e, scope);
                return Self::seeded(scope, file);
            }
        };

        let mut layer = Self::with_defaults(scope, file);
        layer.values.clear();
        let mut dirty = false;

        for (key, raw) in doc.settings {
            if Some(key.as_str()) == scope.override_flag() {
                match raw.as_bool() {
                    Some(flag) => layer.override_enabled = flag,
                    None => dirty = true,
                }
                continue;
            }

            let Some(setting) = Setting::from_key(&key) else {
                log::warn!("[SETTINGS] Dropping unknown key '{}' from {}", key, layer.file.display());
                dirty = true;
                continue;
            };
            if !setting.is_legal_in(scope) {
                log::warn!("[SETTINGS] Dropping '{}': not legal in the {} scope", key, scope);
                dirty = true;
                continue;
            }

            let value = serde_json::from_value::<SettingValue>(raw)
                .ok()
                .and_then(|v| setting.coerce(v));
            match value {
                Some(v) => {
                    layer.values.insert(setting, v);
                }
                None => {
                    log::warn!("[SETTINGS] Dropping ill-typed value for '{}'", key);
                    dirty = true;
                }
            }
        }

        if scope == Scope::Profile {
            let before = layer.values.len();
            for s in Setting::ALL {
                layer.values.entry(s).or_insert_with(|| s.default_value());
            }
            dirty |= layer.values.len() != before;
        }

        if dirty {
            layer.persist_logged();
        }
        layer
    }

    fn seeded(scope: Scope, file: PathBuf) -> Self {
        let layer = Self::with_defaults(scope, file);
        layer.persist_logged();
        layer
    }

    fn persist_logged(&self) {
        if let Err(e) = self.save() {
            log::error!("[SETTINGS] {}", e);
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn get(&self, setting: Setting) -> Option<&SettingValue> {
        self.values.get(&setting)
    }

    pub fn values(&self) -> impl Iterator<Item = (Setting, &SettingValue)> {
        self.values.iter().map(|(s, v)| (*s, v))
    }

    /// Whether this layer participates in the merge. The profile layer always
    /// does; the others only when their override flag is set.
    pub fn is_active(&self) -> bool {
        self.scope == Scope::Profile || self.override_enabled
    }

    pub fn override_enabled(&self) -> bool {
        self.override_enabled
    }

    pub fn set(&mut self, setting: Setting, value: SettingValue) -> Result<(), SettingsError> {
        if !setting.is_legal_in(self.scope) {
            return Err(SettingsError::IllegalScope {
                setting,
                scope: self.scope,
            });
        }
        let raw = value.as_text();
        let value = setting.coerce(value).ok_or(SettingsError::InvalidValue {
            setting,
            value: raw,
        })?;
        self.values.insert(setting, value);
        self.save()
    }

    /// Remove a key so the merge falls through to the next layer. Profile
    /// keys reset to their default instead.
    pub fn unset(&mut self, setting: Setting) -> Result<(), SettingsError> {
        if self.scope == Scope::Profile {
            self.values.insert(setting, setting.default_value());
        } else {
            self.values.remove(&setting);
        }
        self.save()
    }

    pub fn set_override(&mut self, enabled: bool) -> Result<(), SettingsError> {
        if self.scope.override_flag().is_none() {
            return Err(SettingsError::NoOverrideFlag(self.scope));
        }
        self.override_enabled = enabled;
        self.save()
    }

    pub fn save(&self) -> Result<(), SettingsError> {
        let mut doc = LayerDocument::default();
        if let Some(flag) = self.scope.override_flag() {
            doc.settings
                .insert(flag.to_string(), serde_json::Value::Bool(self.override_enabled));
        }
        for (setting, value) in &self.values {
            let raw = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
            doc.settings.insert(setting.key().to_string(), raw);
        }
        persist::write_json(&self.file, &doc)?;
        Ok(())
    }
}

/// The merged view for one launch or request. Every setting is present.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedSettings {
    values: BTreeMap<Setting, (SettingValue, Scope)>,
}

impl MergedSettings {
    pub fn get(&self, setting: Setting) -> SettingValue {
        self.values
            .get(&setting)
            .map(|(v, _)| v.clone())
            .unwrap_or_else(|| setting.default_value())
    }

    /// Which layer supplied `setting`.
    pub fn source(&self, setting: Setting) -> Scope {
        self.values
            .get(&setting)
            .map(|(_, s)| *s)
            .unwrap_or(Scope::Profile)
    }

    pub fn text(&self, setting: Setting) -> String {
        self.get(setting).as_text()
    }

    pub fn integer(&self, setting: Setting) -> i64 {
        self.get(setting)
            .as_integer()
            .or_else(|| setting.default_value().as_integer())
            .unwrap_or(0)
    }

    pub fn gpu_layers(&self) -> GpuLayers {
        GpuLayers::parse(&self.get(Setting::GpuLayers)).unwrap_or(GpuLayers::Auto)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Setting, &SettingValue, Scope)> {
        self.values.iter().map(|(k, (v, s))| (*k, v, *s))
    }
}

/// Merge layers in priority order chat → model → profile.
///
/// A layer supplies a setting only if the setting is legal in its scope, the
/// layer is active, and the key is present. The profile layer is the
/// guaranteed fallback; a hole there falls back to the schema default.
pub fn merge(
    profile: &SettingsLayer,
    model: Option<&SettingsLayer>,
    chat: Option<&SettingsLayer>,
) -> MergedSettings {
    let layers: Vec<&SettingsLayer> = [chat, model, Some(profile)].into_iter().flatten().collect();

    let values = Setting::ALL
        .into_iter()
        .map(|setting| {
            let found = layers.iter().find_map(|layer| {
                if !setting.is_legal_in(layer.scope) || !layer.is_active() {
                    return None;
                }
                layer.get(setting).map(|v| (v.clone(), layer.scope))
            });
            let entry = found.unwrap_or_else(|| (setting.default_value(), Scope::Profile));
            (setting, entry)
        })
        .collect();

    MergedSettings { values }
}

/// Addresses one layer instance.
#[derive(Debug, Clone, Copy)]
pub enum LayerRef<'a> {
    Profile,
    Model(&'a Path),
    Chat(&'a str),
}

/// Settings file for a model: the model path with its extension swapped.
pub fn model_settings_path(model_path: &Path) -> PathBuf {
    model_path.with_extension("json")
}

/// Settings file for a chat: `<stem>.settings.json` beside the chat file.
pub fn chat_settings_path(chats_dir: &Path, chat_id: &str) -> PathBuf {
    let stem = Path::new(chat_id)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| chat_id.to_string());
    chats_dir.join(format!("{}.settings.json", stem))
}

/// Owns the active profile plus cached model and chat layers.
#[derive(Debug)]
pub struct SettingsStore {
    profiles_dir: PathBuf,
    active_file: PathBuf,
    chats_dir: PathBuf,
    active_profile: String,
    profile: SettingsLayer,
    models: HashMap<PathBuf, SettingsLayer>,
    chats: HashMap<String, SettingsLayer>,
}

impl SettingsStore {
    pub fn open(profiles_dir: &Path, active_file: &Path, chats_dir: &Path) -> Self {
        let active = match persist::read_json::<ActiveProfileDocument>(active_file) {
            Ok(Some(doc)) if PROFILE_NAME.is_match(&doc.active) => doc.active,
            Ok(_) => DEFAULT_PROFILE.to_string(),
            Err(e) => {
                log::warn!("[SETTINGS] {} — falling back to '{}'", e, DEFAULT_PROFILE);
                DEFAULT_PROFILE.to_string()
            }
        };

        let profile = SettingsLayer::load(Scope::Profile, profile_file(profiles_dir, &active));
        let store = Self {
            profiles_dir: profiles_dir.to_path_buf(),
            active_file: active_file.to_path_buf(),
            chats_dir: chats_dir.to_path_buf(),
            active_profile: active,
            profile,
            models: HashMap::new(),
            chats: HashMap::new(),
        };
        if let Err(e) = store.save_active() {
            log::error!("[SETTINGS] {}", e);
        }
        log::info!("[SETTINGS] Active profile: {}", store.active_profile);
        store
    }

    pub fn active_profile(&self) -> &str {
        &self.active_profile
    }

    /// Resolve the merged view for a (chat, model) pair under the active
    /// profile. Either side may be absent.
    pub fn resolve(&mut self, chat_id: Option<&str>, model_path: Option<&Path>) -> MergedSettings {
        if let Some(path) = model_path {
            self.ensure_model(path);
        }
        if let Some(id) = chat_id {
            self.ensure_chat(id);
        }
        let model = model_path.and_then(|p| self.models.get(p));
        let chat = chat_id.and_then(|id| self.chats.get(id));
        merge(&self.profile, model, chat)
    }

    /// Mutable access to one layer, loading it on first use.
    pub fn layer(&mut self, which: LayerRef<'_>) -> &mut SettingsLayer {
        match which {
            LayerRef::Profile => &mut self.profile,
            LayerRef::Model(path) => self.ensure_model(path),
            LayerRef::Chat(id) => self.ensure_chat(id),
        }
    }

    fn ensure_model(&mut self, path: &Path) -> &mut SettingsLayer {
        self.models
            .entry(path.to_path_buf())
            .or_insert_with(|| SettingsLayer::load(Scope::Model, model_settings_path(path)))
    }

    fn ensure_chat(&mut self, chat_id: &str) -> &mut SettingsLayer {
        let chats_dir = &self.chats_dir;
        self.chats
            .entry(chat_id.to_string())
            .or_insert_with(|| SettingsLayer::load(Scope::Chat, chat_settings_path(chats_dir, chat_id)))
    }

    /// Drop a chat's layer and delete its file.
    pub fn forget_chat(&mut self, chat_id: &str) -> Result<(), SettingsError> {
        self.chats.remove(chat_id);
        persist::remove_file(&chat_settings_path(&self.chats_dir, chat_id))?;
        Ok(())
    }

    /// Drop a model's cached layer. The file beside the model is kept so
    /// re-adding the model restores its settings.
    pub fn forget_model(&mut self, model_path: &Path) {
        self.models.remove(model_path);
    }

    /// Names of all stored profiles, sorted.
    pub fn list_profiles(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.profiles_dir)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.extension().map(|x| x == "json").unwrap_or(false))
                    .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
                    .collect()
            })
            .unwrap_or_default();
        if !names.contains(&self.active_profile) {
            names.push(self.active_profile.clone());
        }
        names.sort();
        names
    }

    /// Create a new profile seeded with defaults.
    pub fn create_profile(&mut self, name: &str) -> Result<(), SettingsError> {
        let file = self.new_profile_file(name)?;
        SettingsLayer::with_defaults(Scope::Profile, file).save()?;
        log::info!("[SETTINGS] Created profile '{}'", name);
        Ok(())
    }

    /// Copy an existing profile's values under a new name.
    pub fn duplicate_profile(&mut self, from: &str, to: &str) -> Result<(), SettingsError> {
        let source_file = self.existing_profile_file(from)?;
        let file = self.new_profile_file(to)?;
        let mut copy = SettingsLayer::load(Scope::Profile, source_file);
        copy.file = file;
        copy.save()?;
        log::info!("[SETTINGS] Duplicated profile '{}' as '{}'", from, to);
        Ok(())
    }

    /// Make `name` the active profile.
    pub fn switch_profile(&mut self, name: &str) -> Result<(), SettingsError> {
        let file = self.existing_profile_file(name)?;
        self.profile = SettingsLayer::load(Scope::Profile, file);
        self.active_profile = name.to_string();
        self.save_active()?;
        log::info!("[SETTINGS] Switched to profile '{}'", name);
        Ok(())
    }

    pub fn delete_profile(&mut self, name: &str) -> Result<(), SettingsError> {
        if name == self.active_profile {
            return Err(SettingsError::ProfileActive(name.to_string()));
        }
        let file = self.existing_profile_file(name)?;
        persist::remove_file(&file)?;
        log::info!("[SETTINGS] Deleted profile '{}'", name);
        Ok(())
    }

    fn existing_profile_file(&self, name: &str) -> Result<PathBuf, SettingsError> {
        let file = checked_profile_file(&self.profiles_dir, name)?;
        if !file.exists() {
            return Err(SettingsError::NoSuchProfile(name.to_string()));
        }
        Ok(file)
    }

    fn new_profile_file(&self, name: &str) -> Result<PathBuf, SettingsError> {
        let file = checked_profile_file(&self.profiles_dir, name)?;
        if file.exists() {
            return Err(SettingsError::ProfileExists(name.to_string()));
        }
        Ok(file)
    }

    fn save_active(&self) -> Result<(), SettingsError> {
        let doc = ActiveProfileDocument {
            active: self.active_profile.clone(),
        };
        persist::write_json(&self.active_file, &doc)?;
        Ok(())
    }
}

/// Profile names never leave `profiles/`, so only well-formed names map to a file.
fn checked_profile_file(dir: &Path, name: &str) -> Result<PathBuf, SettingsError> {
    if !PROFILE_NAME.is_match(name) {
        return Err(SettingsError::InvalidProfileName(name.to_string()));
    }
    Ok(profile_file(dir, name))
}

fn profile_file(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.json", name))
}
