//! Settings schema: every setting's key, legal scopes, kind and default.
//!
//! The table is static and checked once at startup by [`validate`]. Nothing
//! else in the crate decides where a setting may live.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A settings layer, in ascending priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    Profile,
    Model,
    Chat,
}

impl Scope {
    /// Key of the boolean flag that switches this scope into the merge.
    /// The profile scope is always active and has no flag.
    pub fn override_flag(self) -> Option<&'static str> {
        match self {
            Scope::Profile => None,
            Scope::Model => Some("model_settings"),
            Scope::Chat => Some("chat_settings"),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scope::Profile => "profile",
            Scope::Model => "model",
            Scope::Chat => "chat",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    Text,
    Integer,
    /// `Auto`, `All`, or a literal layer count.
    GpuLayers,
}

/// A stored setting value. Untagged so files read `"port": 5175`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Integer(i64),
    Text(String),
}

impl SettingValue {
    pub fn as_text(&self) -> String {
        match self {
            SettingValue::Bool(b) => b.to_string(),
            SettingValue::Integer(i) => i.to_string(),
            SettingValue::Text(s) => s.clone(),
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            SettingValue::Integer(i) => Some(*i),
            SettingValue::Text(s) => s.trim().parse().ok(),
            SettingValue::Bool(_) => None,
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Setting {
    Address,
    Port,
    ServerPath,
    Threads,
    GpuLayers,
    BatchSize,
    ContextSize,
    SystemPrompt,
}

struct SettingSpec {
    setting: Setting,
    key: &'static str,
    scopes: &'static [Scope],
    kind: SettingKind,
    default: &'static str,
}

use Scope::{Chat, Model, Profile};

static SCHEMA: &[SettingSpec] = &[
    SettingSpec {
        setting: Setting::Address,
        key: "address",
        scopes: &[Profile],
        kind: SettingKind::Text,
        default: "127.0.0.1",
    },
    SettingSpec {
        setting: Setting::Port,
        key: "port",
        scopes: &[Profile],
        kind: SettingKind::Integer,
        default: "5175",
    },
    SettingSpec {
        setting: Setting::ServerPath,
        key: "server_path",
        scopes: &[Profile],
        kind: SettingKind::Text,
        default: "llama-server",
    },
    SettingSpec {
        setting: Setting::Threads,
        key: "threads",
        scopes: &[Profile, Model],
        kind: SettingKind::Integer,
        default: "0",
    },
    SettingSpec {
        setting: Setting::GpuLayers,
        key: "gpu_layers",
        scopes: &[Profile, Model],
        kind: SettingKind::GpuLayers,
        default: "Auto",
    },
    SettingSpec {
        setting: Setting::BatchSize,
        key: "batch_size",
        scopes: &[Profile, Model],
        kind: SettingKind::Integer,
        default: "512",
    },
    SettingSpec {
        setting: Setting::ContextSize,
        key: "context_size",
        scopes: &[Profile, Model],
        kind: SettingKind::Integer,
        default: "0",
    },
    SettingSpec {
        setting: Setting::SystemPrompt,
        key: "system_prompt",
        scopes: &[Profile, Model, Chat],
        kind: SettingKind::Text,
        default: crate::chat::DEFAULT_SYSTEM_PROMPT,
    },
];

impl Setting {
    pub const ALL: [Setting; 8] = [
        Setting::Address,
        Setting::Port,
        Setting::ServerPath,
        Setting::Threads,
        Setting::GpuLayers,
        Setting::BatchSize,
        Setting::ContextSize,
        Setting::SystemPrompt,
    ];

    fn spec(self) -> &'static SettingSpec {
        // validate() guarantees every variant has exactly one row.
        SCHEMA
            .iter()
            .find(|s| s.setting == self)
            .unwrap_or(&SCHEMA[0])
    }

    pub fn key(self) -> &'static str {
        self.spec().key
    }

    pub fn kind(self) -> SettingKind {
        self.spec().kind
    }

    pub fn scopes(self) -> &'static [Scope] {
        self.spec().scopes
    }

    pub fn is_legal_in(self, scope: Scope) -> bool {
        self.scopes().contains(&scope)
    }

    pub fn from_key(key: &str) -> Option<Setting> {
        SCHEMA.iter().find(|s| s.key == key).map(|s| s.setting)
    }

    /// Settings legal in `scope`, in schema order.
    pub fn legal_in(scope: Scope) -> impl Iterator<Item = Setting> {
        Setting::ALL.into_iter().filter(move |s| s.is_legal_in(scope))
    }

    pub fn default_value(self) -> SettingValue {
        let spec = self.spec();
        match spec.kind {
            SettingKind::Integer => spec
                .default
                .parse()
                .map(SettingValue::Integer)
                .unwrap_or_else(|_| SettingValue::Text(spec.default.to_string())),
            SettingKind::Text | SettingKind::GpuLayers => SettingValue::Text(spec.default.to_string()),
        }
    }

    /// Bring `value` into this setting's canonical representation, or `None`
    /// when it is not a legal value for the setting's kind.
    pub fn coerce(self, value: SettingValue) -> Option<SettingValue> {
        match (self.kind(), value) {
            (SettingKind::Text, SettingValue::Text(s)) => Some(SettingValue::Text(s)),
            (SettingKind::Text, SettingValue::Integer(i)) => Some(SettingValue::Text(i.to_string())),
            (SettingKind::Integer, v) => v.as_integer().map(SettingValue::Integer),
            (SettingKind::GpuLayers, v) => {
                GpuLayers::parse(&v).map(|g| SettingValue::Text(g.to_string()))
            }
            (SettingKind::Text, SettingValue::Bool(_)) => None,
        }
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Resolved meaning of a `gpu_layers` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuLayers {
    Auto,
    All,
    Count(u32),
}

/// Layer count used for `Auto`/`All` when the model header gave none.
/// llama.cpp clamps the offload count to the layers the model actually has.
pub const UNKNOWN_MODEL_GPU_LAYERS: u32 = 999;

impl GpuLayers {
    pub fn parse(value: &SettingValue) -> Option<GpuLayers> {
        match value {
            SettingValue::Integer(i) => u32::try_from(*i).ok().map(GpuLayers::Count),
            SettingValue::Text(s) => {
                let s = s.trim();
                if s.eq_ignore_ascii_case("auto") {
                    Some(GpuLayers::Auto)
                } else if s.eq_ignore_ascii_case("all") {
                    Some(GpuLayers::All)
                } else {
                    s.parse().ok().map(GpuLayers::Count)
                }
            }
            SettingValue::Bool(_) => None,
        }
    }

    /// Layer count passed to the server. `Auto` and `All` offload every
    /// block plus the output layer.
    pub fn resolve(self, model_layers: Option<u32>) -> u32 {
        match self {
            GpuLayers::Auto | GpuLayers::All => model_layers
                .map(|n| n.saturating_add(1))
                .unwrap_or(UNKNOWN_MODEL_GPU_LAYERS),
            GpuLayers::Count(n) => n,
        }
    }
}

impl fmt::Display for GpuLayers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuLayers::Auto => f.write_str("Auto"),
            GpuLayers::All => f.write_str("All"),
            GpuLayers::Count(n) => write!(f, "{}", n),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SchemaError {
    #[error("Setting {0:?} has no schema row")]
    MissingRow(Setting),

    #[error("Setting {0:?} has more than one schema row")]
    DuplicateRow(Setting),

    #[error("Setting key '{0}' is declared twice")]
    DuplicateKey(&'static str),

    #[error("Setting '{0}' is not legal in the profile scope")]
    NotInProfile(&'static str),

    #[error("Default for '{0}' does not match its kind")]
    BadDefault(&'static str),

    #[error("Setting key '{0}' collides with an override flag")]
    FlagCollision(&'static str),
}

/// Check the schema table once at startup.
///
/// Every setting must have one row, a unique key, be legal in the profile
/// scope (the guaranteed fallback) and carry a default of its own kind.
pub fn validate() -> Result<(), SchemaError> {
    for setting in Setting::ALL {
        match SCHEMA.iter().filter(|s| s.setting == setting).count() {
            0 => return Err(SchemaError::MissingRow(setting)),
            1 => {}
            _ => return Err(SchemaError::DuplicateRow(setting)),
        }
    }

    for (i, spec) in SCHEMA.iter().enumerate() {
        if SCHEMA[..i].iter().any(|other| other.key == spec.key) {
            return Err(SchemaError::DuplicateKey(spec.key));
        }
        if !spec.scopes.contains(&Scope::Profile) {
            return Err(SchemaError::NotInProfile(spec.key));
        }
        if [Scope::Model, Scope::Chat]
            .iter()
            .any(|s| s.override_flag() == Some(spec.key))
        {
            return Err(SchemaError::FlagCollision(spec.key));
        }
        let default = spec.setting.default_value();
        if spec.setting.coerce(default.clone()) != Some(default) {
            return Err(SchemaError::BadDefault(spec.key));
        }
    }

    Ok(())
}
