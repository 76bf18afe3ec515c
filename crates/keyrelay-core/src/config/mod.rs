use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::credentials::DEFAULT_COOLDOWN_SECS;
use crate::error::ConfigError;

/// Root configuration for keyrelay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub defaults: Defaults,
    pub providers: Vec<ProviderSettings>,
    pub image_providers: Vec<ProviderSettings>,
    pub credentials: CredentialsConfig,
    pub selector: SelectorConfig,
    pub gateway: GatewayConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            defaults: Defaults::default(),
            providers: vec![
                ProviderSettings::new("llm7", ProviderKind::OpenAiCompat, "gpt-4o-mini", 1),
                ProviderSettings::new("gemini", ProviderKind::Gemini, "gemini-2.0-flash", 2),
            ],
            image_providers: vec![
                ProviderSettings::new("fal-flux", ProviderKind::Fal, "fal-ai/flux/schnell", 1),
                ProviderSettings::new("fal-sdxl", ProviderKind::Fal, "fal-ai/fast-sdxl", 2),
            ],
            credentials: CredentialsConfig::default(),
            selector: SelectorConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl Config {
    /// Reject configurations the orchestrator cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for p in self.providers.iter().chain(self.image_providers.iter()) {
            if p.name.trim().is_empty() {
                return Err(ConfigError::Invalid("provider name must not be empty".to_string()));
            }
            if !names.insert(p.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate provider name: {}", p.name)));
            }
            if p.timeout_ms == 0 {
                return Err(ConfigError::Invalid(format!("provider {} has a zero timeout", p.name)));
            }
        }
        if let Some(p) = self.providers.iter().find(|p| p.kind == ProviderKind::Fal) {
            return Err(ConfigError::Invalid(format!(
                "{} is an image provider; list it under imageProviders",
                p.name
            )));
        }
        if let Some(p) = self.image_providers.iter().find(|p| p.kind != ProviderKind::Fal) {
            return Err(ConfigError::Invalid(format!(
                "{} cannot generate images; only fal providers belong under imageProviders",
                p.name
            )));
        }
        if self.credentials.cooldown_secs < 0 {
            return Err(ConfigError::Invalid("cooldownSecs must not be negative".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Defaults {
    pub model: String,
    pub code_model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub code_temperature: f64,
    pub image_width: u32,
    pub image_height: u32,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            code_model: "gpt-4o-mini".to_string(),
            max_tokens: 2048,
            temperature: 0.7,
            code_temperature: 0.2,
            image_width: 1024,
            image_height: 1024,
        }
    }
}

/// Which vendor wire format a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// OpenAI-style chat completions (LLM7 and compatible gateways).
    OpenAiCompat,
    Gemini,
    /// fal.ai image models.
    Fal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderSettings {
    pub name: String,
    pub kind: ProviderKind,
    pub api_base: Option<String>,
    pub default_model: String,
    /// Lower is tried first.
    pub priority: u32,
    pub enabled: bool,
    pub timeout_ms: u64,
    /// Extra attempts on this provider after rotating to a fresh key.
    pub max_retries: u32,
    pub api_keys: Vec<String>,
}

impl ProviderSettings {
    pub fn new(name: &str, kind: ProviderKind, default_model: &str, priority: u32) -> Self {
        Self {
            name: name.to_string(),
            kind,
            default_model: default_model.to_string(),
            priority,
            ..Self::default()
        }
    }

    /// Environment variables holding keys for this provider, most specific first.
    pub fn env_key_vars(&self) -> Vec<String> {
        let own = format!("{}_API_KEY", self.name.to_uppercase().replace(['-', '.'], "_"));
        let mut vars = vec![own];
        let aliases: &[&str] = match self.kind {
            ProviderKind::OpenAiCompat => &[],
            ProviderKind::Gemini => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
            ProviderKind::Fal => &["FAL_KEY", "FAL_API_KEY"],
        };
        for alias in aliases {
            if !vars.iter().any(|v| v == alias) {
                vars.push(alias.to_string());
            }
        }
        vars
    }
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: ProviderKind::OpenAiCompat,
            api_base: None,
            default_model: String::new(),
            priority: 100,
            enabled: true,
            timeout_ms: 30_000,
            max_retries: 1,
            api_keys: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CredentialsConfig {
    pub cooldown_secs: i64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
        }
    }
}

/// Settings for the multi-key "instant" mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SelectorConfig {
    /// Chat provider whose keys are fanned out.
    pub provider: String,
    pub timeout_ms: u64,
    pub max_tokens: u32,
    /// Instruction prefixes, paired with keys in order.
    pub framings: Vec<String>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            provider: "gemini".to_string(),
            timeout_ms: 2_000,
            max_tokens: 256,
            framings: vec![
                "Answer directly and concisely.".to_string(),
                "Give a clear, complete answer in one or two sentences.".to_string(),
                "Respond helpfully, focusing on the key facts.".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

// ====== Config loading/saving ======

/// Load configuration from environment variables.
///
/// Priority:
/// 1. `KEYRELAY_CONFIG` env var holding the full JSON config
/// 2. File (`~/.keyrelay/config.json`) with provider keys and
///    `KEYRELAY_MODEL` overlaid from the environment
pub fn load_config_from_env() -> Config {
    load_config_with(|name| std::env::var(name).ok())
}

/// [`load_config_from_env`] with an injectable variable lookup.
pub fn load_config_with<F>(lookup: F) -> Config
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(json) = lookup("KEYRELAY_CONFIG") {
        match serde_json::from_str::<Config>(&json) {
            Ok(config) => return config,
            Err(e) => {
                tracing::warn!("Failed to parse KEYRELAY_CONFIG: {}", e);
            }
        }
    }

    let mut cfg = load_config(None);
    overlay_env(&mut cfg, &lookup);
    cfg
}

/// Append keys found in the environment to every provider and apply
/// `KEYRELAY_MODEL`.
pub fn overlay_env<F>(cfg: &mut Config, lookup: &F)
where
    F: Fn(&str) -> Option<String>,
{
    for provider in cfg.providers.iter_mut().chain(cfg.image_providers.iter_mut()) {
        let vars = provider.env_key_vars();
        let names: Vec<&str> = vars.iter().map(String::as_str).collect();
        for key in read_keys_multi(&names, lookup) {
            if !provider.api_keys.contains(&key) {
                provider.api_keys.push(key);
            }
        }
    }

    if let Some(model) = lookup("KEYRELAY_MODEL").filter(|m| !m.is_empty()) {
        cfg.defaults.model = model;
    }
}

/// Collect keys from `PREFIX`, `PREFIX_2` .. `PREFIX_10`. Each value may be a
/// comma separated list. Order is kept, duplicates dropped.
pub fn read_keys_multi<F>(prefixes: &[&str], lookup: &F) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut keys = Vec::new();
    let mut seen = HashSet::new();
    for prefix in prefixes {
        let names = std::iter::once(prefix.to_string())
            .chain((2..=10).map(|i| format!("{prefix}_{i}")));
        for name in names {
            let Some(value) = lookup(&name) else { continue };
            for key in value.split(',').map(str::trim) {
                if !key.is_empty() && seen.insert(key.to_string()) {
                    keys.push(key.to_string());
                }
            }
        }
    }
    keys
}

/// Get the default configuration file path.
pub fn get_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".keyrelay")
        .join("config.json")
}

/// Load configuration from file or create default.
pub fn load_config(config_path: Option<&Path>) -> Config {
    let path = config_path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(get_config_path);

    if path.exists() {
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Config>(&content) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Failed to parse config from {}: {}", path.display(), e);
                    tracing::warn!("Using default configuration.");
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config from {}: {}", path.display(), e);
                tracing::warn!("Using default configuration.");
            }
        }
    }

    Config::default()
}

/// Save configuration to file.
pub fn save_config(config: &Config, config_path: Option<&Path>) -> Result<(), ConfigError> {
    let path = config_path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(get_config_path);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    }

    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, json).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    Ok(())
}
