//! Configuration system for shellgate.
//!
//! Supports layered configuration from multiple sources:
//! 1. Environment variables (highest priority)
//! 2. Project config (.shellgate.toml in cwd or an ancestor, up to the repo root)
//! 3. User config (~/.config/shellgate/config.toml)
//! 4. System config (/etc/shellgate/config.toml)
//! 5. Compiled defaults (lowest priority)
//!
//! `SHELLGATE_CONFIG` names a single file that replaces layers 2-4.
//!
//! Layers are merged as TOML values: tables merge key by key, arrays
//! concatenate, scalars from the higher layer win. The merged value is kept
//! next to the typed [`Config`] so callers can do nested-path lookups.

use crate::error_codes::GateError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

/// Environment variable prefix for all config options.
pub const ENV_PREFIX: &str = "SHELLGATE";

/// Default config file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Project-level config file name.
const PROJECT_CONFIG_NAME: &str = ".shellgate.toml";

/// Default remote classifier endpoint.
pub const DEFAULT_ANALYSIS_URL: &str = "http://localhost:8765/classify/command";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub cache: CacheConfig,
    pub redaction: RedactionSettings,
    pub bypass: BypassConfig,
    pub approval: ApprovalConfig,
    pub auth_codes: AuthCodeConfig,
    pub integrity: IntegrityConfig,
    pub analysis: AnalysisConfig,
    pub lists: ListsConfig,
    pub logging: LoggingConfig,
}

/// How strictly unclassified commands are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Enforcement {
    /// Unknown commands are analyzed; approval depends on the verdict.
    #[default]
    Standard,
    /// Unknown commands always require approval.
    Strict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub enforcement: Enforcement,
    /// Color output mode: "auto", "always", "never".
    pub color: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            enforcement: Enforcement::Standard,
            color: "auto".to_string(),
        }
    }
}

/// Fast-path cache limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub max_entries: usize,
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            max_entries: 1000,
            sweep_interval_secs: 60,
        }
    }
}

/// A caller-supplied redaction rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomPattern {
    pub name: String,
    pub regex: String,
    #[serde(default = "default_custom_replacement")]
    pub replacement: String,
    #[serde(default = "default_custom_priority")]
    pub priority: u8,
}

fn default_custom_replacement() -> String {
    "[REDACTED]".to_string()
}

const fn default_custom_priority() -> u8 {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionSettings {
    /// Keep the first and last four characters of key-like matches.
    pub mask: bool,
    /// Also redact email addresses.
    pub redact_emails: bool,
    /// Maximum number of cached redaction results.
    pub cache_size: usize,
    pub patterns: Vec<CustomPattern>,
}

impl Default for RedactionSettings {
    fn default() -> Self {
        Self {
            mask: false,
            redact_emails: false,
            cache_size: 256,
            patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BypassConfig {
    /// Signals strictly above this confidence abort the interception.
    pub threshold: f64,
    /// Maximum ancestry depth to walk.
    pub max_depth: usize,
    /// Parent processes younger than this are suspicious.
    pub parent_uptime_floor_ms: u64,
}

impl Default for BypassConfig {
    fn default() -> Self {
        Self {
            threshold: 0.8,
            max_depth: 16,
            parent_uptime_floor_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    pub timeout_secs: u64,
    /// Responses faster than this are treated as automation.
    pub min_response_ms: u64,
    /// Word required for critical-risk approvals.
    pub confirm_word: String,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            min_response_ms: 75,
            confirm_word: "confirm".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthCodeConfig {
    pub ttl_secs: u64,
    /// JSONL store path; defaults to the user data directory.
    pub store: Option<String>,
    pub reap_interval_secs: u64,
}

impl Default for AuthCodeConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            store: None,
            reap_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    pub window_secs: u64,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self { window_secs: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub enabled: bool,
    pub url: String,
    /// Per-attempt timeout.
    pub timeout_ms: u64,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: DEFAULT_ANALYSIS_URL.to_string(),
            timeout_ms: 5_000,
            max_retries: 2,
            base_delay_ms: 200,
            max_delay_ms: 2_000,
        }
    }
}

/// Extra command names appended to the built-in tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListsConfig {
    pub safe: Vec<String>,
    pub dangerous: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. "warn" or "shellgate=debug".
    pub level: String,
    /// Append logs here instead of stderr.
    pub file: Option<String>,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            file: None,
            format: LogFormat::Text,
        }
    }
}

/// Kind of value an environment override carries.
#[derive(Clone, Copy)]
enum EnvKind {
    Str,
    Bool,
    Int,
    Float,
}

/// `SHELLGATE_*` variables and the config paths they override.
const ENV_OVERRIDES: &[(&str, &str, EnvKind)] = &[
    ("ENFORCEMENT", "general.enforcement", EnvKind::Str),
    ("COLOR", "general.color", EnvKind::Str),
    ("ANALYSIS_ENABLED", "analysis.enabled", EnvKind::Bool),
    ("ANALYSIS_URL", "analysis.url", EnvKind::Str),
    ("ANALYSIS_TIMEOUT_MS", "analysis.timeout_ms", EnvKind::Int),
    ("APPROVAL_TIMEOUT", "approval.timeout_secs", EnvKind::Int),
    ("BYPASS_THRESHOLD", "bypass.threshold", EnvKind::Float),
    ("AUTH_STORE", "auth_codes.store", EnvKind::Str),
    ("AUTH_TTL", "auth_codes.ttl_secs", EnvKind::Int),
    ("LOG", "logging.level", EnvKind::Str),
    ("LOG_FILE", "logging.file", EnvKind::Str),
    ("LOG_FORMAT", "logging.format", EnvKind::Str),
];

impl Config {
    /// Load configuration for the current process.
    pub fn load() -> Result<Self, GateError> {
        Ok(ConfigLoader::from_process().load()?.config)
    }

    /// Load configuration from a specific file over the compiled defaults.
    pub fn load_from_file(path: &Path) -> Result<Self, GateError> {
        let value = read_layer(path)?.unwrap_or_else(empty_table);
        let mut merged = defaults_value();
        merge_values(&mut merged, value);
        typed(&merged, &path.display().to_string())
    }

    /// Render the configuration as TOML.
    #[must_use]
    pub fn to_toml_string(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

/// Result of one load: the typed config, the merged value, and the files read.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub merged: toml::Value,
    pub sources: Vec<PathBuf>,
}

/// Resolves and merges config layers.
///
/// Everything a load depends on is captured up front so tests can point it at
/// temp directories and a synthetic environment.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    env: HashMap<String, String>,
    cwd: Option<PathBuf>,
    user_dir: Option<PathBuf>,
    system_dir: Option<PathBuf>,
}

impl ConfigLoader {
    #[must_use]
    pub fn from_process() -> Self {
        Self {
            env: std::env::vars().collect(),
            cwd: std::env::current_dir().ok(),
            user_dir: dirs::config_dir().map(|d| d.join("shellgate")),
            system_dir: Some(PathBuf::from("/etc/shellgate")),
        }
    }

    /// A loader with no file layers and no environment.
    #[must_use]
    pub fn isolated() -> Self {
        Self {
            env: HashMap::new(),
            cwd: None,
            user_dir: None,
            system_dir: None,
        }
    }

    #[must_use]
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn with_user_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.user_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_system_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.system_dir = Some(dir.into());
        self
    }

    /// Candidate files, lowest priority first.
    #[must_use]
    pub fn layer_paths(&self) -> Vec<PathBuf> {
        if let Some(explicit) = self.env.get(&format!("{ENV_PREFIX}_CONFIG")) {
            return vec![PathBuf::from(explicit)];
        }
        let mut paths = Vec::new();
        if let Some(dir) = &self.system_dir {
            paths.push(dir.join(CONFIG_FILE_NAME));
        }
        if let Some(dir) = &self.user_dir {
            paths.push(dir.join(CONFIG_FILE_NAME));
        }
        if let Some(project) = self.cwd.as_deref().and_then(find_project_config) {
            paths.push(project);
        }
        paths
    }

    /// Merge every layer and deserialize the result.
    pub fn load(&self) -> Result<LoadedConfig, GateError> {
        let mut merged = defaults_value();
        let mut sources = Vec::new();
        for path in self.layer_paths() {
            if let Some(layer) = read_layer(&path)? {
                merge_values(&mut merged, layer);
                sources.push(path);
            }
        }
        self.apply_env_overrides(&mut merged)?;
        let config = typed(&merged, "merged configuration")?;
        Ok(LoadedConfig {
            config,
            merged,
            sources,
        })
    }

    fn apply_env_overrides(&self, merged: &mut toml::Value) -> Result<(), GateError> {
        for (suffix, path, kind) in ENV_OVERRIDES {
            let var = format!("{ENV_PREFIX}_{suffix}");
            let Some(raw) = self.env.get(&var) else {
                continue;
            };
            let raw = raw.trim();
            let value = match kind {
                EnvKind::Str => Some(toml::Value::String(raw.to_string())),
                EnvKind::Bool => parse_bool(raw).map(toml::Value::Boolean),
                EnvKind::Int => raw.parse::<i64>().ok().map(toml::Value::Integer),
                EnvKind::Float => raw.parse::<f64>().ok().map(toml::Value::Float),
            };
            let Some(value) = value else {
                return Err(GateError::config_parse_error(
                    &var,
                    &format!("cannot interpret {raw:?} for {path}"),
                ));
            };
            set_path(merged, path, value);
        }
        Ok(())
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Walk from `start` to the repo root (or filesystem root) looking for
/// `.shellgate.toml`.
fn find_project_config(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();
    loop {
        let candidate = current.join(PROJECT_CONFIG_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        if current.join(".git").exists() || !current.pop() {
            return None;
        }
    }
}

/// Read one TOML layer. A missing file is not an error; an unparsable one is.
fn read_layer(path: &Path) -> Result<Option<toml::Value>, GateError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(GateError::config_parse_error(
                &path.display().to_string(),
                &e.to_string(),
            ));
        }
    };
    let table: toml::Table = toml::from_str(&content).map_err(|e| {
        GateError::config_parse_error(&path.display().to_string(), &e.to_string())
    })?;
    Ok(Some(toml::Value::Table(table)))
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::Table::new())
}

fn defaults_value() -> toml::Value {
    toml::Value::try_from(Config::default()).unwrap_or_else(|_| empty_table())
}

fn typed(merged: &toml::Value, origin: &str) -> Result<Config, GateError> {
    merged
        .clone()
        .try_into::<Config>()
        .map_err(|e| GateError::config_parse_error(origin, &e.to_string()))
}

/// Merge `overlay` into `base`: tables recurse, arrays append, scalars replace.
pub fn merge_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (toml::Value::Array(base), toml::Value::Array(overlay)) => base.extend(overlay),
        (base, overlay) => *base = overlay,
    }
}

/// Look up a dotted path (`approval.timeout_secs`) in a TOML value.
#[must_use]
pub fn lookup_path<'a>(value: &'a toml::Value, path: &str) -> Option<&'a toml::Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| current.get(segment))
}

fn set_path(value: &mut toml::Value, path: &str, leaf: toml::Value) {
    let mut current = value;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let toml::Value::Table(table) = current else {
            return;
        };
        if segments.peek().is_none() {
            table.insert(segment.to_string(), leaf);
            return;
        }
        current = table
            .entry(segment.to_string())
            .or_insert_with(empty_table);
    }
}

/// Versioned, re-readable configuration.
///
/// Consumers poll [`ConfigHandle::version`] or call
/// [`ConfigHandle::reload_if_changed`]; a successful reload swaps the snapshot
/// and bumps the version. A failed reload keeps the previous snapshot.
#[derive(Debug)]
pub struct ConfigHandle {
    loader: ConfigLoader,
    state: RwLock<HandleState>,
    version: AtomicU64,
}

#[derive(Debug)]
struct HandleState {
    config: Arc<Config>,
    merged: toml::Value,
    stamps: Vec<FileStamp>,
}

impl ConfigHandle {
    /// Load through `loader` and keep it for later reloads.
    pub fn load(loader: ConfigLoader) -> Result<Self, GateError> {
        let state = Self::read_state(&loader)?;
        Ok(Self {
            loader,
            state: RwLock::new(state),
            version: AtomicU64::new(1),
        })
    }

    /// A handle over a fixed config with no file layers.
    #[must_use]
    pub fn fixed(config: Config) -> Self {
        let merged = toml::Value::try_from(&config).unwrap_or_else(|_| empty_table());
        Self {
            loader: ConfigLoader::isolated(),
            state: RwLock::new(HandleState {
                config: Arc::new(config),
                merged,
                stamps: Vec::new(),
            }),
            version: AtomicU64::new(1),
        }
    }

    fn read_state(loader: &ConfigLoader) -> Result<HandleState, GateError> {
        let loaded = loader.load()?;
        Ok(HandleState {
            config: Arc::new(loaded.config),
            merged: loaded.merged,
            stamps: stamp_paths(&loader.layer_paths()),
        })
    }

    /// Current typed configuration.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Config> {
        match self.state.read() {
            Ok(state) => Arc::clone(&state.config),
            Err(poisoned) => Arc::clone(&poisoned.into_inner().config),
        }
    }

    /// Monotonic version, bumped on every successful reload.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Nested-path lookup over the merged configuration.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<toml::Value> {
        let state = match self.state.read() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        lookup_path(&state.merged, path).cloned()
    }

    /// Reload when any layer file appeared, vanished, or changed mtime.
    ///
    /// Returns `Ok(true)` when a new snapshot was installed.
    pub fn reload_if_changed(&self) -> Result<bool, GateError> {
        let current = stamp_paths(&self.loader.layer_paths());
        let unchanged = {
            let state = match self.state.read() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.stamps == current
        };
        if unchanged {
            return Ok(false);
        }
        let fresh = Self::read_state(&self.loader)?;
        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        *state = fresh;
        self.version.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(version = self.version(), "configuration reloaded");
        Ok(true)
    }
}

/// Path plus (mtime, length); length catches rewrites within one mtime tick.
type FileStamp = (PathBuf, Option<(SystemTime, u64)>);

fn stamp_paths(paths: &[PathBuf]) -> Vec<FileStamp> {
    paths
        .iter()
        .map(|p| {
            let stamp = fs::metadata(p)
                .ok()
                .and_then(|m| Some((m.modified().ok()?, m.len())));
            (p.clone(), stamp)
        })
        .collect()
}
