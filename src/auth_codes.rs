//! Short-lived authorization codes for callers without a terminal.
//!
//! When a command needs approval but no trusted terminal exists (an agent
//! running headless), the gate denies it and mints a code such as
//! `amber-falcon-42`. A human runs `shellgate redeem amber-falcon-42` from
//! their own terminal to approve and execute exactly the bound command.
//!
//! The code space is small on purpose so humans can read it aloud. Security
//! rests on the TTL and on one-time use:
//! - redemption atomically marks the code used
//! - every code is evicted at its TTL, used or not
//!
//! The file store is a JSONL record set guarded by an exclusive `fs2` lock so
//! the issuing process and the redeeming process see the same state. Corrupt
//! lines are skipped.

use crate::analysis::Analysis;
use crate::config::AuthCodeConfig;
use crate::error_codes::{ErrorCode, GateError};
use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

const STORE_FILE: &str = "auth_codes.jsonl";
const SCHEMA_VERSION: u32 = 1;

/// Attempts at finding an unused code before giving up.
const MAX_CODE_ATTEMPTS: usize = 32;

const FIRST_WORDS: &[&str] = &[
    "amber", "brave", "calm", "dusty", "eager", "fuzzy", "gentle", "hollow", "icy", "jolly",
    "keen", "lucky", "misty", "noble", "olive", "proud", "quiet", "rapid", "sunny", "tidy",
    "urban", "vivid", "windy", "young", "zesty", "bold", "crisp", "deep", "early", "fresh",
    "grand", "happy",
];

const SECOND_WORDS: &[&str] = &[
    "falcon", "badger", "cedar", "delta", "ember", "fjord", "glacier", "harbor", "island",
    "jaguar", "kettle", "lantern", "meadow", "nebula", "orchid", "pebble", "quartz", "river",
    "summit", "tundra", "valley", "walrus", "yarrow", "zephyr", "anchor", "beacon", "canyon",
    "dune", "echo", "forest", "grove", "heron",
];

/// Draw a `word-word-NN` code.
#[must_use]
pub fn generate_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    let first = FIRST_WORDS[rng.gen_range(0..FIRST_WORDS.len())];
    let second = SECOND_WORDS[rng.gen_range(0..SECOND_WORDS.len())];
    let digits: u8 = rng.gen_range(0..100);
    format!("{first}-{second}-{digits:02}")
}

/// Canonical form of user-typed input.
#[must_use]
pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

/// One issued code and the command it authorizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthToken {
    #[serde(default = "schema_version")]
    pub schema_version: u32,
    pub code: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Command line with secrets redacted, for display.
    pub display: String,
    #[serde(default)]
    pub analysis: Option<Analysis>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

const fn schema_version() -> u32 {
    SCHEMA_VERSION
}

impl AuthToken {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// What the caller needs to bind a code to.
#[derive(Debug, Clone)]
pub struct AuthGrant {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub display: String,
    pub analysis: Option<Analysis>,
}

/// Why a code was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Unknown,
    AlreadyUsed,
    Expired,
}

impl RejectReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::AlreadyUsed => "already_used",
            Self::Expired => "expired",
        }
    }

    #[must_use]
    pub fn to_error(self, code: &str) -> GateError {
        let (error_code, message) = match self {
            Self::Unknown => (ErrorCode::AuthCodeUnknown, "Auth code is not recognized"),
            Self::AlreadyUsed => (ErrorCode::AuthCodeReused, "Auth code has already been used"),
            Self::Expired => (ErrorCode::AuthCodeExpired, "Auth code has expired"),
        };
        GateError::new(error_code, message).add_context("code", code)
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`AuthCodeIssuer::validate`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Validation {
    pub valid: bool,
    pub data: Option<AuthToken>,
    pub reason: Option<RejectReason>,
}

impl Validation {
    fn accepted(token: AuthToken) -> Self {
        Self {
            valid: true,
            data: Some(token),
            reason: None,
        }
    }

    fn rejected(reason: RejectReason) -> Self {
        Self {
            valid: false,
            data: None,
            reason: Some(reason),
        }
    }
}

/// Persistence for issued codes.
///
/// `redeem` must be atomic: of two concurrent redemptions of the same code,
/// exactly one succeeds.
pub trait AuthCodeStore: Send + Sync {
    /// Store a new token. `Ok(false)` when the code is already live.
    fn insert(&self, token: AuthToken, now: DateTime<Utc>) -> Result<bool, GateError>;

    /// Look up `code`, reject it or mark it used, and evict expired tokens.
    fn redeem(
        &self,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<Result<AuthToken, RejectReason>, GateError>;

    /// Drop every token past its TTL. Returns how many were dropped.
    fn reap(&self, now: DateTime<Utc>) -> Result<usize, GateError>;

    /// Number of stored tokens, used or not.
    fn len(&self) -> Result<usize, GateError>;
}

/// Shared redemption rule for both stores.
fn redeem_in(
    tokens: &mut HashMap<String, AuthToken>,
    code: &str,
    now: DateTime<Utc>,
) -> Result<AuthToken, RejectReason> {
    let outcome = match tokens.get_mut(code) {
        None => Err(RejectReason::Unknown),
        Some(token) if token.is_expired(now) => Err(RejectReason::Expired),
        Some(token) if token.used => Err(RejectReason::AlreadyUsed),
        Some(token) => {
            token.used = true;
            Ok(token.clone())
        }
    };
    tokens.retain(|_, t| !t.is_expired(now));
    outcome
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryAuthStore {
    tokens: Mutex<HashMap<String, AuthToken>>,
}

impl MemoryAuthStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tokens(&self) -> std::sync::MutexGuard<'_, HashMap<String, AuthToken>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AuthCodeStore for MemoryAuthStore {
    fn insert(&self, token: AuthToken, now: DateTime<Utc>) -> Result<bool, GateError> {
        let mut tokens = self.tokens();
        tokens.retain(|_, t| !t.is_expired(now));
        if tokens.contains_key(&token.code) {
            return Ok(false);
        }
        tokens.insert(token.code.clone(), token);
        Ok(true)
    }

    fn redeem(
        &self,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<Result<AuthToken, RejectReason>, GateError> {
        Ok(redeem_in(&mut self.tokens(), code, now))
    }

    fn reap(&self, now: DateTime<Utc>) -> Result<usize, GateError> {
        let mut tokens = self.tokens();
        let before = tokens.len();
        tokens.retain(|_, t| !t.is_expired(now));
        Ok(before - tokens.len())
    }

    fn len(&self) -> Result<usize, GateError> {
        Ok(self.tokens().len())
    }
}

/// JSONL store shared between processes.
#[derive(Debug, Clone)]
pub struct FileAuthStore {
    path: PathBuf,
}

impl FileAuthStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `$XDG_STATE_HOME/shellgate/auth_codes.jsonl`, or the platform's local
    /// data directory.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".local/state"))
            .join("shellgate")
            .join(STORE_FILE)
    }

    fn unavailable(&self, err: &io::Error) -> GateError {
        GateError::store_unavailable(&self.path.display().to_string(), &err.to_string())
    }

    /// Lock, load, let `f` mutate, and write back if `f` says so.
    fn with_tokens<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, AuthToken>) -> (T, bool),
    ) -> Result<T, GateError> {
        let mut file = open_locked(&self.path).map_err(|e| self.unavailable(&e))?;
        let mut tokens = load_tokens(&mut file);
        let before = tokens.len();
        let (value, dirty) = f(&mut tokens);
        if dirty || tokens.len() != before {
            rewrite_tokens(&mut file, &tokens).map_err(|e| self.unavailable(&e))?;
        }
        Ok(value)
    }
}

impl AuthCodeStore for FileAuthStore {
    fn insert(&self, token: AuthToken, now: DateTime<Utc>) -> Result<bool, GateError> {
        self.with_tokens(|tokens| {
            tokens.retain(|_, t| !t.is_expired(now));
            if tokens.contains_key(&token.code) {
                return (false, false);
            }
            tokens.insert(token.code.clone(), token);
            (true, true)
        })
    }

    fn redeem(
        &self,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<Result<AuthToken, RejectReason>, GateError> {
        self.with_tokens(|tokens| {
            let outcome = redeem_in(tokens, code, now);
            let dirty = outcome.is_ok();
            (outcome, dirty)
        })
    }

    fn reap(&self, now: DateTime<Utc>) -> Result<usize, GateError> {
        self.with_tokens(|tokens| {
            let before = tokens.len();
            tokens.retain(|_, t| !t.is_expired(now));
            (before - tokens.len(), false)
        })
    }

    fn len(&self) -> Result<usize, GateError> {
        self.with_tokens(|tokens| (tokens.len(), false))
    }
}

fn open_locked(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut options = OpenOptions::new();
    options.create(true).read(true).write(true).truncate(false);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let file = options.open(path)?;
    file.lock_exclusive()?;
    Ok(file)
}

fn load_tokens(file: &mut File) -> HashMap<String, AuthToken> {
    let mut tokens = HashMap::new();
    if file.seek(SeekFrom::Start(0)).is_err() {
        return tokens;
    }
    for line in BufReader::new(file).lines() {
        let Ok(line) = line else {
            continue;
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<AuthToken>(trimmed) {
            Ok(token) => {
                tokens.insert(token.code.clone(), token);
            }
            Err(e) => tracing::debug!(error = %e, "skipping corrupt auth-code record"),
        }
    }
    tokens
}

fn rewrite_tokens(file: &mut File, tokens: &HashMap<String, AuthToken>) -> io::Result<()> {
    let mut ordered: Vec<&AuthToken> = tokens.values().collect();
    ordered.sort_by(|a, b| a.issued_at.cmp(&b.issued_at).then_with(|| a.code.cmp(&b.code)));
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    for token in ordered {
        let line = serde_json::to_string(token).map_err(io::Error::other)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
    }
    file.sync_data()
}

/// Mints and validates codes against an [`AuthCodeStore`].
#[derive(Clone)]
pub struct AuthCodeIssuer {
    store: Arc<dyn AuthCodeStore>,
    ttl: Duration,
}

impl fmt::Debug for AuthCodeIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthCodeIssuer")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl AuthCodeIssuer {
    #[must_use]
    pub fn new(store: Arc<dyn AuthCodeStore>, ttl: std::time::Duration) -> Self {
        Self {
            store,
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(300)),
        }
    }

    /// Issuer over the configured store: a file when `auth_codes.store` is
    /// set, otherwise the default file path.
    #[must_use]
    pub fn from_config(config: &AuthCodeConfig) -> Self {
        let path = config
            .store
            .as_deref()
            .map_or_else(FileAuthStore::default_path, PathBuf::from);
        Self::new(
            Arc::new(FileAuthStore::new(path)),
            std::time::Duration::from_secs(config.ttl_secs),
        )
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue(&self, grant: AuthGrant) -> Result<AuthToken, GateError> {
        self.issue_at(grant, Utc::now())
    }

    /// Mint a fresh code bound to `grant` as of `now`.
    pub fn issue_at(&self, grant: AuthGrant, now: DateTime<Utc>) -> Result<AuthToken, GateError> {
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_CODE_ATTEMPTS {
            let token = AuthToken {
                schema_version: SCHEMA_VERSION,
                code: generate_code(&mut rng),
                command: grant.command.clone(),
                args: grant.args.clone(),
                cwd: grant.cwd.clone(),
                display: grant.display.clone(),
                analysis: grant.analysis.clone(),
                issued_at: now,
                expires_at: now + self.ttl,
                used: false,
            };
            if self.store.insert(token.clone(), now)? {
                tracing::info!(code = %token.code, command = %token.display, "auth code issued");
                return Ok(token);
            }
        }
        Err(GateError::new(
            ErrorCode::StoreUnavailable,
            "Could not find an unused auth code",
        ))
    }

    pub fn validate(&self, code: &str) -> Result<Validation, GateError> {
        self.validate_at(code, Utc::now())
    }

    /// Redeem `code` as of `now`. A valid code is consumed.
    pub fn validate_at(&self, code: &str, now: DateTime<Utc>) -> Result<Validation, GateError> {
        let code = normalize_code(code);
        match self.store.redeem(&code, now)? {
            Ok(token) => {
                tracing::info!(code = %code, command = %token.display, "auth code redeemed");
                Ok(Validation::accepted(token))
            }
            Err(reason) => {
                crate::security_event!(
                    "auth_code_rejected",
                    code = code.as_str(),
                    reason = reason.as_str()
                );
                Ok(Validation::rejected(reason))
            }
        }
    }

    /// Evict every expired code.
    pub fn reap(&self) -> Result<usize, GateError> {
        self.store.reap(Utc::now())
    }
}

/// Periodically evict expired codes. Abort the handle to stop.
pub fn spawn_reaper(
    issuer: AuthCodeIssuer,
    every: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match issuer.reap() {
                Ok(0) => {}
                Ok(n) => tracing::debug!(evicted = n, "reaped expired auth codes"),
                Err(e) => tracing::warn!(error = %e, "auth-code reaper failed"),
            }
        }
    })
}
