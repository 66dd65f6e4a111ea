//! Secret redaction for anything that leaves the gate: log lines, terminal
//! prompts, JSON output, and text sent to the remote analysis backend.
//!
//! # Matching model
//!
//! All candidate matches are collected against the pristine input. Overlaps are
//! resolved highest-priority first (then earliest start, then longest span),
//! so a provider key inside a bearer header is reported as an API key rather
//! than a generic token. Spans that overlap an existing `[REDACTED…]` marker
//! are ignored, which makes redaction idempotent on its own output.
//!
//! A redaction pass that leaves residual matches (typically because a
//! substitution exposed a new word boundary) is repeated a bounded number of
//! times. Whatever survives is reported in [`Validation::residual`].

use crate::config::RedactionSettings;
use crate::error_codes::{ErrorCode, GateError};
use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{LazyLock, Mutex, RwLock};

/// Maximum number of redaction passes over one input.
const MAX_PASSES: u8 = 4;

/// Characters kept at each end of a masked secret.
const MASK_KEEP: usize = 4;

static MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[REDACTED(?:_[A-Z]+)*\]").expect("marker regex should compile")
});

static MASK_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*{4,}").expect("mask regex should compile"));

/// A named secret matcher.
#[derive(Debug, Clone)]
pub struct RedactionPattern {
    pub name: String,
    pub regex: Regex,
    /// Replacement template; `${1}` style group references are expanded.
    pub replacement: String,
    pub priority: u8,
    /// Eligible for structure-preserving masking.
    pub maskable: bool,
    /// Only applied when email redaction is requested.
    pub email: bool,
    validator: Option<fn(&str) -> bool>,
}

impl RedactionPattern {
    /// Compile a caller-supplied pattern.
    pub fn new(
        name: impl Into<String>,
        regex: &str,
        replacement: impl Into<String>,
        priority: u8,
    ) -> Result<Self, GateError> {
        let name = name.into();
        let regex = Regex::new(regex).map_err(|e| {
            GateError::new(
                ErrorCode::InvalidPattern,
                format!("Invalid redaction pattern '{name}': {e}"),
            )
            .add_context("pattern", name.clone())
        })?;
        Ok(Self {
            name,
            regex,
            replacement: replacement.into(),
            priority,
            maskable: false,
            email: false,
            validator: None,
        })
    }

    fn maskable(mut self) -> Self {
        self.maskable = true;
        self
    }

    fn email_only(mut self) -> Self {
        self.email = true;
        self
    }

    fn validated(mut self, validator: fn(&str) -> bool) -> Self {
        self.validator = Some(validator);
        self
    }
}

macro_rules! secret {
    ($name:literal, $priority:expr, $re:literal, $replacement:literal) => {
        RedactionPattern::new($name, $re, $replacement, $priority)
            .expect(concat!("built-in pattern should compile: ", $name))
    };
}

/// Built-in patterns, highest priority first.
static BUILTIN_PATTERNS: LazyLock<Vec<RedactionPattern>> = LazyLock::new(|| {
    vec![
        secret!(
            "pem_private_key",
            100,
            r"(?s)-----BEGIN (?:[A-Z0-9]+ )*PRIVATE KEY-----.*?-----END (?:[A-Z0-9]+ )*PRIVATE KEY-----",
            "[REDACTED_PRIVATE_KEY]"
        ),
        secret!(
            "pem_certificate",
            95,
            r"(?s)-----BEGIN CERTIFICATE-----.*?-----END CERTIFICATE-----",
            "[REDACTED_CERTIFICATE]"
        ),
        secret!("anthropic_api_key", 90, r"\bsk-ant-[A-Za-z0-9_-]{20,}", "[REDACTED_API_KEY]").maskable(),
        secret!("openai_api_key", 90, r"\bsk-[A-Za-z0-9_-]{20,}", "[REDACTED_API_KEY]").maskable(),
        secret!("aws_access_key", 90, r"\b(?:AKIA|ASIA)[0-9A-Z]{16}\b", "[REDACTED_API_KEY]").maskable(),
        secret!("github_token", 90, r"\bgh[pousr]_[A-Za-z0-9]{36,}", "[REDACTED_API_KEY]").maskable(),
        secret!("github_pat", 90, r"\bgithub_pat_[A-Za-z0-9_]{22,}", "[REDACTED_API_KEY]").maskable(),
        secret!("slack_token", 90, r"\bxox[abposr]-[A-Za-z0-9-]{10,}", "[REDACTED_API_KEY]").maskable(),
        secret!("google_api_key", 90, r"\bAIza[0-9A-Za-z_-]{35}", "[REDACTED_API_KEY]").maskable(),
        secret!("stripe_live_key", 90, r"\b(?:sk|rk)_live_[0-9A-Za-z]{24,}", "[REDACTED_API_KEY]").maskable(),
        secret!(
            "jwt",
            85,
            r"\beyJ[A-Za-z0-9_-]{8,}\.eyJ[A-Za-z0-9_-]{8,}\.[A-Za-z0-9_-]{8,}",
            "[REDACTED_TOKEN]"
        )
        .maskable(),
        secret!(
            "bearer_token",
            80,
            r"(?i)\b(bearer|token)\s+([A-Za-z0-9._~+/=-]{16,})",
            "${1} [REDACTED_TOKEN]"
        ),
        secret!(
            "url_credentials",
            75,
            r"\b([A-Za-z][A-Za-z0-9+.-]*://[^\s:/@]+:)([^\s@/]+)(@)",
            "${1}[REDACTED_PASSWORD]${3}"
        ),
        secret!(
            "password_flag",
            70,
            r"(?i)(--?(?:password|passwd|pass|pwd|token|secret|api-key|apikey)(?:=|\s+))([^\s-]\S*)",
            "${1}[REDACTED_PASSWORD]"
        ),
        secret!(
            "env_assignment",
            65,
            r"\b((?:[A-Za-z_][A-Za-z0-9_]*)?(?i:secret|token|passwd|password|api_key|apikey|private_key|access_key|credentials?)[A-Za-z0-9_]*)=(\S+)",
            "${1}=[REDACTED_SECRET]"
        ),
        secret!("card_number", 60, r"\b(?:\d[ -]?){12,18}\d\b", "[REDACTED_CARD]").validated(luhn_valid),
        secret!("ssn", 55, r"\b\d{3}-\d{2}-\d{4}\b", "[REDACTED_SSN]"),
        secret!(
            "email",
            10,
            r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
            "[REDACTED_EMAIL]"
        )
        .email_only(),
    ]
});

/// Per-call redaction switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct RedactOptions {
    /// Keep the first and last four characters of key-like matches.
    pub mask: bool,
    pub redact_emails: bool,
}

/// One applied redaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedactionMatch {
    pub pattern: String,
    /// Byte span in the text of the pass that found it.
    pub start: usize,
    pub end: usize,
    /// 1 for the pristine input.
    pub pass: u8,
}

/// Outcome of re-scanning the redacted output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Validation {
    pub clean: bool,
    /// Names of patterns still matching the output.
    pub residual: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedactionResult {
    pub redacted: String,
    pub matches: Vec<RedactionMatch>,
    pub validation: Validation,
}

#[derive(Debug)]
struct Candidate {
    name: String,
    priority: u8,
    start: usize,
    end: usize,
    replacement: String,
}

#[derive(Debug, Default)]
struct ResultCache {
    entries: HashMap<(String, RedactOptions), RedactionResult>,
    order: VecDeque<(String, RedactOptions)>,
}

/// The redaction engine.
///
/// Cheap to share behind an `Arc`; pattern mutation and caching use interior
/// locks that are never held while matching.
#[derive(Debug)]
pub struct Redactor {
    patterns: RwLock<Vec<RedactionPattern>>,
    cache: Mutex<ResultCache>,
    cache_capacity: usize,
    defaults: RedactOptions,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Redactor {
    /// Engine with the built-in patterns and a 256-entry result cache.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    #[must_use]
    pub fn with_capacity(cache_capacity: usize) -> Self {
        Self {
            patterns: RwLock::new(BUILTIN_PATTERNS.clone()),
            cache: Mutex::new(ResultCache::default()),
            cache_capacity,
            defaults: RedactOptions::default(),
        }
    }

    /// Engine configured from the `[redaction]` section, custom patterns included.
    pub fn from_settings(settings: &RedactionSettings) -> Result<Self, GateError> {
        let mut redactor = Self::with_capacity(settings.cache_size);
        redactor.defaults = RedactOptions {
            mask: settings.mask,
            redact_emails: settings.redact_emails,
        };
        for custom in &settings.patterns {
            redactor.add_pattern(RedactionPattern::new(
                &custom.name,
                &custom.regex,
                &custom.replacement,
                custom.priority,
            )?);
        }
        Ok(redactor)
    }

    /// Options used by [`Redactor::redact_text`].
    #[must_use]
    pub fn default_options(&self) -> RedactOptions {
        self.defaults
    }

    /// Add (or replace by name) a pattern. Clears the result cache.
    pub fn add_pattern(&self, pattern: RedactionPattern) {
        {
            let mut patterns = write_lock(&self.patterns);
            patterns.retain(|p| p.name != pattern.name);
            patterns.push(pattern);
            patterns.sort_by(|a, b| b.priority.cmp(&a.priority));
        }
        self.clear_cache();
    }

    /// Remove a pattern by name. Clears the result cache when something was removed.
    pub fn remove_pattern(&self, name: &str) -> bool {
        let removed = {
            let mut patterns = write_lock(&self.patterns);
            let before = patterns.len();
            patterns.retain(|p| p.name != name);
            patterns.len() != before
        };
        if removed {
            self.clear_cache();
        }
        removed
    }

    #[must_use]
    pub fn pattern_names(&self) -> Vec<String> {
        read_lock(&self.patterns)
            .iter()
            .map(|p| p.name.clone())
            .collect()
    }

    #[must_use]
    pub fn cached_entries(&self) -> usize {
        lock(&self.cache).entries.len()
    }

    fn clear_cache(&self) {
        let mut cache = lock(&self.cache);
        cache.entries.clear();
        cache.order.clear();
    }

    /// Redact with the configured default options and return only the text.
    #[must_use]
    pub fn redact_text(&self, text: &str) -> String {
        self.redact(text, &self.defaults).redacted
    }

    /// Redact `text`.
    #[must_use]
    pub fn redact(&self, text: &str, options: &RedactOptions) -> RedactionResult {
        let key = (text.to_string(), *options);
        if let Some(hit) = lock(&self.cache).entries.get(&key) {
            return hit.clone();
        }

        let result = {
            let patterns = read_lock(&self.patterns);
            redact_with(&patterns, text, options)
        };

        if self.cache_capacity > 0 {
            let mut cache = lock(&self.cache);
            while cache.entries.len() >= self.cache_capacity {
                let Some(oldest) = cache.order.pop_front() else {
                    break;
                };
                cache.entries.remove(&oldest);
            }
            if cache.entries.insert(key.clone(), result.clone()).is_none() {
                cache.order.push_back(key);
            }
        }
        result
    }

    /// Re-scan `text` and report which patterns still match.
    #[must_use]
    pub fn validate(&self, text: &str, options: &RedactOptions) -> Validation {
        let patterns = read_lock(&self.patterns);
        validation_for(&patterns, text, options)
    }
}

fn redact_with(patterns: &[RedactionPattern], text: &str, options: &RedactOptions) -> RedactionResult {
    let mut current = text.to_string();
    let mut matches = Vec::new();
    for pass in 1..=MAX_PASSES {
        let accepted = resolve(collect_candidates(patterns, &current, options));
        if accepted.is_empty() {
            break;
        }
        let mut out = String::with_capacity(current.len());
        let mut cursor = 0;
        for candidate in &accepted {
            out.push_str(&current[cursor..candidate.start]);
            out.push_str(&candidate.replacement);
            cursor = candidate.end;
            matches.push(RedactionMatch {
                pattern: candidate.name.clone(),
                start: candidate.start,
                end: candidate.end,
                pass,
            });
        }
        out.push_str(&current[cursor..]);
        current = out;
    }
    let validation = validation_for(patterns, &current, options);
    RedactionResult {
        redacted: current,
        matches,
        validation,
    }
}

fn validation_for(patterns: &[RedactionPattern], text: &str, options: &RedactOptions) -> Validation {
    let mut residual: Vec<String> = collect_candidates(patterns, text, options)
        .into_iter()
        .map(|c| c.name)
        .collect();
    residual.sort();
    residual.dedup();
    Validation {
        clean: residual.is_empty(),
        residual,
    }
}

/// Spans that must not be redacted again.
fn protected_spans(text: &str, options: &RedactOptions) -> Vec<(usize, usize)> {
    let mut spans: Vec<(usize, usize)> = MARKER
        .find_iter(text)
        .map(|m| (m.start(), m.end()))
        .collect();
    if options.mask {
        spans.extend(MASK_RUN.find_iter(text).map(|m| (m.start(), m.end())));
    }
    spans
}

fn collect_candidates(
    patterns: &[RedactionPattern],
    text: &str,
    options: &RedactOptions,
) -> Vec<Candidate> {
    let protected = protected_spans(text, options);
    let mut candidates = Vec::new();
    for pattern in patterns {
        if pattern.email && !options.redact_emails {
            continue;
        }
        for caps in pattern.regex.captures_iter(text) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            let (start, end) = (whole.start(), whole.end());
            if start == end || protected.iter().any(|&(s, e)| start < e && s < end) {
                continue;
            }
            if pattern.validator.is_some_and(|valid| !valid(whole.as_str())) {
                continue;
            }
            let replacement = if options.mask && pattern.maskable {
                mask_secret(whole.as_str())
            } else {
                let mut expanded = String::new();
                caps.expand(&pattern.replacement, &mut expanded);
                expanded
            };
            candidates.push(Candidate {
                name: pattern.name.clone(),
                priority: pattern.priority,
                start,
                end,
                replacement,
            });
        }
    }
    candidates
}

/// Keep non-overlapping candidates, highest priority first; result is in text order.
fn resolve(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.start.cmp(&b.start))
            .then((b.end - b.start).cmp(&(a.end - a.start)))
    });
    let mut accepted: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        let overlaps = accepted
            .iter()
            .any(|a| candidate.start < a.end && a.start < candidate.end);
        if !overlaps {
            accepted.push(candidate);
        }
    }
    accepted.sort_by_key(|c| c.start);
    accepted
}

/// Same-length mask keeping the first and last [`MASK_KEEP`] characters.
#[must_use]
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= MASK_KEEP * 2 {
        return "*".repeat(chars.len());
    }
    let mut masked = String::with_capacity(secret.len());
    masked.extend(&chars[..MASK_KEEP]);
    masked.extend(std::iter::repeat_n('*', chars.len() - MASK_KEEP * 2));
    masked.extend(&chars[chars.len() - MASK_KEEP..]);
    masked
}

/// Luhn checksum over the digits of `candidate` (13 to 19 digits).
#[must_use]
pub fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}
