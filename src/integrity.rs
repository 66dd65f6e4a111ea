//! Command signing and tamper detection.
//!
//! Once a command is cleared to run, the [`ExecRequest`] it will be spawned
//! from is signed together with the identity it will run under: the gate's
//! pid and uid, the request's cwd, the security-relevant variables of the
//! request's sanitized environment, and a digest of that whole environment.
//! Verification is done against the request handed to the executor and
//! rejects it if the program, the arguments, or any identity field moved.

use crate::config::IntegrityConfig;
use crate::error_codes::GateError;
use crate::exec::ExecRequest;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as FmtWrite;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Environment variables captured by name in every identity snapshot.
pub const IDENTITY_ENV: &[&str] = &[
    "PATH",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "LD_AUDIT",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
    "BASH_ENV",
    "ENV",
    "IFS",
    "SHELL",
    "HOME",
];

/// The process doing the spawning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub pid: u32,
    pub uid: u32,
}

/// Who is about to run the command, and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub pid: u32,
    pub uid: u32,
    pub cwd: PathBuf,
    /// Every [`IDENTITY_ENV`] key, `None` when unset.
    pub env: BTreeMap<String, Option<String>>,
    /// SHA-256 over every variable the child will receive.
    pub env_digest: String,
}

impl Identity {
    /// Build from raw parts, keeping only the [`IDENTITY_ENV`] keys by name.
    #[must_use]
    pub fn from_parts(
        pid: u32,
        uid: u32,
        cwd: PathBuf,
        env: &BTreeMap<String, String>,
    ) -> Self {
        Self {
            pid,
            uid,
            cwd,
            env: IDENTITY_ENV
                .iter()
                .map(|k| ((*k).to_string(), env.get(*k).cloned()))
                .collect(),
            env_digest: env_digest(env),
        }
    }

    /// `principal` running `request`.
    #[must_use]
    pub fn for_request(principal: Principal, request: &ExecRequest) -> Self {
        Self::from_parts(principal.pid, principal.uid, request.cwd.clone(), &request.env)
    }

    /// Names of the fields that differ from `other`.
    #[must_use]
    pub fn drift_from(&self, other: &Self) -> Vec<String> {
        let mut drifted = Vec::new();
        if self.pid != other.pid {
            drifted.push("pid".to_string());
        }
        if self.uid != other.uid {
            drifted.push("uid".to_string());
        }
        if self.cwd != other.cwd {
            drifted.push("cwd".to_string());
        }
        let mut named = false;
        for key in IDENTITY_ENV {
            if self.env.get(*key) != other.env.get(*key) {
                drifted.push(format!("env.{key}"));
                named = true;
            }
        }
        if !named && self.env_digest != other.env_digest {
            drifted.push("env".to_string());
        }
        drifted
    }
}

fn env_digest(env: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in env {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }
    to_hex(&hasher.finalize())
}

/// Capability to capture the spawning process.
pub trait IdentityProbe: Send + Sync {
    fn capture(&self) -> Result<Principal, GateError>;
}

/// The live process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessIdentity;

impl IdentityProbe for ProcessIdentity {
    fn capture(&self) -> Result<Principal, GateError> {
        Ok(Principal {
            pid: std::process::id(),
            uid: crate::sys::uid(),
        })
    }
}

/// A command plus the identity and token it was signed with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedCommand {
    pub command: String,
    pub args: Vec<String>,
    pub identity: Identity,
    pub token: String,
    pub signed_at: DateTime<Utc>,
    /// Hex HMAC-SHA256 over everything above.
    pub signature: String,
}

/// The fields a signature covers, in a fixed order.
#[derive(Serialize)]
struct SignedPayload<'a> {
    command: &'a str,
    args: &'a [String],
    identity: &'a Identity,
    token: &'a str,
    signed_at: String,
}

impl SignedCommand {
    fn payload(&self) -> Result<Vec<u8>, GateError> {
        serde_json::to_vec(&SignedPayload {
            command: &self.command,
            args: &self.args,
            identity: &self.identity,
            token: &self.token,
            signed_at: self.signed_at.to_rfc3339(),
        })
        .map_err(|e| GateError::integrity_failed(&format!("payload encoding: {e}")))
    }
}

/// Why verification failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityFailure {
    /// Token never issued or already consumed.
    TokenMismatch,
    Expired,
    BadSignature,
    IdentityDrift,
    ProbeFailed,
}

impl IntegrityFailure {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TokenMismatch => "token_mismatch",
            Self::Expired => "expired",
            Self::BadSignature => "bad_signature",
            Self::IdentityDrift => "identity_drift",
            Self::ProbeFailed => "probe_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub valid: bool,
    pub failure: Option<IntegrityFailure>,
    pub drifted: Vec<String>,
}

impl VerifyReport {
    fn ok() -> Self {
        Self {
            valid: true,
            failure: None,
            drifted: Vec::new(),
        }
    }

    fn failed(failure: IntegrityFailure) -> Self {
        Self {
            valid: false,
            failure: Some(failure),
            drifted: Vec::new(),
        }
    }

    /// The failure as a [`GateError`], when there is one.
    #[must_use]
    pub fn to_error(&self) -> Option<GateError> {
        let failure = self.failure?;
        let details = if self.drifted.is_empty() {
            failure.as_str().to_string()
        } else {
            format!("{} ({})", failure.as_str(), self.drifted.join(", "))
        };
        Some(GateError::integrity_failed(&details).add_context("failure", failure.as_str()))
    }
}

/// Signs and verifies commands with a key that never leaves this process.
pub struct IntegritySigner {
    key: [u8; 32],
    probe: Arc<dyn IdentityProbe>,
    window: Duration,
    outstanding: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for IntegritySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegritySigner")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl IntegritySigner {
    /// Derive a fresh key from this pid and a random nonce.
    #[must_use]
    pub fn new(probe: Arc<dyn IdentityProbe>, window: Duration) -> Self {
        let mut nonce = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);
        let mut hasher = Sha256::new();
        hasher.update(std::process::id().to_le_bytes());
        hasher.update(nonce);
        Self {
            key: hasher.finalize().into(),
            probe,
            window,
            outstanding: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn from_config(probe: Arc<dyn IdentityProbe>, config: &IntegrityConfig) -> Self {
        Self::new(probe, Duration::from_secs(config.window_secs))
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length.
        <HmacSha256 as Mac>::new_from_slice(&self.key)
            .unwrap_or_else(|_| unreachable!("HMAC-SHA256 accepts any key length"))
    }

    pub fn sign(&self, request: &ExecRequest) -> Result<SignedCommand, GateError> {
        self.sign_at(request, Utc::now())
    }

    /// Sign with an explicit timestamp.
    pub fn sign_at(
        &self,
        request: &ExecRequest,
        now: DateTime<Utc>,
    ) -> Result<SignedCommand, GateError> {
        let identity = Identity::for_request(self.probe.capture()?, request);
        let mut raw = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);
        let mut signed = SignedCommand {
            command: request.program.clone(),
            args: request.args.clone(),
            identity,
            token: to_hex(&raw),
            signed_at: now,
            signature: String::new(),
        };
        let mut mac = self.mac();
        mac.update(&signed.payload()?);
        signed.signature = to_hex(&mac.finalize().into_bytes());
        self.outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(signed.token.clone());
        Ok(signed)
    }

    /// True when `request` is still exactly what `signed` covers.
    #[must_use]
    pub fn verify(&self, signed: &SignedCommand, request: &ExecRequest) -> bool {
        self.verify_detailed(signed, request).valid
    }

    #[must_use]
    pub fn verify_detailed(&self, signed: &SignedCommand, request: &ExecRequest) -> VerifyReport {
        self.verify_at(signed, request, Utc::now())
    }

    /// Verify as of `now`. The token is consumed whatever the outcome.
    #[must_use]
    pub fn verify_at(
        &self,
        signed: &SignedCommand,
        request: &ExecRequest,
        now: DateTime<Utc>,
    ) -> VerifyReport {
        let report = self.check(signed, request, now);
        if let Some(failure) = report.failure {
            crate::security_event!(
                "integrity_failed",
                failure = failure.as_str(),
                drifted = report.drifted.join(",")
            );
        }
        report
    }

    fn check(
        &self,
        signed: &SignedCommand,
        request: &ExecRequest,
        now: DateTime<Utc>,
    ) -> VerifyReport {
        let known = self
            .outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&signed.token);
        if !known {
            return VerifyReport::failed(IntegrityFailure::TokenMismatch);
        }

        let age = now.signed_duration_since(signed.signed_at);
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::MAX);
        if age < chrono::Duration::zero() || age > window {
            return VerifyReport::failed(IntegrityFailure::Expired);
        }

        let Some(expected) = from_hex(&signed.signature) else {
            return VerifyReport::failed(IntegrityFailure::BadSignature);
        };
        let Ok(payload) = signed.payload() else {
            return VerifyReport::failed(IntegrityFailure::BadSignature);
        };
        let mut mac = self.mac();
        mac.update(&payload);
        if mac.verify_slice(&expected).is_err() {
            return VerifyReport::failed(IntegrityFailure::BadSignature);
        }

        let principal = match self.probe.capture() {
            Ok(principal) => principal,
            Err(e) => {
                tracing::warn!(error = %e, "identity probe failed during verification");
                return VerifyReport::failed(IntegrityFailure::ProbeFailed);
            }
        };
        let mut drifted = Vec::new();
        if signed.command != request.program {
            drifted.push("program".to_string());
        }
        if signed.args != request.args {
            drifted.push("args".to_string());
        }
        drifted.extend(
            signed
                .identity
                .drift_from(&Identity::for_request(principal, request)),
        );
        if drifted.is_empty() {
            VerifyReport::ok()
        } else {
            VerifyReport {
                valid: false,
                failure: Some(IntegrityFailure::IdentityDrift),
                drifted,
            }
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

fn from_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| hex.get(i..i + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    /// Probe whose principal the test can change between sign and verify.
    struct Mutable(Mutex<Principal>);

    impl IdentityProbe for Mutable {
        fn capture(&self) -> Result<Principal, GateError> {
            Ok(*self.0.lock().unwrap())
        }
    }

    fn env() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("PATH".to_string(), "/usr/bin:/bin".to_string()),
            ("HOME".to_string(), "/home/dev".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ])
    }

    fn request(program: &str, args: &[&str]) -> ExecRequest {
        ExecRequest::new(
            program,
            args.iter().map(|a| (*a).to_string()).collect(),
            Path::new("/work"),
            &env(),
        )
    }

    fn signer() -> (IntegritySigner, Arc<Mutable>) {
        let probe = Arc::new(Mutable(Mutex::new(Principal { pid: 4242, uid: 1000 })));
        (IntegritySigner::new(probe.clone(), Duration::from_secs(5)), probe)
    }

    fn terraform() -> ExecRequest {
        request("terraform", &["apply", "-auto-approve"])
    }

    #[test]
    fn snapshot_keeps_only_identity_keys() {
        let id = Identity::from_parts(1, 1, PathBuf::from("/work"), &env());
        assert_eq!(id.env.len(), IDENTITY_ENV.len());
        assert!(!id.env.contains_key("UNRELATED"));
        assert_eq!(id.env["LD_PRELOAD"], None);
        assert_eq!(id.env_digest.len(), 64);
    }

    #[test]
    fn identity_comes_from_the_request() {
        let (signer, _) = signer();
        let signed = signer.sign(&terraform()).unwrap();
        assert_eq!(signed.identity.pid, 4242);
        assert_eq!(signed.identity.cwd, PathBuf::from("/work"));
        assert_eq!(signed.identity.env["HOME"].as_deref(), Some("/home/dev"));
    }

    #[test]
    fn sign_then_verify() {
        let (signer, _) = signer();
        let req = terraform();
        let signed = signer.sign(&req).unwrap();
        assert_eq!(signed.signature.len(), 64);
        assert!(signer.verify(&signed, &req));
    }

    #[test]
    fn tokens_are_single_use() {
        let (signer, _) = signer();
        let req = terraform();
        let signed = signer.sign(&req).unwrap();
        assert!(signer.verify(&signed, &req));
        let replay = signer.verify_detailed(&signed, &req);
        assert_eq!(replay.failure, Some(IntegrityFailure::TokenMismatch));
    }

    #[test]
    fn request_cwd_change_fails_even_with_valid_signature() {
        let (signer, _) = signer();
        let mut req = terraform();
        let signed = signer.sign(&req).unwrap();
        req.cwd = PathBuf::from("/tmp/elsewhere");
        let report = signer.verify_detailed(&signed, &req);
        assert!(!report.valid);
        assert_eq!(report.failure, Some(IntegrityFailure::IdentityDrift));
        assert_eq!(report.drifted, ["cwd"]);
        assert!(report.to_error().unwrap().message.contains("cwd"));
    }

    #[test]
    fn request_env_change_names_the_variable() {
        let (signer, _) = signer();
        let mut req = request("make", &[]);
        let signed = signer.sign(&req).unwrap();
        req.env.insert("LD_PRELOAD".into(), "/tmp/hook.so".into());
        let report = signer.verify_detailed(&signed, &req);
        assert_eq!(report.drifted, ["env.LD_PRELOAD"]);
    }

    #[test]
    fn unnamed_env_change_is_caught_by_digest() {
        let (signer, _) = signer();
        let mut req = request("make", &[]);
        let signed = signer.sign(&req).unwrap();
        req.env.insert("GIT_SSH_COMMAND".into(), "./evil.sh".into());
        let report = signer.verify_detailed(&signed, &req);
        assert_eq!(report.drifted, ["env"]);
    }

    #[test]
    fn substituted_program_or_args_drift() {
        let (signer, _) = signer();
        let signed = signer.sign(&terraform()).unwrap();
        let report = signer.verify_detailed(&signed, &request("terraform", &["destroy"]));
        assert_eq!(report.failure, Some(IntegrityFailure::IdentityDrift));
        assert_eq!(report.drifted, ["args"]);

        let signed = signer.sign(&terraform()).unwrap();
        let report = signer.verify_detailed(&signed, &request("sh", &["apply", "-auto-approve"]));
        assert_eq!(report.drifted, ["program"]);
    }

    #[test]
    fn principal_change_drifts() {
        let (signer, probe) = signer();
        let req = terraform();
        let signed = signer.sign(&req).unwrap();
        probe.0.lock().unwrap().uid = 0;
        let report = signer.verify_detailed(&signed, &req);
        assert_eq!(report.drifted, ["uid"]);
    }

    #[test]
    fn window_expires() {
        let (signer, _) = signer();
        let req = request("make", &[]);
        let now = Utc::now();
        let signed = signer.sign_at(&req, now).unwrap();
        let report = signer.verify_at(&signed, &req, now + chrono::Duration::seconds(6));
        assert_eq!(report.failure, Some(IntegrityFailure::Expired));
    }

    #[test]
    fn tampered_args_break_the_signature() {
        let (signer, _) = signer();
        let req = terraform();
        let mut signed = signer.sign(&req).unwrap();
        signed.args.push("-destroy".into());
        let report = signer.verify_detailed(&signed, &req);
        assert_eq!(report.failure, Some(IntegrityFailure::BadSignature));
    }

    #[test]
    fn another_signer_cannot_verify() {
        let (first, _) = signer();
        let (second, _) = signer();
        let req = request("make", &[]);
        let signed = first.sign(&req).unwrap();
        // Unknown token to the second signer.
        assert!(!second.verify(&signed, &req));
    }

    #[test]
    fn hex_round_trip_rejects_garbage() {
        assert_eq!(from_hex(&to_hex(&[0, 255, 16])), Some(vec![0, 255, 16]));
        assert_eq!(from_hex("abc"), None);
        assert_eq!(from_hex("zz"), None);
    }
}
