//! Authentication policy.
//!
//! The SSH layer turns every credential a client presents into a
//! [`Credential`] and asks the configured [`AuthPolicy`] for a decision. An
//! accepted credential yields the [`Identity`] the session runs under.

use std::collections::HashSet;
use std::sync::Arc;

use crate::config::AuthConfig;
use crate::session::PtyRequest;

/// How a client authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Password,
    PublicKey,
    KeyboardInteractive,
}

/// The authenticated party behind a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// User name sent by the client.
    pub user: String,
    /// Method that succeeded.
    pub method: AuthMethod,
    /// SHA-256 fingerprint of the client key, for public key auth.
    pub fingerprint: Option<String>,
}

impl Identity {
    fn from_credential(credential: &Credential<'_>) -> Self {
        Self {
            user: credential.user().to_string(),
            method: credential.method(),
            fingerprint: match credential {
                Credential::PublicKey { fingerprint, .. } => Some(fingerprint.to_string()),
                _ => None,
            },
        }
    }
}

/// A credential presented by a client.
#[derive(Debug, Clone, Copy)]
pub enum Credential<'a> {
    Password { user: &'a str, password: &'a str },
    PublicKey { user: &'a str, fingerprint: &'a str },
    KeyboardInteractive { user: &'a str },
}

impl<'a> Credential<'a> {
    pub fn user(&self) -> &'a str {
        match self {
            Credential::Password { user, .. }
            | Credential::PublicKey { user, .. }
            | Credential::KeyboardInteractive { user } => *user,
        }
    }

    pub fn method(&self) -> AuthMethod {
        match self {
            Credential::Password { .. } => AuthMethod::Password,
            Credential::PublicKey { .. } => AuthMethod::PublicKey,
            Credential::KeyboardInteractive { .. } => AuthMethod::KeyboardInteractive,
        }
    }
}

/// Outcome of an authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Accept(Identity),
    Reject,
}

/// Decides which clients may connect and open terminals.
pub trait AuthPolicy: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn authenticate(&self, credential: &Credential<'_>) -> AuthDecision;

    /// Whether `identity` may allocate a PTY with `request`.
    fn allow_pty(&self, _identity: &Identity, _request: &PtyRequest) -> bool {
        true
    }
}

/// Accepts every credential and every PTY request.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissivePolicy;

impl AuthPolicy for PermissivePolicy {
    fn name(&self) -> &'static str {
        "permissive"
    }

    fn authenticate(&self, credential: &Credential<'_>) -> AuthDecision {
        AuthDecision::Accept(Identity::from_credential(credential))
    }
}

/// Accepts only public keys whose fingerprint is on the list.
#[derive(Debug, Clone, Default)]
pub struct FingerprintAllowList {
    fingerprints: HashSet<String>,
}

impl FingerprintAllowList {
    /// Builds the list. Entries may carry the `SHA256:` prefix OpenSSH prints.
    pub fn new<I, S>(fingerprints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            fingerprints: fingerprints
                .into_iter()
                .map(|f| normalize_fingerprint(f.as_ref()).to_string())
                .filter(|f| !f.is_empty())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.fingerprints
            .contains(normalize_fingerprint(fingerprint))
    }
}

impl AuthPolicy for FingerprintAllowList {
    fn name(&self) -> &'static str {
        "fingerprint-allow-list"
    }

    fn authenticate(&self, credential: &Credential<'_>) -> AuthDecision {
        match credential {
            Credential::PublicKey { fingerprint, .. } if self.contains(fingerprint) => {
                AuthDecision::Accept(Identity::from_credential(credential))
            }
            _ => AuthDecision::Reject,
        }
    }
}

fn normalize_fingerprint(fingerprint: &str) -> &str {
    let trimmed = fingerprint.trim();
    trimmed.strip_prefix("SHA256:").unwrap_or(trimmed)
}

/// Builds the policy selected by the `[auth]` config section.
pub fn policy_from_config(config: &AuthConfig) -> Arc<dyn AuthPolicy> {
    if config.allowed_fingerprints.is_empty() {
        Arc::new(PermissivePolicy)
    } else {
        Arc::new(FingerprintAllowList::new(&config.allowed_fingerprints))
    }
}
