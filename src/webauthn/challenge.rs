//! Ephemeral challenge storage
//!
//! Challenges are short-lived and single-use. Each ceremony start issues one
//! keyed by ceremony kind and subject; the matching finish consumes it exactly
//! once. Expiry is checked lazily when a challenge is consumed.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ring::constant_time;

use super::crypto;
use super::errors::WebAuthnError;
use super::types::Base64Url;

/// Default challenge lifetime (5 minutes)
pub const DEFAULT_CHALLENGE_TTL_SECS: i64 = 300;

/// Entry count at which `issue` sweeps expired entries first
pub const DEFAULT_SWEEP_THRESHOLD: usize = 1024;

/// Which ceremony a challenge belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CeremonyKind {
    Registration,
    Authentication,
}

/// Who a challenge was issued for
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChallengeSubject {
    /// Named user
    User(String),
    /// Anonymous (discoverable credential) ceremony, keyed by the challenge itself
    Discoverable(String),
}

/// Storage key for an outstanding challenge
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChallengeKey {
    pub ceremony: CeremonyKind,
    pub subject: ChallengeSubject,
}

impl ChallengeKey {
    #[must_use]
    pub fn registration(username: &str) -> Self {
        Self {
            ceremony: CeremonyKind::Registration,
            subject: ChallengeSubject::User(username.to_string()),
        }
    }

    #[must_use]
    pub fn authentication(username: &str) -> Self {
        Self {
            ceremony: CeremonyKind::Authentication,
            subject: ChallengeSubject::User(username.to_string()),
        }
    }

    /// Key of a discoverable authentication ceremony
    #[must_use]
    pub fn discoverable(challenge: &[u8]) -> Self {
        Self {
            ceremony: CeremonyKind::Authentication,
            subject: ChallengeSubject::Discoverable(Base64Url::from(challenge).encode()),
        }
    }
}

impl fmt::Display for ChallengeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ceremony = match self.ceremony {
            CeremonyKind::Registration => "registration",
            CeremonyKind::Authentication => "authentication",
        };
        match &self.subject {
            ChallengeSubject::User(name) => write!(f, "{ceremony}:{name}"),
            ChallengeSubject::Discoverable(_) => write!(f, "{ceremony}:discoverable"),
        }
    }
}

/// Issued challenge
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Challenge {
    pub bytes: Vec<u8>,
    /// User handle the ceremony is bound to, if any
    pub user_handle: Option<Base64Url>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Observable ceremony state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CeremonyState {
    /// Challenge issued, no response yet
    AwaitingResponse,
    /// Challenge consumed, response being verified
    Verifying,
    Completed,
    Failed,
    Expired,
    /// No ceremony under this key
    Unknown,
}

/// Challenge store contract
///
/// Implementations must make `consume` atomic per key: two racing consumes of
/// the same challenge must not both succeed. Operations on distinct keys must
/// not block each other.
pub trait ChallengeStore: Send + Sync {
    /// Issue a fresh challenge, replacing any outstanding one under the same key
    ///
    /// Without a username the key is derived from the challenge itself.
    ///
    /// # Errors
    /// Returns `Internal` if the random source fails
    fn issue(
        &self,
        ceremony: CeremonyKind,
        username: Option<&str>,
        user_handle: Option<Base64Url>,
    ) -> Result<(ChallengeKey, Challenge), WebAuthnError>;

    /// Consume the challenge under `key` if `presented` matches it exactly
    ///
    /// The challenge is invalidated whether or not it matched.
    ///
    /// # Errors
    /// - `ChallengeNotFound` for unknown or expired keys
    /// - `ChallengeInvalid` for a mismatching or already consumed challenge
    fn consume(&self, key: &ChallengeKey, presented: &[u8]) -> Result<Challenge, WebAuthnError>;

    /// Invalidate an outstanding challenge without consuming it
    ///
    /// Used when a response is too malformed to present a challenge at all.
    /// Returns whether a pending challenge was invalidated.
    fn invalidate(&self, key: &ChallengeKey) -> bool;

    /// Record how the ceremony under a consumed challenge ended
    fn record_outcome(&self, key: &ChallengeKey, succeeded: bool);

    fn state(&self, key: &ChallengeKey) -> CeremonyState;

    /// Drop expired entries; returns how many were removed
    fn sweep_expired(&self) -> usize;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EntryStatus {
    Pending,
    Consumed,
    Completed,
    Failed,
}

#[derive(Clone, Debug)]
struct ChallengeEntry {
    challenge: Challenge,
    status: EntryStatus,
}

/// In-memory challenge store backed by a sharded concurrent map
///
/// Consumed entries are kept as tombstones until they expire so that a replay
/// is reported as `ChallengeInvalid` rather than `ChallengeNotFound`. Once the
/// map holds `sweep_threshold` entries, `issue` drops expired ones first, so
/// abandoned discoverable ceremonies do not accumulate.
pub struct InMemoryChallengeStore {
    entries: DashMap<ChallengeKey, ChallengeEntry>,
    ttl: Duration,
    challenge_len: usize,
    sweep_threshold: usize,
}

impl InMemoryChallengeStore {
    /// Create a store with the default 5 minute lifetime
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(Duration::seconds(DEFAULT_CHALLENGE_TTL_SECS))
    }

    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            challenge_len: crypto::CHALLENGE_LEN,
            sweep_threshold: DEFAULT_SWEEP_THRESHOLD,
        }
    }

    /// Entry count at which issuing sweeps expired entries (at least 1)
    #[must_use]
    pub fn with_sweep_threshold(mut self, threshold: usize) -> Self {
        self.sweep_threshold = threshold.max(1);
        self
    }

    /// Override the challenge length (never below 16 bytes)
    #[must_use]
    pub fn with_challenge_len(mut self, len: usize) -> Self {
        self.challenge_len = len.max(crypto::MIN_CHALLENGE_LEN);
        self
    }

    /// Number of entries, including tombstones
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for InMemoryChallengeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemoryChallengeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryChallengeStore")
            .field("entries", &self.entries.len())
            .field("ttl_seconds", &self.ttl.num_seconds())
            .finish_non_exhaustive()
    }
}

impl ChallengeStore for InMemoryChallengeStore {
    fn issue(
        &self,
        ceremony: CeremonyKind,
        username: Option<&str>,
        user_handle: Option<Base64Url>,
    ) -> Result<(ChallengeKey, Challenge), WebAuthnError> {
        if self.entries.len() >= self.sweep_threshold {
            let removed = self.sweep_expired();
            log::debug!("Swept {removed} expired challenge(s) before issuing");
        }

        let bytes = crypto::random_bytes(self.challenge_len)?;
        let key = match username {
            Some(name) => ChallengeKey {
                ceremony,
                subject: ChallengeSubject::User(name.to_string()),
            },
            None => ChallengeKey {
                ceremony,
                subject: ChallengeSubject::Discoverable(Base64Url::from(bytes.as_slice()).encode()),
            },
        };

        let created_at = Utc::now();
        let challenge = Challenge {
            bytes,
            user_handle,
            created_at,
            expires_at: created_at + self.ttl,
        };

        let replaced = self
            .entries
            .insert(
                key.clone(),
                ChallengeEntry {
                    challenge: challenge.clone(),
                    status: EntryStatus::Pending,
                },
            )
            .is_some();
        if replaced {
            log::debug!("Replaced outstanding challenge for {key}");
        }

        Ok((key, challenge))
    }

    fn consume(&self, key: &ChallengeKey, presented: &[u8]) -> Result<Challenge, WebAuthnError> {
        // The entry guard holds the shard lock for the whole check-and-invalidate
        match self.entries.entry(key.clone()) {
            Entry::Vacant(_) => {
                log::debug!("No challenge outstanding for {key}");
                Err(WebAuthnError::ChallengeNotFound)
            }
            Entry::Occupied(mut occupied) => {
                if occupied.get().challenge.expires_at <= Utc::now() {
                    occupied.remove();
                    log::debug!("Challenge for {key} expired");
                    return Err(WebAuthnError::ChallengeNotFound);
                }

                let entry = occupied.get_mut();
                if entry.status != EntryStatus::Pending {
                    log::warn!("Replay of consumed challenge for {key}");
                    return Err(WebAuthnError::ChallengeInvalid);
                }
                if constant_time::verify_slices_are_equal(&entry.challenge.bytes, presented)
                    .is_err()
                {
                    entry.status = EntryStatus::Failed;
                    log::warn!("Challenge mismatch for {key}");
                    return Err(WebAuthnError::ChallengeInvalid);
                }

                entry.status = EntryStatus::Consumed;
                Ok(entry.challenge.clone())
            }
        }
    }

    fn invalidate(&self, key: &ChallengeKey) -> bool {
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.status == EntryStatus::Pending => {
                entry.status = EntryStatus::Failed;
                true
            }
            _ => false,
        }
    }

    fn record_outcome(&self, key: &ChallengeKey, succeeded: bool) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.status == EntryStatus::Consumed {
                entry.status = if succeeded {
                    EntryStatus::Completed
                } else {
                    EntryStatus::Failed
                };
            }
        }
    }

    fn state(&self, key: &ChallengeKey) -> CeremonyState {
        let Some(entry) = self.entries.get(key) else {
            return CeremonyState::Unknown;
        };
        match entry.status {
            EntryStatus::Pending if entry.challenge.expires_at <= Utc::now() => {
                CeremonyState::Expired
            }
            EntryStatus::Pending => CeremonyState::AwaitingResponse,
            EntryStatus::Consumed => CeremonyState::Verifying,
            EntryStatus::Completed => CeremonyState::Completed,
            EntryStatus::Failed => CeremonyState::Failed,
        }
    }

    fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.challenge.expires_at > now);
        before.saturating_sub(self.entries.len())
    }
}
