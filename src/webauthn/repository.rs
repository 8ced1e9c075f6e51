//! Repository interfaces consumed by the ceremonies
//!
//! Persistence is an external concern. The relying party only needs user
//! lookup and credential storage through these traits; the in-memory
//! implementations back tests and single-process deployments.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

use super::errors::{AssertionFailure, WebAuthnError};
use super::types::{Base64Url, Credential, UserIdentity};

/// Errors reported by a repository implementation
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Conflicting record: {0}")]
    Conflict(String),

    #[error("Storage failure: {0}")]
    Storage(String),

    /// Another assertion advanced the counter first
    #[error("Counter already at {stored}, cannot store {presented}")]
    CounterConflict { stored: u32, presented: u32 },
}

impl From<RepositoryError> for WebAuthnError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::CounterConflict { stored, presented } => {
                WebAuthnError::AssertionFailed(AssertionFailure::CounterRegression {
                    stored,
                    presented,
                })
            }
            other => WebAuthnError::Repository(other.to_string()),
        }
    }
}

/// User account lookup and storage
pub trait UserRepository: Send + Sync {
    /// Find a user by username
    ///
    /// # Errors
    /// Returns an error if the backing store fails
    fn find_by_username(&self, username: &str) -> Result<Option<UserIdentity>, RepositoryError>;

    /// Find a user by user handle, as returned in discoverable assertions
    ///
    /// # Errors
    /// Returns an error if the backing store fails
    fn find_by_handle(&self, handle: &Base64Url) -> Result<Option<UserIdentity>, RepositoryError>;

    /// Save a user
    ///
    /// # Errors
    /// Returns `Conflict` if the username is taken by a different user handle
    fn save(&self, user: UserIdentity) -> Result<(), RepositoryError>;
}

/// Credential lookup and storage
pub trait CredentialRepository: Send + Sync {
    /// Find a credential by its ID
    ///
    /// # Errors
    /// Returns an error if the backing store fails
    fn find_by_credential_id(&self, credential_id: &[u8])
        -> Result<Option<Credential>, RepositoryError>;

    /// All credentials owned by a user
    ///
    /// # Errors
    /// Returns an error if the backing store fails
    fn find_by_user(&self, user: &UserIdentity) -> Result<Vec<Credential>, RepositoryError>;

    /// Store a new credential
    ///
    /// # Errors
    /// Returns `Conflict` if the credential ID is already registered
    fn save(&self, credential: Credential) -> Result<(), RepositoryError>;

    /// Persist the counter reported by a successful assertion
    ///
    /// `previous` is the counter the assertion was verified against. The
    /// stored counter never decreases: the write is refused when `counter` is
    /// below the stored value, or equal to it after the stored value moved
    /// away from `previous`. Implementations must check and write atomically.
    ///
    /// # Errors
    /// - `NotFound` if the credential does not exist
    /// - `CounterConflict` if a concurrent assertion already stored a counter at or past `counter`
    fn update_counter(
        &self,
        credential_id: &[u8],
        previous: u32,
        counter: u32,
        used_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    /// Revoke a credential; returns whether it existed
    ///
    /// # Errors
    /// Returns an error if the backing store fails
    fn delete(&self, credential_id: &[u8]) -> Result<bool, RepositoryError>;
}

/// In-memory user repository
#[derive(Debug, Default)]
pub struct InMemoryUserRepository {
    users: DashMap<String, UserIdentity>,
    handles: DashMap<Base64Url, String>,
}

impl InMemoryUserRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl UserRepository for InMemoryUserRepository {
    fn find_by_username(&self, username: &str) -> Result<Option<UserIdentity>, RepositoryError> {
        Ok(self.users.get(username).map(|user| user.clone()))
    }

    fn find_by_handle(&self, handle: &Base64Url) -> Result<Option<UserIdentity>, RepositoryError> {
        let Some(username) = self.handles.get(handle).map(|name| name.clone()) else {
            return Ok(None);
        };
        self.find_by_username(&username)
    }

    fn save(&self, user: UserIdentity) -> Result<(), RepositoryError> {
        match self.users.entry(user.name.clone()) {
            Entry::Occupied(existing) if existing.get().id != user.id => Err(
                RepositoryError::Conflict(format!("username {} is taken", user.name)),
            ),
            Entry::Occupied(mut existing) => {
                existing.insert(user);
                Ok(())
            }
            Entry::Vacant(vacant) => {
                self.handles.insert(user.id.clone(), user.name.clone());
                vacant.insert(user);
                Ok(())
            }
        }
    }
}

/// In-memory credential repository keyed by credential ID
#[derive(Debug, Default)]
pub struct InMemoryCredentialRepository {
    credentials: DashMap<Vec<u8>, Credential>,
}

impl InMemoryCredentialRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

impl CredentialRepository for InMemoryCredentialRepository {
    fn find_by_credential_id(
        &self,
        credential_id: &[u8],
    ) -> Result<Option<Credential>, RepositoryError> {
        Ok(self
            .credentials
            .get(credential_id)
            .map(|credential| credential.clone()))
    }

    fn find_by_user(&self, user: &UserIdentity) -> Result<Vec<Credential>, RepositoryError> {
        let mut credentials: Vec<Credential> = self
            .credentials
            .iter()
            .filter(|entry| entry.user_handle == user.id)
            .map(|entry| entry.value().clone())
            .collect();
        credentials.sort_by_key(|credential| credential.created_at);
        Ok(credentials)
    }

    fn save(&self, credential: Credential) -> Result<(), RepositoryError> {
        match self
            .credentials
            .entry(credential.credential_id.as_slice().to_vec())
        {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(
                "credential ID already registered".to_string(),
            )),
            Entry::Vacant(vacant) => {
                vacant.insert(credential);
                Ok(())
            }
        }
    }

    fn update_counter(
        &self,
        credential_id: &[u8],
        previous: u32,
        counter: u32,
        used_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        // The shard write lock is held until the guard drops
        let Some(mut credential) = self.credentials.get_mut(credential_id) else {
            return Err(RepositoryError::NotFound("credential".to_string()));
        };
        let stored = credential.counter;
        if counter < stored || (counter == stored && stored != previous) {
            return Err(RepositoryError::CounterConflict {
                stored,
                presented: counter,
            });
        }
        credential.counter = counter;
        credential.last_used = Some(used_at);
        Ok(())
    }

    fn delete(&self, credential_id: &[u8]) -> Result<bool, RepositoryError> {
        Ok(self.credentials.remove(credential_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestFixtures;

    #[test]
    fn test_user_lookup_by_name_and_handle() {
        let repo = InMemoryUserRepository::new();
        let user = TestFixtures::user("alice", "Alice A");
        repo.save(user.clone()).unwrap();

        assert_eq!(repo.find_by_username("alice").unwrap(), Some(user.clone()));
        assert_eq!(repo.find_by_handle(&user.id).unwrap(), Some(user));
        assert_eq!(repo.find_by_username("bob").unwrap(), None);
    }

    #[test]
    fn test_username_conflict() {
        let repo = InMemoryUserRepository::new();
        repo.save(TestFixtures::user("alice", "Alice A")).unwrap();
        let err = repo.save(TestFixtures::user("alice", "Other Alice")).unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[test]
    fn test_credential_lifecycle() {
        let repo = InMemoryCredentialRepository::new();
        let user = TestFixtures::user("alice", "Alice A");
        let credential = TestFixtures::credential(&user, &[1, 2, 3, 4]);

        repo.save(credential.clone()).unwrap();
        assert!(matches!(
            repo.save(credential.clone()),
            Err(RepositoryError::Conflict(_))
        ));

        repo.update_counter(&[1, 2, 3, 4], 0, 9, Utc::now()).unwrap();
        let stored = repo.find_by_credential_id(&[1, 2, 3, 4]).unwrap().unwrap();
        assert_eq!(stored.counter, 9);
        assert!(stored.last_used.is_some());
        assert_eq!(repo.find_by_user(&user).unwrap().len(), 1);

        assert!(repo.delete(&[1, 2, 3, 4]).unwrap());
        assert!(!repo.delete(&[1, 2, 3, 4]).unwrap());
        assert!(matches!(
            repo.update_counter(&[1, 2, 3, 4], 9, 10, Utc::now()),
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[test]
    fn test_counter_never_moves_backwards() {
        let repo = InMemoryCredentialRepository::new();
        let user = TestFixtures::user("alice", "Alice A");
        repo.save(TestFixtures::credential(&user, &[7; 16])).unwrap();

        // Two assertions verified against counter 0; the higher one lands first
        repo.update_counter(&[7; 16], 0, 2, Utc::now()).unwrap();
        let err = repo.update_counter(&[7; 16], 0, 1, Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::CounterConflict {
                stored: 2,
                presented: 1
            }
        ));
        // Same value from a stale read is a conflict too
        assert!(repo.update_counter(&[7; 16], 0, 2, Utc::now()).is_err());
        assert_eq!(
            repo.find_by_credential_id(&[7; 16]).unwrap().unwrap().counter,
            2
        );

        // A later counter from a stale read still advances
        repo.update_counter(&[7; 16], 0, 5, Utc::now()).unwrap();
        // Unchanged counter from a fresh read only touches last_used
        repo.update_counter(&[7; 16], 5, 5, Utc::now()).unwrap();
        assert_eq!(
            repo.find_by_credential_id(&[7; 16]).unwrap().unwrap().counter,
            5
        );
    }

    #[test]
    fn test_counter_conflict_maps_to_counter_regression() {
        let err = WebAuthnError::from(RepositoryError::CounterConflict {
            stored: 4,
            presented: 3,
        });
        assert!(matches!(
            err,
            WebAuthnError::AssertionFailed(AssertionFailure::CounterRegression {
                stored: 4,
                presented: 3
            })
        ));
        assert!(matches!(
            WebAuthnError::from(RepositoryError::Storage("down".into())),
            WebAuthnError::Repository(_)
        ));
    }
}
