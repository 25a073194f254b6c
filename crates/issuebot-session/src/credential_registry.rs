//! Concurrent `{chat user -> tracker credential}` registry with durable backing.
//!
//! Mutations bump a monotonic version under the map's write lock and hand the
//! caller a [`FlushTicket`]. Flushing is single-flight: flushers serialize on
//! one lock, snapshot the map together with its version, and skip the write
//! when an equal or newer snapshot is already persisted. Every flush runs on a
//! blocking task that is never cancelled midway, so an abandoned waiter can
//! not let an older snapshot land after a newer one.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::{
    credential::{Credential, CredentialSecret, UserId},
    credential_storage::{CredentialStorage, StorageError},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("user {0} is already registered")]
    AlreadyRegistered(UserId),
}

/// Registry version a caller needs persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FlushTicket {
    version: u64,
}

impl FlushTicket {
    pub fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// A snapshot at `version` was written.
    Written { version: u64 },
    /// An equal or newer snapshot was already persisted.
    Coalesced { persisted_version: u64 },
}

#[derive(Debug, Error)]
pub enum FlushError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("timed out after {0:?} waiting for credential flush")]
    TimedOut(Duration),
}

/// Handle for a scheduled flush. Dropping it does not cancel the write.
#[derive(Debug)]
pub struct FlushHandle {
    ticket: FlushTicket,
    task: JoinHandle<Result<FlushOutcome, StorageError>>,
}

impl FlushHandle {
    pub fn ticket(&self) -> FlushTicket {
        self.ticket
    }

    pub async fn wait(self, timeout: Duration) -> Result<FlushOutcome, FlushError> {
        match tokio::time::timeout(timeout, self.task).await {
            Ok(Ok(result)) => result.map_err(FlushError::from),
            Ok(Err(join_error)) => Err(FlushError::Storage(StorageError::FlushTask(
                join_error.to_string(),
            ))),
            Err(_) => Err(FlushError::TimedOut(timeout)),
        }
    }
}

#[derive(Debug, Default)]
struct RegistryEntries {
    users: HashMap<UserId, CredentialSecret>,
    version: u64,
}

pub struct CredentialRegistry {
    entries: RwLock<RegistryEntries>,
    persisted_version: Mutex<u64>,
    storage: Arc<dyn CredentialStorage>,
}

impl CredentialRegistry {
    /// Loads the registry from `storage`. A missing artifact yields an empty
    /// registry; a corrupt one is returned as an error.
    pub fn load(storage: Arc<dyn CredentialStorage>) -> Result<Self, StorageError> {
        let (users, needs_rewrite) = match storage.load()? {
            Some(stored) => (stored.users.into_iter().collect(), stored.needs_rewrite),
            None => (HashMap::new(), false),
        };
        tracing::info!(
            registered_users = users.len(),
            legacy_format = needs_rewrite,
            "credential registry loaded"
        );
        // A legacy artifact starts dirty so the next flush rewrites it.
        let version = u64::from(needs_rewrite);
        Ok(Self {
            entries: RwLock::new(RegistryEntries { users, version }),
            persisted_version: Mutex::new(0),
            storage,
        })
    }

    pub fn lookup(&self, user_id: &UserId) -> Option<Credential> {
        let entries = self.read_entries();
        entries
            .users
            .get(user_id)
            .map(|secret| Credential::new(user_id.clone(), secret.clone()))
    }

    pub fn contains(&self, user_id: &UserId) -> bool {
        self.read_entries().users.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.read_entries().users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds a credential. Never overwrites an existing registration.
    pub fn register(
        &self,
        user_id: UserId,
        secret: CredentialSecret,
    ) -> Result<FlushTicket, RegistryError> {
        let mut entries = self.write_entries();
        if entries.users.contains_key(&user_id) {
            return Err(RegistryError::AlreadyRegistered(user_id));
        }
        entries.users.insert(user_id, secret);
        entries.version = entries.version.saturating_add(1);
        Ok(FlushTicket {
            version: entries.version,
        })
    }

    /// Removes a registration. Unknown users are not an error.
    pub fn unregister(&self, user_id: &UserId) -> FlushTicket {
        let mut entries = self.write_entries();
        if entries.users.remove(user_id).is_some() {
            entries.version = entries.version.saturating_add(1);
        }
        FlushTicket {
            version: entries.version,
        }
    }

    pub fn current_version(&self) -> u64 {
        self.read_entries().version
    }

    pub fn persisted_version(&self) -> u64 {
        *self
            .persisted_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_dirty(&self) -> bool {
        self.persisted_version() < self.current_version()
    }

    /// Schedules a flush that persists at least `ticket`'s version.
    pub fn schedule_flush(self: &Arc<Self>, ticket: FlushTicket) -> FlushHandle {
        let registry = Arc::clone(self);
        let task = tokio::task::spawn_blocking(move || registry.flush_through(ticket));
        FlushHandle { ticket, task }
    }

    /// Persists everything mutated so far.
    pub async fn flush_all(self: &Arc<Self>) -> Result<FlushOutcome, StorageError> {
        let ticket = FlushTicket {
            version: self.current_version(),
        };
        let registry = Arc::clone(self);
        tokio::task::spawn_blocking(move || registry.flush_through(ticket))
            .await
            .map_err(|error| StorageError::FlushTask(error.to_string()))?
    }

    /// Blocking single-flight flush.
    pub fn flush_through(&self, ticket: FlushTicket) -> Result<FlushOutcome, StorageError> {
        let mut persisted = self
            .persisted_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *persisted >= ticket.version {
            return Ok(FlushOutcome::Coalesced {
                persisted_version: *persisted,
            });
        }

        let (snapshot, version) = {
            let entries = self.read_entries();
            let snapshot = entries
                .users
                .iter()
                .map(|(user_id, secret)| (user_id.clone(), secret.clone()))
                .collect::<BTreeMap<_, _>>();
            (snapshot, entries.version)
        };
        self.storage.store(&snapshot)?;
        *persisted = version;
        tracing::debug!(
            version,
            registered_users = snapshot.len(),
            "credential registry flushed"
        );
        Ok(FlushOutcome::Written { version })
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, RegistryEntries> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, RegistryEntries> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for CredentialRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRegistry")
            .field("registered_users", &self.len())
            .field("version", &self.current_version())
            .field("persisted_version", &self.persisted_version())
            .finish()
    }
}
