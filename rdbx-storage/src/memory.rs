//! In-process key/value service.

use crate::traits::{CacheStore, LockService};
use async_trait::async_trait;
use rdbx_core::{CacheError, LockError, RdbxResult};
use std::collections::{HashMap, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
enum Data {
    Scalar(Vec<u8>),
    List(VecDeque<Vec<u8>>),
}

#[derive(Debug, Clone)]
struct Entry {
    data: Data,
    expires_at: Option<Instant>,
}

impl Entry {
    fn scalar(value: &[u8], ttl: Duration) -> Self {
        Self {
            data: Data::Scalar(value.to_vec()),
            expires_at: Some(Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// [`CacheStore`] and [`LockService`] backed by a process-local map.
///
/// All operations take one `RwLock`, which makes set-if-absent and
/// compare-and-delete atomic. Expired keys are dropped lazily on access or
/// by [`purge_expired`](Self::purge_expired).
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .map(|entries| entries.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired key, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        match self.entries.write() {
            Ok(mut entries) => {
                let before = entries.len();
                entries.retain(|_, e| e.is_live(now));
                before - entries.len()
            }
            Err(_) => 0,
        }
    }

    fn read_cache(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Entry>>, CacheError> {
        self.entries.read().map_err(|_| CacheError::LockPoisoned)
    }

    fn write_cache(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Entry>>, CacheError> {
        self.entries.write().map_err(|_| CacheError::LockPoisoned)
    }

    fn write_locks(&self, key: &str) -> Result<RwLockWriteGuard<'_, HashMap<String, Entry>>, LockError> {
        self.entries.write().map_err(|_| LockError::Service {
            key: key.to_string(),
            reason: "store lock poisoned".to_string(),
        })
    }

    fn live_scalar(entries: &HashMap<String, Entry>, key: &str, now: Instant) -> Option<Vec<u8>> {
        match entries.get(key) {
            Some(Entry {
                data: Data::Scalar(bytes),
                expires_at,
            }) if expires_at.map_or(true, |at| now < at) => Some(bytes.clone()),
            _ => None,
        }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> RdbxResult<Option<Vec<u8>>> {
        let entries = self.read_cache()?;
        if let Some(Entry {
            data: Data::List(_),
            ..
        }) = entries.get(key)
        {
            return Err(CacheError::ReadFailed {
                key: key.to_string(),
                reason: "key holds a list".to_string(),
            }
            .into());
        }
        Ok(Self::live_scalar(&entries, key, Instant::now()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> RdbxResult<()> {
        let mut entries = self.write_cache()?;
        entries.insert(key.to_string(), Entry::scalar(value, ttl));
        Ok(())
    }

    async fn append(&self, key: &str, value: &[u8]) -> RdbxResult<u64> {
        let now = Instant::now();
        let mut entries = self.write_cache()?;
        let entry = entries
            .entry(key.to_string())
            .and_modify(|e| {
                if !e.is_live(now) {
                    *e = Entry {
                        data: Data::List(VecDeque::new()),
                        expires_at: None,
                    };
                }
            })
            .or_insert_with(|| Entry {
                data: Data::List(VecDeque::new()),
                expires_at: None,
            });

        match &mut entry.data {
            Data::List(list) => {
                list.push_front(value.to_vec());
                Ok(list.len() as u64)
            }
            Data::Scalar(_) => Err(CacheError::WriteFailed {
                key: key.to_string(),
                reason: "key holds a scalar".to_string(),
            }
            .into()),
        }
    }

    async fn get_list(&self, key: &str) -> RdbxResult<Vec<Vec<u8>>> {
        let now = Instant::now();
        let entries = self.read_cache()?;
        match entries.get(key) {
            Some(entry) if !entry.is_live(now) => Ok(Vec::new()),
            Some(Entry {
                data: Data::List(list),
                ..
            }) => Ok(list.iter().cloned().collect()),
            Some(_) => Err(CacheError::ReadFailed {
                key: key.to_string(),
                reason: "key holds a scalar".to_string(),
            }
            .into()),
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl LockService for MemoryStore {
    async fn try_lock(&self, key: &str, token: &str, lease: Duration) -> RdbxResult<bool> {
        let now = Instant::now();
        let mut entries = self.write_locks(key)?;
        if entries.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        entries.insert(key.to_string(), Entry::scalar(token.as_bytes(), lease));
        Ok(true)
    }

    async fn unlock(&self, key: &str, token: &str) -> RdbxResult<bool> {
        let now = Instant::now();
        let mut entries = self.write_locks(key)?;
        match Self::live_scalar(&entries, key, now) {
            Some(current) if current == token.as_bytes() => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> RdbxResult<Option<String>> {
        let entries = self.entries.read().map_err(|_| LockError::Service {
            key: key.to_string(),
            reason: "store lock poisoned".to_string(),
        })?;
        Ok(Self::live_scalar(&entries, key, Instant::now())
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> RdbxResult<()> {
        let mut entries = self.write_locks(key)?;
        entries.insert(key.to_string(), Entry::scalar(value.as_bytes(), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> RdbxResult<u64> {
        let now = Instant::now();
        let mut entries = self.write_locks(key)?;
        match entries.remove(key) {
            Some(entry) if entry.is_live(now) => Ok(1),
            _ => Ok(0),
        }
    }
}
