use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use obj_lib::{CacheError, CacheResult};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Deadline applied to every namespace lock acquisition.
pub const NS_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

type NsKey = (String, String);

#[derive(Debug)]
struct NsEntry {
    rw: Arc<RwLock<()>>,
    refs: usize,
}

#[derive(Debug)]
struct NsLockTable {
    table: Mutex<HashMap<NsKey, NsEntry>>,
}

/// Per-(bucket, object) readers/writer locks with reference counting.
///
/// Entries are created on first use and reaped once the last guard for a
/// key is dropped, so the table only ever holds keys with live waiters or
/// holders. The table itself is guarded by a short mutex critical section
/// that is independent of the per-key locks.
#[derive(Clone)]
pub struct NamespaceLockMap {
    inner: Arc<NsLockTable>,
}

#[derive(Debug)]
enum NsGuardKind {
    Read(OwnedRwLockReadGuard<()>),
    Write(OwnedRwLockWriteGuard<()>),
}

/// Held namespace lock; releasing is dropping.
#[derive(Debug)]
pub struct NsLockGuard {
    inner: Arc<NsLockTable>,
    key: NsKey,
    guard: Option<NsGuardKind>,
}

impl Drop for NsLockGuard {
    fn drop(&mut self) {
        // release the rw lock before touching the table, so a reaped key
        // can not leave a waiter stranded on a stale lock instance
        self.guard.take();
        release_ref(&self.inner, &self.key);
    }
}

fn release_ref(inner: &NsLockTable, key: &NsKey) {
    let mut table = inner.table.lock().unwrap();
    if let Some(entry) = table.get_mut(key) {
        entry.refs -= 1;
        if entry.refs == 0 {
            table.remove(key);
        }
    }
}

impl NamespaceLockMap {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NsLockTable {
                table: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub async fn acquire_read(
        &self,
        bucket: &str,
        object: &str,
        timeout: Duration,
    ) -> CacheResult<NsLockGuard> {
        self.acquire(bucket, object, false, timeout).await
    }

    pub async fn acquire_write(
        &self,
        bucket: &str,
        object: &str,
        timeout: Duration,
    ) -> CacheResult<NsLockGuard> {
        self.acquire(bucket, object, true, timeout).await
    }

    async fn acquire(
        &self,
        bucket: &str,
        object: &str,
        write: bool,
        timeout: Duration,
    ) -> CacheResult<NsLockGuard> {
        let key = (bucket.to_string(), object.to_string());
        let rw = {
            let mut table = self.inner.table.lock().unwrap();
            let entry = table.entry(key.clone()).or_insert_with(|| NsEntry {
                rw: Arc::new(RwLock::new(())),
                refs: 0,
            });
            entry.refs += 1;
            entry.rw.clone()
        };

        let guard = if write {
            tokio::time::timeout(timeout, rw.write_owned())
                .await
                .ok()
                .map(NsGuardKind::Write)
        } else {
            tokio::time::timeout(timeout, rw.read_owned())
                .await
                .ok()
                .map(NsGuardKind::Read)
        };

        match guard {
            Some(kind) => Ok(NsLockGuard {
                inner: self.inner.clone(),
                key,
                guard: Some(kind),
            }),
            None => {
                release_ref(&self.inner, &key);
                Err(CacheError::LockTimeout(format!(
                    "namespace lock on {}/{} timed out",
                    bucket, object
                )))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.table.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NamespaceLockMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shared_readers() {
        let locks = NamespaceLockMap::new();
        let r1 = locks
            .acquire_read("b", "o", Duration::from_millis(100))
            .await
            .unwrap();
        let r2 = locks
            .acquire_read("b", "o", Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(locks.len(), 1);
        drop(r1);
        drop(r2);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_writer_excludes_and_times_out() {
        let locks = NamespaceLockMap::new();
        let w = locks
            .acquire_write("b", "o", Duration::from_millis(100))
            .await
            .unwrap();

        let err = locks
            .acquire_read("b", "o", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::LockTimeout(_)));

        drop(w);
        let _r = locks
            .acquire_read("b", "o", Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_independent_keys_do_not_contend() {
        let locks = NamespaceLockMap::new();
        let _w1 = locks
            .acquire_write("b", "one", Duration::from_millis(50))
            .await
            .unwrap();
        let _w2 = locks
            .acquire_write("b", "two", Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_reap_after_timeout() {
        let locks = NamespaceLockMap::new();
        let w = locks
            .acquire_write("b", "o", Duration::from_millis(100))
            .await
            .unwrap();
        let _ = locks
            .acquire_write("b", "o", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(locks.len(), 1);
        drop(w);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_writer_waits_for_readers() {
        let locks = NamespaceLockMap::new();
        let r = locks
            .acquire_read("b", "o", Duration::from_millis(100))
            .await
            .unwrap();

        let locks2 = locks.clone();
        let writer = tokio::spawn(async move {
            locks2
                .acquire_write("b", "o", Duration::from_secs(5))
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(r);
        let _w = writer.await.unwrap();
    }
}
