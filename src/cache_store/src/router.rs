use std::sync::Arc;

use obj_lib::{CacheError, CacheResult};

use crate::DiskCache;

/// Deterministic hash placement across the drive slots. The hash index is a
/// hint: the slot list is treated as a circular buffer and walked from the
/// index until a usable drive turns up, so placement survives drives going
/// offline or being left unformatted (`None` slots).
pub struct CacheRouter {
    drives: Arc<Vec<Option<Arc<DiskCache>>>>,
}

impl CacheRouter {
    pub fn new(drives: Arc<Vec<Option<Arc<DiskCache>>>>) -> Self {
        Self { drives }
    }

    pub fn hash_index(&self, bucket: &str, object: &str) -> usize {
        crc32fast::hash(format!("{}/{}", bucket, object).as_bytes()) as usize % self.drives.len()
    }

    /// Placement target for a fill: the first online drive circularly from
    /// the hash index.
    pub fn locate_for_write(&self, bucket: &str, object: &str) -> CacheResult<Arc<DiskCache>> {
        let num = self.drives.len();
        let index = self.hash_index(bucket, object);
        for k in 0..num {
            if let Some(drive) = &self.drives[(index + k) % num] {
                if drive.is_online() {
                    return Ok(drive.clone());
                }
            }
        }
        Err(CacheError::DriveOffline(
            "no online cache drive".to_string(),
        ))
    }

    /// Drive to serve a read from: the online drive already holding the
    /// object if there is one, else the first online drive from the hash
    /// index as the re-cache target.
    pub async fn locate_for_read(&self, bucket: &str, object: &str) -> CacheResult<Arc<DiskCache>> {
        let num = self.drives.len();
        let index = self.hash_index(bucket, object);
        let mut first_online: Option<Arc<DiskCache>> = None;
        for k in 0..num {
            if let Some(drive) = &self.drives[(index + k) % num] {
                if !drive.is_online() {
                    continue;
                }
                if first_online.is_none() {
                    first_online = Some(drive.clone());
                }
                if drive.exists(bucket, object).await {
                    return Ok(drive.clone());
                }
            }
        }
        first_online.ok_or_else(|| CacheError::DriveOffline("no online cache drive".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use obj_lib::{METADATA_ETAG, SIZE_UNKNOWN};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    async fn drive_set(dirs: &[&TempDir]) -> Arc<Vec<Option<Arc<DiskCache>>>> {
        let mut drives = Vec::new();
        for dir in dirs {
            let cache = DiskCache::new(dir.path().to_path_buf(), 90, 100)
                .await
                .unwrap();
            drives.push(Some(Arc::new(cache)));
        }
        Arc::new(drives)
    }

    #[tokio::test]
    async fn test_write_placement_is_deterministic() {
        let d0 = TempDir::new().unwrap();
        let d1 = TempDir::new().unwrap();
        let d2 = TempDir::new().unwrap();
        let router = CacheRouter::new(drive_set(&[&d0, &d1, &d2]).await);

        let first = router.locate_for_write("b", "obj").unwrap();
        for _ in 0..10 {
            let again = router.locate_for_write("b", "obj").unwrap();
            assert_eq!(first.dir(), again.dir());
        }
        assert_eq!(
            router.hash_index("b", "obj"),
            crc32fast::hash(b"b/obj") as usize % 3
        );
    }

    #[tokio::test]
    async fn test_write_walks_past_offline_drives() {
        let d0 = TempDir::new().unwrap();
        let d1 = TempDir::new().unwrap();
        let drives = drive_set(&[&d0, &d1]).await;
        let router = CacheRouter::new(drives.clone());

        let target = router.locate_for_write("b", "o").unwrap();
        target.set_offline();

        let fallback = router.locate_for_write("b", "o").unwrap();
        assert_ne!(fallback.dir(), target.dir());

        for drive in drives.iter().flatten() {
            drive.set_offline();
        }
        assert!(matches!(
            router.locate_for_write("b", "o"),
            Err(CacheError::DriveOffline(_))
        ));
    }

    #[tokio::test]
    async fn test_read_prefers_drive_holding_the_object() {
        let d0 = TempDir::new().unwrap();
        let d1 = TempDir::new().unwrap();
        let d2 = TempDir::new().unwrap();
        let drives = drive_set(&[&d0, &d1, &d2]).await;
        let router = CacheRouter::new(drives.clone());
        let ctx = CancellationToken::new();

        // place the object away from its canonical slot
        let canonical = router.hash_index("b", "o");
        let other = (canonical + 1) % 3;
        let holder = drives[other].as_ref().unwrap();
        let mut metadata = HashMap::new();
        metadata.insert(METADATA_ETAG.to_string(), "e".to_string());
        holder
            .put(
                &ctx,
                "b",
                "o",
                Box::pin(std::io::Cursor::new(b"data".to_vec())),
                SIZE_UNKNOWN,
                &metadata,
            )
            .await
            .unwrap();

        let located = router.locate_for_read("b", "o").await.unwrap();
        assert_eq!(located.dir(), holder.dir());

        // with no copy anywhere, reads fall back to the canonical slot
        let fresh = router.locate_for_read("b", "other").await.unwrap();
        let expect = drives[router.hash_index("b", "other")].as_ref().unwrap();
        assert_eq!(fresh.dir(), expect.dir());
    }
}
