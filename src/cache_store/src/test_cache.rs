use std::collections::HashMap;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use obj_lib::{
    unix_now, BackendObjectLayer, BucketInfo, CacheError, CacheResult, CacheStorageInfo,
    GetObjectReader, HttpRangeSpec, ListObjectsInfo, ObjectInfo, ObjectOptions, ObjectReader,
    METADATA_CACHE_CONTROL, SSEC_ALGORITHM_KEY,
};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::{CacheConfig, CacheCoordinator, CacheEntryMeta, CACHE_META_FILE};

// ---- scripted backend ----

struct MockObject {
    data: Vec<u8>,
    info: ObjectInfo,
}

struct MockBackend {
    objects: Mutex<HashMap<(String, String), MockObject>>,
    policies: Mutex<HashMap<String, String>>,
    down: AtomicBool,
    info_calls: AtomicU64,
    read_calls: AtomicU64,
}

impl MockBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(HashMap::new()),
            policies: Mutex::new(HashMap::new()),
            down: AtomicBool::new(false),
            info_calls: AtomicU64::new(0),
            read_calls: AtomicU64::new(0),
        })
    }

    fn insert(
        &self,
        bucket: &str,
        object: &str,
        data: Vec<u8>,
        etag: &str,
        cache_control: Option<&str>,
    ) {
        let mut user_defined = HashMap::new();
        if let Some(cc) = cache_control {
            user_defined.insert(METADATA_CACHE_CONTROL.to_string(), cc.to_string());
        }
        let info = ObjectInfo {
            bucket: bucket.to_string(),
            name: object.to_string(),
            etag: etag.to_string(),
            size: data.len() as i64,
            mod_time: unix_now(),
            expires: 0,
            content_type: "application/octet-stream".to_string(),
            content_encoding: String::new(),
            user_defined,
        };
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), object.to_string()), MockObject { data, info });
    }

    fn set_user_defined(&self, bucket: &str, object: &str, key: &str, value: &str) {
        let mut objects = self.objects.lock().unwrap();
        let entry = objects
            .get_mut(&(bucket.to_string(), object.to_string()))
            .unwrap();
        entry
            .info
            .user_defined
            .insert(key.to_string(), value.to_string());
    }

    fn set_content_type(&self, bucket: &str, object: &str, content_type: &str) {
        let mut objects = self.objects.lock().unwrap();
        let entry = objects
            .get_mut(&(bucket.to_string(), object.to_string()))
            .unwrap();
        entry.info.content_type = content_type.to_string();
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn info_calls(&self) -> u64 {
        self.info_calls.load(Ordering::SeqCst)
    }

    fn read_calls(&self) -> u64 {
        self.read_calls.load(Ordering::SeqCst)
    }

    fn check_up(&self) -> CacheResult<()> {
        if self.down.load(Ordering::SeqCst) {
            Err(CacheError::BackendDown("mock backend is down".to_string()))
        } else {
            Ok(())
        }
    }

    fn lookup(&self, bucket: &str, object: &str) -> CacheResult<(Vec<u8>, ObjectInfo)> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), object.to_string()))
            .map(|o| (o.data.clone(), o.info.clone()))
            .ok_or_else(|| CacheError::NotFound(format!("{}/{}", bucket, object)))
    }
}

#[async_trait]
impl BackendObjectLayer for MockBackend {
    async fn get_object_ninfo(
        &self,
        _ctx: &CancellationToken,
        bucket: &str,
        object: &str,
        range: Option<&HttpRangeSpec>,
        _opts: &ObjectOptions,
    ) -> CacheResult<GetObjectReader> {
        self.check_up()?;
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        let (data, info) = self.lookup(bucket, object)?;
        let payload = match range {
            Some(rs) => {
                let (offset, length) = rs.get_offset_length(info.size)?;
                data[offset as usize..(offset + length) as usize].to_vec()
            }
            None => data,
        };
        Ok(GetObjectReader::new(Box::pin(Cursor::new(payload)), info))
    }

    async fn get_object_info(
        &self,
        _ctx: &CancellationToken,
        bucket: &str,
        object: &str,
        _opts: &ObjectOptions,
    ) -> CacheResult<ObjectInfo> {
        self.check_up()?;
        self.info_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.lookup(bucket, object)?.1)
    }

    async fn put_object(
        &self,
        _ctx: &CancellationToken,
        bucket: &str,
        object: &str,
        mut data: ObjectReader,
        _size: i64,
        _opts: &ObjectOptions,
    ) -> CacheResult<ObjectInfo> {
        self.check_up()?;
        let mut payload = Vec::new();
        data.read_to_end(&mut payload)
            .await
            .map_err(|e| CacheError::IoError(e.to_string()))?;
        let etag = format!("etag-{}", payload.len());
        self.insert(bucket, object, payload, &etag, None);
        Ok(self.lookup(bucket, object)?.1)
    }

    async fn delete_object(
        &self,
        _ctx: &CancellationToken,
        bucket: &str,
        object: &str,
    ) -> CacheResult<()> {
        self.check_up()?;
        self.objects
            .lock()
            .unwrap()
            .remove(&(bucket.to_string(), object.to_string()))
            .map(|_| ())
            .ok_or_else(|| CacheError::NotFound(format!("{}/{}", bucket, object)))
    }

    async fn list_buckets(&self, _ctx: &CancellationToken) -> CacheResult<Vec<BucketInfo>> {
        self.check_up()?;
        let mut names: Vec<String> = self
            .objects
            .lock()
            .unwrap()
            .keys()
            .map(|(b, _)| b.clone())
            .collect();
        names.sort();
        names.dedup();
        Ok(names
            .into_iter()
            .map(|name| BucketInfo {
                name,
                created: unix_now(),
            })
            .collect())
    }

    async fn list_objects(
        &self,
        _ctx: &CancellationToken,
        bucket: &str,
        prefix: &str,
        _marker: &str,
        _delimiter: &str,
        max_keys: usize,
    ) -> CacheResult<ListObjectsInfo> {
        self.check_up()?;
        let objects = self.objects.lock().unwrap();
        let mut matched: Vec<ObjectInfo> = objects
            .iter()
            .filter(|((b, o), _)| b == bucket && o.starts_with(prefix))
            .map(|(_, obj)| obj.info.clone())
            .collect();
        matched.sort_by(|a, b| a.name.cmp(&b.name));
        let is_truncated = matched.len() > max_keys;
        matched.truncate(max_keys);
        Ok(ListObjectsInfo {
            is_truncated,
            next_marker: String::new(),
            objects: matched,
            prefixes: Vec::new(),
        })
    }

    async fn make_bucket_with_location(
        &self,
        _ctx: &CancellationToken,
        _bucket: &str,
        _location: &str,
    ) -> CacheResult<()> {
        self.check_up()
    }

    async fn storage_info(&self, _ctx: &CancellationToken) -> CacheResult<CacheStorageInfo> {
        self.check_up()?;
        Ok(CacheStorageInfo {
            total: 1 << 40,
            free: 1 << 39,
        })
    }

    async fn get_bucket_policy(
        &self,
        _ctx: &CancellationToken,
        bucket: &str,
    ) -> CacheResult<String> {
        self.check_up()?;
        self.policies
            .lock()
            .unwrap()
            .get(bucket)
            .cloned()
            .ok_or_else(|| CacheError::NotFound(format!("no policy on {}", bucket)))
    }

    async fn set_bucket_policy(
        &self,
        _ctx: &CancellationToken,
        bucket: &str,
        policy: &str,
    ) -> CacheResult<()> {
        self.check_up()?;
        self.policies
            .lock()
            .unwrap()
            .insert(bucket.to_string(), policy.to_string());
        Ok(())
    }

    async fn delete_bucket_policy(
        &self,
        _ctx: &CancellationToken,
        bucket: &str,
    ) -> CacheResult<()> {
        self.check_up()?;
        self.policies.lock().unwrap().remove(bucket);
        Ok(())
    }
}

// ---- fixtures ----

struct TestCluster {
    coordinator: Arc<CacheCoordinator>,
    backend: Arc<MockBackend>,
    drive_dirs: Vec<TempDir>,
    ctx: CancellationToken,
}

async fn new_cluster(num_drives: usize, exclude: Vec<String>) -> TestCluster {
    let drive_dirs: Vec<TempDir> = (0..num_drives).map(|_| TempDir::new().unwrap()).collect();
    let config = CacheConfig {
        drives: drive_dirs.iter().map(|d| d.path().to_path_buf()).collect(),
        exclude,
        expiry: 90,
        max_use: 100,
    };
    let backend = MockBackend::new();
    let coordinator = CacheCoordinator::new(config, backend.clone() as Arc<dyn BackendObjectLayer>)
        .await
        .unwrap();
    TestCluster {
        coordinator,
        backend,
        drive_dirs,
        ctx: CancellationToken::new(),
    }
}

fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn read_all(reader: &mut GetObjectReader) -> Vec<u8> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    out
}

/// Walk the drive directories and collect every committed entry's metadata
/// plus the number of leftover temp files.
fn scan_drives(dirs: &[TempDir]) -> (Vec<CacheEntryMeta>, usize) {
    let mut metas = Vec::new();
    let mut tmp_files = 0usize;
    for dir in dirs {
        let mut stack: Vec<PathBuf> = vec![dir.path().to_path_buf()];
        while let Some(current) = stack.pop() {
            let entries = match std::fs::read_dir(&current) {
                Ok(e) => e,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                match path.file_name().and_then(|n| n.to_str()) {
                    Some(CACHE_META_FILE) => {
                        let bytes = std::fs::read(&path).unwrap();
                        metas.push(serde_json::from_slice(&bytes).unwrap());
                    }
                    Some(name) if name.ends_with(".tmp") => tmp_files += 1,
                    _ => {}
                }
            }
        }
    }
    (metas, tmp_files)
}

/// Wait until the fill machinery settles into `expected` committed entries
/// with no temp files left behind.
async fn wait_for_entries(dirs: &[TempDir], expected: usize) -> Vec<CacheEntryMeta> {
    for _ in 0..500 {
        let (metas, tmp_files) = scan_drives(dirs);
        if metas.len() == expected && tmp_files == 0 {
            return metas;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let (metas, tmp_files) = scan_drives(dirs);
    panic!(
        "cache did not settle: {} entries ({} expected), {} temp files",
        metas.len(),
        expected,
        tmp_files
    );
}

// ---- end-to-end scenarios ----

#[tokio::test]
async fn test_cold_miss_then_fresh_hit() {
    let cluster = new_cluster(1, Vec::new()).await;
    let data = pattern_bytes(4096);
    cluster
        .backend
        .insert("b", "obj", data.clone(), "A", Some("max-age=3600"));

    let mut first = cluster
        .coordinator
        .get_object_ninfo(&cluster.ctx, "b", "obj", None, &ObjectOptions::default())
        .await
        .unwrap();
    assert_eq!(read_all(&mut first).await, data);
    drop(first);

    let metas = wait_for_entries(&cluster.drive_dirs, 1).await;
    assert_eq!(metas[0].etag, "A");
    assert_eq!(metas[0].size, 4096);

    let info_calls = cluster.backend.info_calls();
    let read_calls = cluster.backend.read_calls();

    let mut second = cluster
        .coordinator
        .get_object_ninfo(&cluster.ctx, "b", "obj", None, &ObjectOptions::default())
        .await
        .unwrap();
    assert_eq!(read_all(&mut second).await, data);

    // a fresh hit makes no backend calls at all
    assert_eq!(cluster.backend.info_calls(), info_calls);
    assert_eq!(cluster.backend.read_calls(), read_calls);

    cluster.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_stale_revalidation_matching_etag() {
    let cluster = new_cluster(1, Vec::new()).await;
    let data = pattern_bytes(2048);
    cluster
        .backend
        .insert("b", "obj", data.clone(), "A", Some("max-age=0"));

    let mut first = cluster
        .coordinator
        .get_object_ninfo(&cluster.ctx, "b", "obj", None, &ObjectOptions::default())
        .await
        .unwrap();
    assert_eq!(read_all(&mut first).await, data);
    drop(first);
    wait_for_entries(&cluster.drive_dirs, 1).await;

    // server-side copy changed metadata but not the payload
    cluster.backend.set_content_type("b", "obj", "text/x-fancy");

    let info_calls = cluster.backend.info_calls();
    let read_calls = cluster.backend.read_calls();

    let mut second = cluster
        .coordinator
        .get_object_ninfo(&cluster.ctx, "b", "obj", None, &ObjectOptions::default())
        .await
        .unwrap();
    assert_eq!(read_all(&mut second).await, data);
    drop(second);

    // exactly one HEAD, no body transfer
    assert_eq!(cluster.backend.info_calls(), info_calls + 1);
    assert_eq!(cluster.backend.read_calls(), read_calls);

    // metadata was refreshed on disk
    let metas = wait_for_entries(&cluster.drive_dirs, 1).await;
    assert_eq!(metas[0].content_type, "text/x-fancy");
    assert_eq!(metas[0].etag, "A");

    cluster.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_stale_revalidation_changed_etag() {
    let cluster = new_cluster(1, Vec::new()).await;
    let old_data = pattern_bytes(4096);
    cluster
        .backend
        .insert("b", "obj", old_data.clone(), "A", Some("max-age=0"));

    let mut first = cluster
        .coordinator
        .get_object_ninfo(&cluster.ctx, "b", "obj", None, &ObjectOptions::default())
        .await
        .unwrap();
    assert_eq!(read_all(&mut first).await, old_data);
    drop(first);
    wait_for_entries(&cluster.drive_dirs, 1).await;

    let new_data = pattern_bytes(8192);
    cluster
        .backend
        .insert("b", "obj", new_data.clone(), "B", Some("max-age=0"));

    let mut second = cluster
        .coordinator
        .get_object_ninfo(&cluster.ctx, "b", "obj", None, &ObjectOptions::default())
        .await
        .unwrap();
    assert_eq!(read_all(&mut second).await, new_data);
    drop(second);

    let metas = wait_for_entries(&cluster.drive_dirs, 1).await;
    assert_eq!(metas[0].etag, "B");
    assert_eq!(metas[0].size, 8192);

    cluster.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_backend_down_serves_stale_cache() {
    let cluster = new_cluster(1, Vec::new()).await;
    let data = pattern_bytes(1024);
    cluster
        .backend
        .insert("b", "obj", data.clone(), "A", Some("max-age=0"));

    let mut first = cluster
        .coordinator
        .get_object_ninfo(&cluster.ctx, "b", "obj", None, &ObjectOptions::default())
        .await
        .unwrap();
    assert_eq!(read_all(&mut first).await, data);
    drop(first);
    wait_for_entries(&cluster.drive_dirs, 1).await;

    cluster.backend.set_down(true);

    let mut stale = cluster
        .coordinator
        .get_object_ninfo(&cluster.ctx, "b", "obj", None, &ObjectOptions::default())
        .await
        .unwrap();
    assert_eq!(stale.object_info.etag, "A");
    assert_eq!(read_all(&mut stale).await, data);

    // metadata-only path degrades the same way
    let info = cluster
        .coordinator
        .get_object_info(&cluster.ctx, "b", "obj", &ObjectOptions::default())
        .await
        .unwrap();
    assert_eq!(info.etag, "A");

    // with no cached copy the backend error surfaces untouched
    let err = cluster
        .coordinator
        .get_object_ninfo(&cluster.ctx, "b", "missing", None, &ObjectOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_backend_down());

    cluster.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_range_request_triggers_background_fill() {
    let cluster = new_cluster(1, Vec::new()).await;
    let data = pattern_bytes(1024 * 1024);
    cluster
        .backend
        .insert("b", "big", data.clone(), "A", Some("max-age=3600"));

    let rs = HttpRangeSpec::from_offset_length(0, 1024);
    let mut ranged = cluster
        .coordinator
        .get_object_ninfo(&cluster.ctx, "b", "big", Some(&rs), &ObjectOptions::default())
        .await
        .unwrap();
    assert_eq!(read_all(&mut ranged).await, &data[..1024]);
    drop(ranged);

    // the detached task fills the whole object
    let metas = wait_for_entries(&cluster.drive_dirs, 1).await;
    assert_eq!(metas[0].size, data.len() as i64);
    assert_eq!(metas[0].etag, "A");

    let read_calls = cluster.backend.read_calls();
    let mut full = cluster
        .coordinator
        .get_object_ninfo(&cluster.ctx, "b", "big", None, &ObjectOptions::default())
        .await
        .unwrap();
    assert_eq!(read_all(&mut full).await, data);
    assert_eq!(cluster.backend.read_calls(), read_calls);

    cluster.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_fills_coalesce() {
    let cluster = new_cluster(1, Vec::new()).await;
    let data = pattern_bytes(256 * 1024);
    cluster
        .backend
        .insert("b", "obj", data.clone(), "A", Some("max-age=3600"));

    let mut tasks = Vec::new();
    for _ in 0..2 {
        let coordinator = cluster.coordinator.clone();
        let ctx = cluster.ctx.clone();
        let expected = data.clone();
        tasks.push(tokio::spawn(async move {
            let mut reader = coordinator
                .get_object_ninfo(&ctx, "b", "obj", None, &ObjectOptions::default())
                .await
                .unwrap();
            assert_eq!(read_all(&mut reader).await, expected);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // exactly one committed entry, no partial or temp files at quiescence
    let metas = wait_for_entries(&cluster.drive_dirs, 1).await;
    assert_eq!(metas[0].etag, "A");
    assert_eq!(metas[0].size, data.len() as i64);

    cluster.coordinator.shutdown().await;
}

// ---- round-trip laws and boundaries ----

#[tokio::test]
async fn test_fresh_info_then_read_makes_no_backend_calls() {
    let cluster = new_cluster(1, Vec::new()).await;
    let data = pattern_bytes(512);
    cluster
        .backend
        .insert("b", "obj", data.clone(), "A", Some("max-age=3600"));

    let mut first = cluster
        .coordinator
        .get_object_ninfo(&cluster.ctx, "b", "obj", None, &ObjectOptions::default())
        .await
        .unwrap();
    read_all(&mut first).await;
    drop(first);
    wait_for_entries(&cluster.drive_dirs, 1).await;

    let info_calls = cluster.backend.info_calls();
    let read_calls = cluster.backend.read_calls();

    let info = cluster
        .coordinator
        .get_object_info(&cluster.ctx, "b", "obj", &ObjectOptions::default())
        .await
        .unwrap();
    assert_eq!(info.etag, "A");
    let mut reader = cluster
        .coordinator
        .get_object_ninfo(&cluster.ctx, "b", "obj", None, &ObjectOptions::default())
        .await
        .unwrap();
    assert_eq!(read_all(&mut reader).await, data);

    assert_eq!(cluster.backend.info_calls(), info_calls);
    assert_eq!(cluster.backend.read_calls(), read_calls);

    cluster.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_delete_object_clears_cache_entry() {
    let cluster = new_cluster(1, Vec::new()).await;
    cluster
        .backend
        .insert("b", "obj", pattern_bytes(100), "A", Some("max-age=3600"));

    let mut reader = cluster
        .coordinator
        .get_object_ninfo(&cluster.ctx, "b", "obj", None, &ObjectOptions::default())
        .await
        .unwrap();
    read_all(&mut reader).await;
    drop(reader);
    wait_for_entries(&cluster.drive_dirs, 1).await;

    cluster
        .coordinator
        .delete_object(&cluster.ctx, "b", "obj")
        .await
        .unwrap();

    let (metas, _) = scan_drives(&cluster.drive_dirs);
    assert!(metas.is_empty());

    let err = cluster
        .coordinator
        .get_object_info(&cluster.ctx, "b", "obj", &ObjectOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    cluster.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_backend_not_found_purges_cached_copy() {
    let cluster = new_cluster(1, Vec::new()).await;
    cluster
        .backend
        .insert("b", "obj", pattern_bytes(100), "A", Some("max-age=0"));

    let mut reader = cluster
        .coordinator
        .get_object_ninfo(&cluster.ctx, "b", "obj", None, &ObjectOptions::default())
        .await
        .unwrap();
    read_all(&mut reader).await;
    drop(reader);
    wait_for_entries(&cluster.drive_dirs, 1).await;

    // object vanishes upstream; the cached copy must follow
    let ctx = CancellationToken::new();
    cluster.backend.delete_object(&ctx, "b", "obj").await.unwrap();

    let err = cluster
        .coordinator
        .get_object_ninfo(&cluster.ctx, "b", "obj", None, &ObjectOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    wait_for_entries(&cluster.drive_dirs, 0).await;

    cluster.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_zero_byte_object_round_trip() {
    let cluster = new_cluster(1, Vec::new()).await;
    cluster
        .backend
        .insert("b", "empty", Vec::new(), "Z", Some("max-age=3600"));

    let mut first = cluster
        .coordinator
        .get_object_ninfo(&cluster.ctx, "b", "empty", None, &ObjectOptions::default())
        .await
        .unwrap();
    assert!(read_all(&mut first).await.is_empty());
    drop(first);

    let metas = wait_for_entries(&cluster.drive_dirs, 1).await;
    assert_eq!(metas[0].size, 0);

    let mut second = cluster
        .coordinator
        .get_object_ninfo(&cluster.ctx, "b", "empty", None, &ObjectOptions::default())
        .await
        .unwrap();
    assert!(read_all(&mut second).await.is_empty());
    assert_eq!(second.object_info.size, 0);

    cluster.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_range_beyond_end_mutates_nothing() {
    let cluster = new_cluster(1, Vec::new()).await;
    cluster
        .backend
        .insert("b", "obj", pattern_bytes(100), "A", Some("max-age=3600"));

    let rs = HttpRangeSpec::from_offset(500);
    let err = cluster
        .coordinator
        .get_object_ninfo(&cluster.ctx, "b", "obj", Some(&rs), &ObjectOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::InvalidParam(_)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let (metas, tmp_files) = scan_drives(&cluster.drive_dirs);
    assert!(metas.is_empty());
    assert_eq!(tmp_files, 0);

    cluster.coordinator.shutdown().await;
}

// ---- admission ----

#[tokio::test]
async fn test_exclude_pattern_bypasses_cache() {
    let cluster = new_cluster(1, vec!["secret/*".to_string()]).await;
    let data = pattern_bytes(100);
    cluster
        .backend
        .insert("secret", "key.pem", data.clone(), "S", Some("max-age=3600"));

    let mut reader = cluster
        .coordinator
        .get_object_ninfo(&cluster.ctx, "secret", "key.pem", None, &ObjectOptions::default())
        .await
        .unwrap();
    assert_eq!(read_all(&mut reader).await, data);
    drop(reader);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let (metas, _) = scan_drives(&cluster.drive_dirs);
    assert!(metas.is_empty());

    cluster.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_ssec_object_bypasses_cache() {
    let cluster = new_cluster(1, Vec::new()).await;
    let data = pattern_bytes(100);
    cluster
        .backend
        .insert("b", "enc", data.clone(), "E", Some("max-age=3600"));
    cluster
        .backend
        .set_user_defined("b", "enc", SSEC_ALGORITHM_KEY, "AES256");

    let mut reader = cluster
        .coordinator
        .get_object_ninfo(&cluster.ctx, "b", "enc", None, &ObjectOptions::default())
        .await
        .unwrap();
    assert_eq!(read_all(&mut reader).await, data);
    drop(reader);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let (metas, _) = scan_drives(&cluster.drive_dirs);
    assert!(metas.is_empty());

    cluster.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_directory_objects_bypass_cache() {
    let cluster = new_cluster(1, Vec::new()).await;
    cluster
        .backend
        .insert("b", "prefix/", Vec::new(), "D", Some("max-age=3600"));

    let mut reader = cluster
        .coordinator
        .get_object_ninfo(&cluster.ctx, "b", "prefix/", None, &ObjectOptions::default())
        .await
        .unwrap();
    read_all(&mut reader).await;
    drop(reader);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let (metas, _) = scan_drives(&cluster.drive_dirs);
    assert!(metas.is_empty());

    cluster.coordinator.shutdown().await;
}

// ---- storage info and pass-throughs ----

#[tokio::test]
async fn test_storage_info_sums_drives() {
    let cluster = new_cluster(2, Vec::new()).await;
    let info = cluster.coordinator.storage_info();
    assert!(info.total > 0);
    assert!(info.free <= info.total);
    cluster.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_put_object_invalidates_cached_copy() {
    let cluster = new_cluster(1, Vec::new()).await;
    let data = pattern_bytes(100);
    cluster
        .backend
        .insert("b", "obj", data.clone(), "A", Some("max-age=3600"));

    let mut reader = cluster
        .coordinator
        .get_object_ninfo(&cluster.ctx, "b", "obj", None, &ObjectOptions::default())
        .await
        .unwrap();
    read_all(&mut reader).await;
    drop(reader);
    wait_for_entries(&cluster.drive_dirs, 1).await;

    let new_data = pattern_bytes(200);
    cluster
        .coordinator
        .put_object(
            &cluster.ctx,
            "b",
            "obj",
            Box::pin(Cursor::new(new_data.clone())),
            new_data.len() as i64,
            &ObjectOptions::default(),
        )
        .await
        .unwrap();

    // the stale cached copy is gone; the next read refills from backend
    wait_for_entries(&cluster.drive_dirs, 0).await;
    let mut again = cluster
        .coordinator
        .get_object_ninfo(&cluster.ctx, "b", "obj", None, &ObjectOptions::default())
        .await
        .unwrap();
    assert_eq!(read_all(&mut again).await, new_data);

    cluster.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_bucket_policy_pass_through() {
    let cluster = new_cluster(1, Vec::new()).await;
    cluster
        .coordinator
        .set_bucket_policy(&cluster.ctx, "b", "{\"allow\":true}")
        .await
        .unwrap();
    assert_eq!(
        cluster
            .coordinator
            .get_bucket_policy(&cluster.ctx, "b")
            .await
            .unwrap(),
        "{\"allow\":true}"
    );
    cluster
        .coordinator
        .delete_bucket_policy(&cluster.ctx, "b")
        .await
        .unwrap();
    assert!(cluster
        .coordinator
        .get_bucket_policy(&cluster.ctx, "b")
        .await
        .is_err());
    cluster.coordinator.shutdown().await;
}

// ---- migration gate ----

#[tokio::test]
async fn test_v1_drive_migrates_and_gate_clears() {
    use crate::migrate::write_format;
    use crate::{CacheFormat, CACHE_FORMAT_V1};

    let drive = TempDir::new().unwrap();
    write_format(
        drive.path(),
        &CacheFormat {
            version: CACHE_FORMAT_V1,
            id: "mig-drive".to_string(),
        },
    )
    .await
    .unwrap();

    // one v1 entry on disk
    let entry_dir = drive.path().join("photos").join("cat.jpg");
    tokio::fs::create_dir_all(&entry_dir).await.unwrap();
    tokio::fs::write(entry_dir.join("data"), b"cat bytes").await.unwrap();
    tokio::fs::write(
        entry_dir.join("cache.json"),
        serde_json::json!({
            "size": 9,
            "etag": "C",
            "mod_time": unix_now(),
        })
        .to_string(),
    )
    .await
    .unwrap();

    let config = CacheConfig {
        drives: vec![drive.path().to_path_buf()],
        exclude: Vec::new(),
        expiry: 90,
        max_use: 100,
    };
    let backend = MockBackend::new();
    backend.insert("photos", "cat.jpg", b"cat bytes".to_vec(), "C", Some("max-age=3600"));
    let coordinator = CacheCoordinator::new(config, backend.clone() as Arc<dyn BackendObjectLayer>)
        .await
        .unwrap();

    // gate clears once the migration finishes
    for _ in 0..500 {
        if !coordinator.skip_cache() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!coordinator.skip_cache());

    // the migrated entry is served from cache without a body transfer
    let read_calls = backend.read_calls();
    let ctx = CancellationToken::new();
    let mut reader = coordinator
        .get_object_ninfo(&ctx, "photos", "cat.jpg", None, &ObjectOptions::default())
        .await
        .unwrap();
    assert_eq!(read_all(&mut reader).await, b"cat bytes");
    assert_eq!(backend.read_calls(), read_calls);

    // drive format advanced to v2
    let format: CacheFormat = serde_json::from_slice(
        &std::fs::read(drive.path().join(crate::CACHE_FORMAT_FILE)).unwrap(),
    )
    .unwrap();
    assert_eq!(format.version, crate::CACHE_FORMAT_V2);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_reload_format_is_noop_without_v1() {
    let cluster = new_cluster(1, Vec::new()).await;
    cluster.coordinator.reload_format().await.unwrap();
    assert!(!cluster.coordinator.skip_cache());
    cluster.coordinator.shutdown().await;
}
