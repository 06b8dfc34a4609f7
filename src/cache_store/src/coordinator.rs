use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use log::{debug, info, warn};
use obj_lib::{
    unix_now, BackendObjectLayer, BucketInfo, CacheControl, CacheResult, CacheStorageInfo,
    GetObjectReader, HttpRangeSpec, ListObjectsInfo, ObjectInfo, ObjectOptions, ObjectReader,
    TeeCacheReader, CACHE_BLOCK_SIZE,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    load_and_validate_cache_format, migrate_old_cache, CacheConfig, CachePattern, CacheRouter,
    DiskCache, NamespaceLockMap, CACHE_FORMAT_V1, NS_LOCK_TIMEOUT,
};

/// The cache object API: wraps a `BackendObjectLayer` and interposes the
/// disk cache on reads. Callers can not tell whether a read came from cache
/// or backend; every cache-layer failure either degrades to backend-only or
/// surfaces the error the backend itself produced.
///
/// Lifecycle is explicit: `new` builds the drive pool (and kicks off a V1
/// layout migration when one is needed), `shutdown` stops the purge workers
/// and any in-flight background fills.
pub struct CacheCoordinator {
    backend: Arc<dyn BackendObjectLayer>,
    config: CacheConfig,
    drives: Arc<Vec<Option<Arc<DiskCache>>>>,
    router: CacheRouter,
    ns_locks: NamespaceLockMap,
    exclude: Vec<CachePattern>,
    migrating: Mutex<bool>,
    shutdown: CancellationToken,
    purgers: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheCoordinator {
    pub async fn new(
        config: CacheConfig,
        backend: Arc<dyn BackendObjectLayer>,
    ) -> CacheResult<Arc<Self>> {
        config.validate()?;
        let (formats, migrating) = load_and_validate_cache_format(&config.drives).await?;

        let mut drives: Vec<Option<Arc<DiskCache>>> = Vec::with_capacity(config.drives.len());
        for (dir, format) in config.drives.iter().zip(formats.iter()) {
            match format {
                None => drives.push(None),
                Some(_) => {
                    let cache =
                        DiskCache::new(dir.clone(), config.expiry, config.max_use).await?;
                    drives.push(Some(Arc::new(cache)));
                }
            }
        }

        let drives = Arc::new(drives);
        let exclude = config
            .exclude
            .iter()
            .map(|p| CachePattern::new(p))
            .collect();
        let coordinator = Arc::new(Self {
            backend,
            router: CacheRouter::new(drives.clone()),
            drives,
            ns_locks: NamespaceLockMap::new(),
            exclude,
            migrating: Mutex::new(migrating),
            shutdown: CancellationToken::new(),
            purgers: Mutex::new(Vec::new()),
            config,
        });

        if migrating {
            info!("cache migration initiated, cache is bypassed until it completes");
            let c = coordinator.clone();
            tokio::spawn(async move { c.migrate_from_v1().await });
        } else {
            for drive in coordinator.drives.iter().flatten() {
                let handle = drive.start_purger(coordinator.shutdown.child_token());
                coordinator.purgers.lock().unwrap().push(handle);
            }
        }
        Ok(coordinator)
    }

    /// Stop purge workers and cancel background fills. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.purgers.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// While a migration is running every request bypasses the cache.
    pub fn skip_cache(&self) -> bool {
        *self.migrating.lock().unwrap()
    }

    fn is_cache_exclude(&self, bucket: &str, object: &str) -> bool {
        // directories are never cached
        if object.ends_with('/') {
            return true;
        }
        let path = format!("{}/{}", bucket, object);
        self.exclude.iter().any(|pattern| pattern.matches(&path))
    }

    // ---- namespace-lock framed drive operations ----

    async fn cache_get(
        &self,
        ctx: &CancellationToken,
        drive: &Arc<DiskCache>,
        bucket: &str,
        object: &str,
        range: Option<&HttpRangeSpec>,
    ) -> CacheResult<GetObjectReader> {
        let _lock = self
            .ns_locks
            .acquire_read(bucket, object, NS_LOCK_TIMEOUT)
            .await?;
        drive.get(ctx, bucket, object, range).await
    }

    async fn cache_stat(
        &self,
        drive: &Arc<DiskCache>,
        bucket: &str,
        object: &str,
    ) -> CacheResult<ObjectInfo> {
        Self::locked_stat(&self.ns_locks, drive, bucket, object).await
    }

    async fn cache_delete(
        &self,
        ctx: &CancellationToken,
        drive: &Arc<DiskCache>,
        bucket: &str,
        object: &str,
    ) -> CacheResult<()> {
        let _lock = self
            .ns_locks
            .acquire_write(bucket, object, NS_LOCK_TIMEOUT)
            .await?;
        drive.delete(ctx, bucket, object).await
    }

    async fn locked_stat(
        locks: &NamespaceLockMap,
        drive: &Arc<DiskCache>,
        bucket: &str,
        object: &str,
    ) -> CacheResult<ObjectInfo> {
        let _lock = locks.acquire_read(bucket, object, NS_LOCK_TIMEOUT).await?;
        drive.stat(bucket, object).await
    }

    async fn locked_put(
        locks: NamespaceLockMap,
        drive: Arc<DiskCache>,
        ctx: CancellationToken,
        bucket: String,
        object: String,
        reader: ObjectReader,
        size: i64,
        metadata: HashMap<String, String>,
    ) -> CacheResult<()> {
        let _lock = locks
            .acquire_write(&bucket, &object, NS_LOCK_TIMEOUT)
            .await?;
        drive.put(&ctx, &bucket, &object, reader, size, &metadata).await
    }

    // ---- object API ----

    pub async fn get_object_ninfo(
        &self,
        ctx: &CancellationToken,
        bucket: &str,
        object: &str,
        range: Option<&HttpRangeSpec>,
        opts: &ObjectOptions,
    ) -> CacheResult<GetObjectReader> {
        if self.is_cache_exclude(bucket, object) || self.skip_cache() {
            return self
                .backend
                .get_object_ninfo(ctx, bucket, object, range, opts)
                .await;
        }

        let drive = match self.router.locate_for_read(bucket, object).await {
            Ok(d) => d,
            Err(_) => {
                return self
                    .backend
                    .get_object_ninfo(ctx, bucket, object, range, opts)
                    .await
            }
        };

        let mut cache_reader = match self.cache_get(ctx, &drive, bucket, object, range).await {
            Ok(reader) => Some(reader),
            Err(e) => {
                if !e.is_not_found() {
                    debug!("cache get {}/{} failed: {}", bucket, object, e);
                }
                None
            }
        };

        // fresh by cache-control: serve without consulting the backend
        if let Some(reader) = cache_reader.take() {
            let cc = CacheControl::from_object_info(&reader.object_info);
            if !cc.is_empty() && !cc.is_stale(reader.object_info.mod_time, unix_now()) {
                return Ok(reader);
            }
            cache_reader = Some(reader);
        }

        let backend_info = match self.backend.get_object_info(ctx, bucket, object, opts).await {
            Ok(info) => info,
            Err(err) => {
                if err.is_backend_down() {
                    // serve stale rather than nothing
                    if let Some(reader) = cache_reader.take() {
                        return Ok(reader);
                    }
                    return Err(err);
                }
                if err.is_not_found() && cache_reader.is_some() {
                    drop(cache_reader.take());
                    // the backend is authoritative, drop our copy best-effort
                    if let Err(derr) = self.cache_delete(ctx, &drive, bucket, object).await {
                        warn!(
                            "cache delete of {}/{} after backend not-found failed: {}",
                            bucket, object, derr
                        );
                    }
                }
                return Err(err);
            }
        };

        if !backend_info.is_cacheable() {
            drop(cache_reader.take());
            return self
                .backend
                .get_object_ninfo(ctx, bucket, object, range, opts)
                .await;
        }

        if let Some(reader) = cache_reader.take() {
            if reader.object_info.etag == backend_info.etag {
                // revalidation hit: refresh metadata, serve the cached body
                if let Err(e) = drive
                    .update_metadata_if_changed(bucket, object, &backend_info, &reader.object_info)
                    .await
                {
                    warn!("cache metadata refresh of {}/{} failed: {}", bucket, object, e);
                }
                return Ok(reader);
            }
            drop(reader);
            if let Err(e) = self.cache_delete(ctx, &drive, bucket, object).await {
                warn!("stale cache delete of {}/{} failed: {}", bucket, object, e);
            }
        }

        // serving from the backend and filling the cache from here on
        if !drive.disk_usage_low() {
            drive.poke_purge();
        }
        let estimated_size = if backend_info.size > 0 {
            backend_info.size as u64
        } else {
            0
        };
        if !drive.disk_available(estimated_size) {
            return self
                .backend
                .get_object_ninfo(ctx, bucket, object, range, opts)
                .await;
        }

        if let Some(rs) = range {
            // an unsatisfiable range surfaces the backend's error without
            // touching any cache state
            if backend_info.size >= 0 && rs.get_offset_length(backend_info.size).is_err() {
                return self
                    .backend
                    .get_object_ninfo(ctx, bucket, object, range, opts)
                    .await;
            }
            // ranged responses come straight from the backend; a detached
            // task fetches the whole object for the cache
            let backend = self.backend.clone();
            let locks = self.ns_locks.clone();
            let fill_drive = drive.clone();
            let fill_ctx = self.shutdown.child_token();
            let fill_bucket = bucket.to_string();
            let fill_object = object.to_string();
            let fill_opts = opts.clone();
            tokio::spawn(async move {
                let bk_reader = match backend
                    .get_object_ninfo(&fill_ctx, &fill_bucket, &fill_object, None, &fill_opts)
                    .await
                {
                    Ok(r) => r,
                    Err(e) => {
                        debug!(
                            "background fill of {}/{} skipped: {}",
                            fill_bucket, fill_object, e
                        );
                        return;
                    }
                };
                // another task may have filled the entry in the meantime
                let already_cached =
                    match Self::locked_stat(&locks, &fill_drive, &fill_bucket, &fill_object).await {
                        Ok(cached) => cached.etag == bk_reader.object_info.etag,
                        Err(_) => false,
                    };
                if already_cached {
                    return;
                }
                let info = bk_reader.object_info.clone();
                let metadata = info.fill_metadata();
                if let Err(e) = Self::locked_put(
                    locks,
                    fill_drive,
                    fill_ctx,
                    fill_bucket.clone(),
                    fill_object.clone(),
                    Box::pin(bk_reader),
                    info.size,
                    metadata,
                )
                .await
                {
                    warn!(
                        "background fill of {}/{} failed: {}",
                        fill_bucket, fill_object, e
                    );
                }
            });
            return self
                .backend
                .get_object_ninfo(ctx, bucket, object, range, opts)
                .await;
        }

        // tee-fill: stream to the client while a spawned task writes the
        // pipe's read end into the cache
        let bk_reader = self
            .backend
            .get_object_ninfo(ctx, bucket, object, None, opts)
            .await?;
        let info = bk_reader.object_info.clone();
        let (tee, pipe) = TeeCacheReader::new(Box::pin(bk_reader), CACHE_BLOCK_SIZE);

        let locks = self.ns_locks.clone();
        let fill_drive = drive.clone();
        let fill_ctx = self.shutdown.child_token();
        let fill_bucket = bucket.to_string();
        let fill_object = object.to_string();
        let metadata = info.fill_metadata();
        let size = info.size;
        tokio::spawn(async move {
            // an error drops the pipe's read end, which surfaces on the
            // client's tee reader
            if let Err(e) = Self::locked_put(
                locks,
                fill_drive,
                fill_ctx,
                fill_bucket.clone(),
                fill_object.clone(),
                Box::pin(pipe),
                size,
                metadata,
            )
            .await
            {
                warn!("cache fill of {}/{} failed: {}", fill_bucket, fill_object, e);
            }
        });

        Ok(GetObjectReader::new(Box::pin(tee), info))
    }

    pub async fn get_object_info(
        &self,
        ctx: &CancellationToken,
        bucket: &str,
        object: &str,
        opts: &ObjectOptions,
    ) -> CacheResult<ObjectInfo> {
        if self.is_cache_exclude(bucket, object) || self.skip_cache() {
            return self.backend.get_object_info(ctx, bucket, object, opts).await;
        }
        let drive = match self.router.locate_for_read(bucket, object).await {
            Ok(d) => d,
            Err(_) => {
                return self.backend.get_object_info(ctx, bucket, object, opts).await;
            }
        };

        let cached = self.cache_stat(&drive, bucket, object).await.ok();
        if let Some(cached_info) = &cached {
            let cc = CacheControl::from_object_info(cached_info);
            if !cc.is_empty() && !cc.is_stale(cached_info.mod_time, unix_now()) {
                return Ok(cached_info.clone());
            }
        }

        match self.backend.get_object_info(ctx, bucket, object, opts).await {
            Ok(info) => {
                if let Some(cached_info) = cached {
                    if cached_info.etag != info.etag {
                        if let Err(e) = self.cache_delete(ctx, &drive, bucket, object).await {
                            warn!(
                                "replaced cache delete of {}/{} failed: {}",
                                bucket, object, e
                            );
                        }
                    }
                }
                Ok(info)
            }
            Err(err) => {
                if err.is_not_found() {
                    if cached.is_some() {
                        if let Err(e) = self.cache_delete(ctx, &drive, bucket, object).await {
                            warn!(
                                "cache delete of {}/{} after backend not-found failed: {}",
                                bucket, object, e
                            );
                        }
                    }
                    return Err(err);
                }
                if !err.is_backend_down() {
                    return Err(err);
                }
                match cached {
                    Some(cached_info) => Ok(cached_info),
                    None => Err(err),
                }
            }
        }
    }

    /// Backend delete first; the cache entry goes only once the backend
    /// delete succeeded (a backend not-found counts as deleted).
    pub async fn delete_object(
        &self,
        ctx: &CancellationToken,
        bucket: &str,
        object: &str,
    ) -> CacheResult<()> {
        let result = self.backend.delete_object(ctx, bucket, object).await;
        if let Err(err) = &result {
            if !err.is_not_found() {
                return result;
            }
        }
        if self.is_cache_exclude(bucket, object) || self.skip_cache() {
            return result;
        }
        if let Ok(drive) = self.router.locate_for_read(bucket, object).await {
            if drive.exists(bucket, object).await {
                if let Err(e) = self.cache_delete(ctx, &drive, bucket, object).await {
                    warn!("cache delete of {}/{} failed: {}", bucket, object, e);
                }
            }
        }
        result
    }

    pub async fn delete_objects(
        &self,
        ctx: &CancellationToken,
        bucket: &str,
        objects: &[String],
    ) -> Vec<CacheResult<()>> {
        let mut results = Vec::with_capacity(objects.len());
        for object in objects {
            results.push(self.delete_object(ctx, bucket, object).await);
        }
        results
    }

    /// Total and free space across the drive pool. A drive that can not
    /// report contributes zero.
    pub fn storage_info(&self) -> CacheStorageInfo {
        let mut total = 0u64;
        let mut free = 0u64;
        for drive in self.drives.iter().flatten() {
            match drive.capacity_info() {
                Ok((t, f)) => {
                    total += t;
                    free += f;
                }
                Err(e) => warn!(
                    "cache drive {}: storage info failed: {}",
                    drive.dir().display(),
                    e
                ),
            }
        }
        CacheStorageInfo { total, free }
    }

    // ---- migration ----

    async fn migrate_from_v1(self: Arc<Self>) {
        let migrations = self.drives.iter().flatten().map(|drive| {
            let drive = drive.clone();
            async move {
                let result = migrate_old_cache(&drive).await;
                (drive, result)
            }
        });
        let results = join_all(migrations).await;

        let mut failures = 0usize;
        for (drive, result) in results {
            match result {
                Ok(()) => {
                    let handle = drive.start_purger(self.shutdown.child_token());
                    self.purgers.lock().unwrap().push(handle);
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        "cache drive {}: migration failed, drive stays offline: {}",
                        drive.dir().display(),
                        e
                    );
                    drive.set_offline();
                }
            }
        }
        if failures == 0 {
            *self.migrating.lock().unwrap() = false;
            info!("cache migration completed successfully");
        }
    }

    /// Admin entrypoint: re-inspect drive formats and start a migration if
    /// a V1 layout shows up. A no-op when every drive is already current.
    pub async fn reload_format(self: &Arc<Self>) -> CacheResult<()> {
        let (formats, _) = load_and_validate_cache_format(&self.config.drives).await?;
        let any_v1 = formats
            .iter()
            .flatten()
            .any(|f| f.version == CACHE_FORMAT_V1);
        if !any_v1 {
            debug!("cache format reload: all drives current, nothing to do");
            return Ok(());
        }
        {
            let mut migrating = self.migrating.lock().unwrap();
            if *migrating {
                return Ok(());
            }
            *migrating = true;
        }
        info!("cache format reload: v1 layout found, migration initiated");
        let c = self.clone();
        tokio::spawn(async move { c.migrate_from_v1().await });
        Ok(())
    }

    // ---- pass-through operations ----

    /// Writes go to the backend; a cached copy of the old object is dropped
    /// so the next read revalidates.
    pub async fn put_object(
        &self,
        ctx: &CancellationToken,
        bucket: &str,
        object: &str,
        data: ObjectReader,
        size: i64,
        opts: &ObjectOptions,
    ) -> CacheResult<ObjectInfo> {
        let info = self
            .backend
            .put_object(ctx, bucket, object, data, size, opts)
            .await?;
        if !self.is_cache_exclude(bucket, object) && !self.skip_cache() {
            if let Ok(drive) = self.router.locate_for_read(bucket, object).await {
                if drive.exists(bucket, object).await {
                    if let Err(e) = self.cache_delete(ctx, &drive, bucket, object).await {
                        warn!(
                            "cache invalidate of {}/{} after put failed: {}",
                            bucket, object, e
                        );
                    }
                }
            }
        }
        Ok(info)
    }

    pub async fn list_buckets(&self, ctx: &CancellationToken) -> CacheResult<Vec<BucketInfo>> {
        self.backend.list_buckets(ctx).await
    }

    pub async fn list_objects(
        &self,
        ctx: &CancellationToken,
        bucket: &str,
        prefix: &str,
        marker: &str,
        delimiter: &str,
        max_keys: usize,
    ) -> CacheResult<ListObjectsInfo> {
        self.backend
            .list_objects(ctx, bucket, prefix, marker, delimiter, max_keys)
            .await
    }

    pub async fn make_bucket_with_location(
        &self,
        ctx: &CancellationToken,
        bucket: &str,
        location: &str,
    ) -> CacheResult<()> {
        self.backend
            .make_bucket_with_location(ctx, bucket, location)
            .await
    }

    pub async fn get_bucket_policy(
        &self,
        ctx: &CancellationToken,
        bucket: &str,
    ) -> CacheResult<String> {
        self.backend.get_bucket_policy(ctx, bucket).await
    }

    pub async fn set_bucket_policy(
        &self,
        ctx: &CancellationToken,
        bucket: &str,
        policy: &str,
    ) -> CacheResult<()> {
        self.backend.set_bucket_policy(ctx, bucket, policy).await
    }

    pub async fn delete_bucket_policy(
        &self,
        ctx: &CancellationToken,
        bucket: &str,
    ) -> CacheResult<()> {
        self.backend.delete_bucket_policy(ctx, bucket).await
    }
}
