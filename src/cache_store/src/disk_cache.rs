use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, UNIX_EPOCH};

use fs2::FileExt;
use log::{debug, info, warn};
use obj_lib::{
    unix_now, CacheError, CacheResult, GetObjectReader, HttpRangeSpec, LimitReader, ObjectInfo,
    ObjectReader, CACHE_BLOCK_SIZE, METADATA_CACHE_CONTROL, METADATA_CONTENT_ENCODING,
    METADATA_CONTENT_TYPE, METADATA_ETAG, METADATA_EXPIRES, METADATA_MOD_TIME, TIME_SENTINEL,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub const CACHE_DATA_FILE: &str = "part.1";
pub const CACHE_META_FILE: &str = "meta.json";
const CACHE_DATA_TMP_FILE: &str = "part.tmp";
const CACHE_META_TMP_FILE: &str = "meta.tmp";

const CACHE_META_VERSION: u32 = 2;

/// Consecutive read I/O failures before a drive is taken offline.
const GET_ERROR_OFFLINE_THRESHOLD: u32 = 5;

/// The purger wakes this often even without a signal.
const PURGE_INTERVAL: Duration = Duration::from_secs(300);

/// Eviction stops once usage falls to this share of `max_use`.
const PURGE_LOW_WATERMARK: u64 = 80;

/// Entries read this recently are not eviction candidates; a fill or a
/// streaming read may still be touching them.
const PURGE_RECENT_ACCESS_GRACE_SECS: u64 = 10;

/// Leftover temp files must be this old before the purger reclaims them.
const STALE_PARTIAL_AGE_SECS: u64 = 24 * 3600;

/// On-disk metadata document, one per cached object, co-located with the
/// entry's data file. Committing an entry is renaming this document into
/// place; an entry without it does not exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntryMeta {
    pub version: u32,
    pub bucket: String,
    pub object: String,
    pub size: i64,
    pub etag: String,
    pub mod_time: u64,
    pub expires: u64,
    #[serde(default)]
    pub cache_control: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub content_encoding: String,
    #[serde(default)]
    pub user_defined: HashMap<String, String>,
}

impl CacheEntryMeta {
    pub fn from_metadata(
        bucket: &str,
        object: &str,
        size: i64,
        metadata: &HashMap<String, String>,
    ) -> Self {
        let parse_ts = |key: &str| {
            metadata
                .get(key)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(TIME_SENTINEL)
        };
        let fetch = |key: &str| metadata.get(key).cloned().unwrap_or_default();
        let mod_time = match parse_ts(METADATA_MOD_TIME) {
            TIME_SENTINEL => unix_now(),
            ts => ts,
        };
        Self {
            version: CACHE_META_VERSION,
            bucket: bucket.to_string(),
            object: object.to_string(),
            size,
            etag: fetch(METADATA_ETAG),
            mod_time,
            expires: parse_ts(METADATA_EXPIRES),
            cache_control: fetch(METADATA_CACHE_CONTROL),
            content_type: fetch(METADATA_CONTENT_TYPE),
            content_encoding: fetch(METADATA_CONTENT_ENCODING),
            user_defined: metadata.clone(),
        }
    }

    pub fn from_object_info(info: &ObjectInfo) -> Self {
        Self {
            version: CACHE_META_VERSION,
            bucket: info.bucket.clone(),
            object: info.name.clone(),
            size: info.size,
            etag: info.etag.clone(),
            mod_time: info.mod_time,
            expires: info.expires,
            cache_control: info.cache_control().unwrap_or_default().to_string(),
            content_type: info.content_type.clone(),
            content_encoding: info.content_encoding.clone(),
            user_defined: info.user_defined.clone(),
        }
    }

    pub fn to_object_info(&self) -> ObjectInfo {
        ObjectInfo {
            bucket: self.bucket.clone(),
            name: self.object.clone(),
            etag: self.etag.clone(),
            size: self.size,
            mod_time: self.mod_time,
            expires: self.expires,
            content_type: self.content_type.clone(),
            content_encoding: self.content_encoding.clone(),
            user_defined: self.user_defined.clone(),
        }
    }
}

/// One physical cache drive: a directory on a local filesystem holding
/// cached objects in sharded entry directories, plus the purge worker that
/// keeps its usage under the configured watermark.
pub struct DiskCache {
    dir: PathBuf,
    expiry_days: u32,
    max_use_pct: u64,
    online: AtomicBool,
    get_errors: AtomicU32,
    purge_tx: mpsc::Sender<()>,
    purge_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

struct DiskUsage {
    total: u64,
    pct: u64,
}

impl DiskCache {
    /// Register a drive directory. Fails with `AtimeUnsupported` when the
    /// underlying filesystem does not advance access times, since eviction
    /// is driven by atime.
    pub async fn new(dir: PathBuf, expiry_days: u32, max_use_pct: u64) -> CacheResult<Self> {
        fs::create_dir_all(&dir).await.map_err(|e| {
            warn!("DiskCache: create drive dir {} failed! {}", dir.display(), e);
            CacheError::IoError(e.to_string())
        })?;
        check_atime_support(&dir).await?;

        // capacity 1: sends coalesce while a purge is already pending
        let (purge_tx, purge_rx) = mpsc::channel(1);
        Ok(Self {
            dir,
            expiry_days,
            max_use_pct,
            online: AtomicBool::new(true),
            get_errors: AtomicU32::new(0),
            purge_tx,
            purge_rx: Mutex::new(Some(purge_rx)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    pub fn set_offline(&self) {
        self.online.store(false, Ordering::Relaxed);
    }

    /// Sharded entry directory for a fingerprint. The digest bounds
    /// per-directory fanout; the last two byte pairs pick the shard.
    pub(crate) fn entry_dir(&self, bucket: &str, object: &str) -> PathBuf {
        let digest = Sha256::digest(format!("{}/{}", bucket, object).as_bytes());
        let hex_str = hex::encode(digest);
        let len = hex_str.len();
        let dir1 = &hex_str[len - 4..len - 2];
        let dir2 = &hex_str[len - 2..];
        self.dir.join(dir1).join(dir2).join(hex_str.as_str())
    }

    /// Stream at most `size` bytes (until EOF when `size` is negative) into
    /// a temp file, then atomically commit data and metadata. A failure on
    /// any path leaves no trace of the attempt.
    pub async fn put(
        &self,
        ctx: &CancellationToken,
        bucket: &str,
        object: &str,
        mut reader: ObjectReader,
        size: i64,
        metadata: &HashMap<String, String>,
    ) -> CacheResult<()> {
        if !self.is_online() {
            return Err(CacheError::DriveOffline(format!(
                "cache drive {} is offline",
                self.dir.display()
            )));
        }
        // size is only an estimate for unknown-length streams, but the
        // watermark gate applies to every fill
        let estimated = if size > 0 { size as u64 } else { 0 };
        if !self.disk_available(estimated) {
            return Err(CacheError::DriveFull(format!(
                "cache drive {} can not hold {} bytes",
                self.dir.display(),
                size
            )));
        }

        let entry_dir = self.entry_dir(bucket, object);
        fs::create_dir_all(&entry_dir).await.map_err(|e| {
            warn!("cache put: create entry dir failed! {}", e);
            CacheError::IoError(e.to_string())
        })?;

        let tmp_data_path = entry_dir.join(CACHE_DATA_TMP_FILE);
        let file = File::create(&tmp_data_path).await.map_err(|e| {
            warn!("cache put: create temp file failed! {}", e);
            CacheError::IoError(e.to_string())
        })?;
        let std_file = file.into_std().await;
        std_file.try_lock_exclusive().map_err(|e| {
            warn!("cache put: lock temp file failed! {}", e);
            CacheError::AlreadyExists(format!("cache fill already running for {}/{}", bucket, object))
        })?;
        let mut file = File::from_std(std_file);

        let mut buf = vec![0u8; CACHE_BLOCK_SIZE];
        let mut written: i64 = 0;
        loop {
            let want = if size >= 0 {
                (size - written).min(CACHE_BLOCK_SIZE as i64) as usize
            } else {
                CACHE_BLOCK_SIZE
            };
            if want == 0 {
                break;
            }
            let n = tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    abort_put(&entry_dir).await;
                    return Err(CacheError::Cancelled(format!(
                        "cache fill of {}/{} cancelled",
                        bucket, object
                    )));
                }
                r = reader.read(&mut buf[..want]) => match r {
                    Ok(n) => n,
                    Err(e) => {
                        abort_put(&entry_dir).await;
                        return Err(CacheError::IoError(e.to_string()));
                    }
                },
            };
            if n == 0 {
                break;
            }
            if let Err(e) = file.write_all(&buf[..n]).await {
                abort_put(&entry_dir).await;
                return Err(CacheError::IoError(e.to_string()));
            }
            written += n as i64;
            // an unbounded stream is re-checked as it grows so it can not
            // run the drive past the watermark before hitting ENOSPC
            if size < 0 && !self.disk_available(0) {
                abort_put(&entry_dir).await;
                return Err(CacheError::DriveFull(format!(
                    "cache drive {} filled up while streaming {}/{}",
                    self.dir.display(),
                    bucket,
                    object
                )));
            }
        }
        if let Err(e) = file.flush().await {
            abort_put(&entry_dir).await;
            return Err(CacheError::IoError(e.to_string()));
        }
        if size >= 0 && written != size {
            abort_put(&entry_dir).await;
            return Err(CacheError::IoError(format!(
                "cache fill of {}/{} ended early: got {} of {} bytes",
                bucket, object, written, size
            )));
        }

        let meta = CacheEntryMeta::from_metadata(bucket, object, written, metadata);
        let tmp_meta_path = entry_dir.join(CACHE_META_TMP_FILE);
        let meta_str = serde_json::to_string(&meta)
            .map_err(|e| CacheError::Internal(e.to_string()))?;
        if let Err(e) = fs::write(&tmp_meta_path, meta_str.as_bytes()).await {
            abort_put(&entry_dir).await;
            return Err(CacheError::IoError(e.to_string()));
        }

        // data first, then metadata: the entry exists once meta.json does
        if let Err(e) = fs::rename(&tmp_data_path, entry_dir.join(CACHE_DATA_FILE)).await {
            abort_put(&entry_dir).await;
            return Err(CacheError::IoError(e.to_string()));
        }
        if let Err(e) = fs::rename(&tmp_meta_path, entry_dir.join(CACHE_META_FILE)).await {
            let _ = fs::remove_file(entry_dir.join(CACHE_DATA_FILE)).await;
            abort_put(&entry_dir).await;
            return Err(CacheError::IoError(e.to_string()));
        }
        debug!("cache put: stored {}/{} ({} bytes)", bucket, object, written);
        Ok(())
    }

    /// Open a streaming read of a cached entry, optionally ranged. Reading
    /// through the returned reader advances the data file's atime, which is
    /// what drives eviction ordering.
    pub async fn get(
        &self,
        ctx: &CancellationToken,
        bucket: &str,
        object: &str,
        range: Option<&HttpRangeSpec>,
    ) -> CacheResult<GetObjectReader> {
        if ctx.is_cancelled() {
            return Err(CacheError::Cancelled(format!("get {}/{}", bucket, object)));
        }
        let entry_dir = self.entry_dir(bucket, object);
        let meta = self.read_meta(&entry_dir, bucket, object).await?;
        let info = meta.to_object_info();

        let (offset, length) = match range {
            Some(rs) => rs.get_offset_length(info.size)?,
            None => (0, info.size),
        };

        let data_path = entry_dir.join(CACHE_DATA_FILE);
        let mut file = match OpenOptions::new().read(true).open(&data_path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // torn pair: metadata without data, drop the entry
                remove_entry_files(&entry_dir).await;
                return Err(CacheError::NotFound(format!("{}/{}", bucket, object)));
            }
            Err(e) => {
                warn!("cache get: open data file failed! {}", e);
                self.record_get_error();
                return Err(CacheError::IoError(e.to_string()));
            }
        };
        if offset > 0 {
            if let Err(e) = file.seek(SeekFrom::Start(offset as u64)).await {
                warn!("cache get: seek data file failed! {}", e);
                self.record_get_error();
                return Err(CacheError::IoError(e.to_string()));
            }
        }
        self.reset_get_errors();

        let limited = LimitReader::from_reader(Box::pin(file), length.max(0) as u64);
        Ok(GetObjectReader::new(Box::pin(limited), info))
    }

    pub async fn stat(&self, bucket: &str, object: &str) -> CacheResult<ObjectInfo> {
        let entry_dir = self.entry_dir(bucket, object);
        let meta = self.read_meta(&entry_dir, bucket, object).await?;
        Ok(meta.to_object_info())
    }

    pub async fn exists(&self, bucket: &str, object: &str) -> bool {
        fs::metadata(self.entry_dir(bucket, object).join(CACHE_META_FILE))
            .await
            .is_ok()
    }

    /// Remove an entry. Metadata goes first so the entry stops existing
    /// before its data does; concurrent readers keep their open handle.
    pub async fn delete(
        &self,
        ctx: &CancellationToken,
        bucket: &str,
        object: &str,
    ) -> CacheResult<()> {
        if ctx.is_cancelled() {
            return Err(CacheError::Cancelled(format!("delete {}/{}", bucket, object)));
        }
        let entry_dir = self.entry_dir(bucket, object);
        remove_entry_files(&entry_dir).await;
        remove_empty_shards(&entry_dir).await;
        Ok(())
    }

    /// Rewrite an entry's metadata after a revalidation hit whose ETag
    /// matched but whose server-side metadata may have moved.
    pub async fn update_metadata_if_changed(
        &self,
        bucket: &str,
        object: &str,
        new_info: &ObjectInfo,
        old_info: &ObjectInfo,
    ) -> CacheResult<()> {
        let unchanged = new_info.mod_time == old_info.mod_time
            && new_info.expires == old_info.expires
            && new_info.content_type == old_info.content_type
            && new_info.content_encoding == old_info.content_encoding
            && new_info.user_defined == old_info.user_defined;
        if unchanged {
            return Ok(());
        }

        let mut meta = CacheEntryMeta::from_object_info(new_info);
        meta.size = old_info.size;
        let entry_dir = self.entry_dir(bucket, object);
        write_meta_file(&entry_dir, &meta).await
    }

    fn record_get_error(&self) {
        let errs = self.get_errors.fetch_add(1, Ordering::Relaxed) + 1;
        if errs >= GET_ERROR_OFFLINE_THRESHOLD && self.online.swap(false, Ordering::Relaxed) {
            warn!(
                "cache drive {}: offline after {} consecutive I/O errors",
                self.dir.display(),
                errs
            );
        }
    }

    fn reset_get_errors(&self) {
        self.get_errors.store(0, Ordering::Relaxed);
    }

    async fn read_meta(
        &self,
        entry_dir: &Path,
        bucket: &str,
        object: &str,
    ) -> CacheResult<CacheEntryMeta> {
        let meta_path = entry_dir.join(CACHE_META_FILE);
        let data = match fs::read(&meta_path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CacheError::NotFound(format!("{}/{}", bucket, object)));
            }
            Err(e) => {
                warn!("cache: read meta of {}/{} failed! {}", bucket, object, e);
                self.record_get_error();
                return Err(CacheError::IoError(e.to_string()));
            }
        };
        match serde_json::from_slice::<CacheEntryMeta>(&data) {
            Ok(meta) => Ok(meta),
            Err(e) => {
                // corrupt metadata demotes the entry, not the drive
                warn!(
                    "cache: corrupt meta for {}/{} ({}), dropping entry",
                    bucket, object, e
                );
                remove_entry_files(entry_dir).await;
                Err(CacheError::NotFound(format!("{}/{}", bucket, object)))
            }
        }
    }

    // ---- capacity ----

    fn disk_usage(&self) -> CacheResult<DiskUsage> {
        let total = fs2::total_space(&self.dir).map_err(|e| CacheError::IoError(e.to_string()))?;
        let avail =
            fs2::available_space(&self.dir).map_err(|e| CacheError::IoError(e.to_string()))?;
        if total == 0 {
            return Err(CacheError::Internal(format!(
                "zero-sized filesystem under {}",
                self.dir.display()
            )));
        }
        let used = total.saturating_sub(avail);
        Ok(DiskUsage {
            total,
            pct: used * 100 / total,
        })
    }

    fn low_watermark_pct(&self) -> u64 {
        self.max_use_pct * PURGE_LOW_WATERMARK / 100
    }

    /// Below the purge trigger watermark?
    pub fn disk_usage_low(&self) -> bool {
        match self.disk_usage() {
            Ok(usage) => usage.pct < self.low_watermark_pct(),
            Err(e) => {
                warn!("cache drive {}: disk usage failed: {}", self.dir.display(), e);
                false
            }
        }
    }

    /// Would an object of `size` bytes fit without pushing usage past
    /// `max_use`? A one-block margin is kept for metadata and slack; the
    /// margin is part of the projection so a zero-size probe still checks
    /// the watermark.
    pub fn disk_available(&self, size: u64) -> bool {
        let total = match fs2::total_space(&self.dir) {
            Ok(t) if t > 0 => t,
            _ => return false,
        };
        let avail = match fs2::available_space(&self.dir) {
            Ok(a) => a,
            Err(_) => return false,
        };
        if avail < size.saturating_add(CACHE_BLOCK_SIZE as u64) {
            return false;
        }
        let projected = total.saturating_sub(avail) + size + CACHE_BLOCK_SIZE as u64;
        projected * 100 <= total * self.max_use_pct
    }

    pub fn capacity_info(&self) -> CacheResult<(u64, u64)> {
        let total = fs2::total_space(&self.dir).map_err(|e| CacheError::IoError(e.to_string()))?;
        let avail =
            fs2::available_space(&self.dir).map_err(|e| CacheError::IoError(e.to_string()))?;
        Ok((total, avail))
    }

    // ---- purger ----

    /// Non-blocking purge wakeup; a full channel means one is pending.
    pub fn poke_purge(&self) {
        let _ = self.purge_tx.try_send(());
    }

    /// Spawn the long-running purge worker for this drive.
    pub fn start_purger(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let rx = self.purge_rx.lock().unwrap().take();
        let cache = self.clone();
        tokio::spawn(async move {
            let mut rx = match rx {
                Some(rx) => rx,
                None => {
                    warn!(
                        "cache drive {}: purger already running",
                        cache.dir.display()
                    );
                    return;
                }
            };
            let mut ticker = tokio::time::interval(PURGE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = rx.recv() => {}
                }
                if !cache.is_online() {
                    continue;
                }
                match cache.purge_pass().await {
                    Ok(0) => {}
                    Ok(n) => info!(
                        "cache drive {}: purged {} entries",
                        cache.dir.display(),
                        n
                    ),
                    Err(e) => warn!("cache drive {}: purge failed: {}", cache.dir.display(), e),
                }
            }
            debug!("cache drive {}: purger stopped", cache.dir.display());
        })
    }

    fn effective_expiry(&self, meta: &CacheEntryMeta) -> u64 {
        if meta.expires != TIME_SENTINEL {
            return meta.expires;
        }
        // entries with explicit cache directives are governed by
        // revalidation, not by the default expiry
        if !meta.cache_control.is_empty() {
            return TIME_SENTINEL;
        }
        if self.expiry_days == 0 {
            return TIME_SENTINEL;
        }
        meta.mod_time + self.expiry_days as u64 * 86400
    }

    /// One purge sweep: drop expired entries unconditionally, then evict
    /// oldest-by-atime until usage is back under the low watermark.
    pub(crate) async fn purge_pass(&self) -> CacheResult<usize> {
        let now = unix_now();
        let usage = self.disk_usage()?;
        let mut deleted = 0usize;
        let mut candidates: Vec<(u64, u64, PathBuf)> = Vec::new();

        let mut shards = fs::read_dir(&self.dir).await.map_err(CacheError::from)?;
        while let Some(l1) = shards.next_entry().await.map_err(CacheError::from)? {
            if !l1.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let mut sub_shards = match fs::read_dir(l1.path()).await {
                Ok(d) => d,
                Err(_) => continue,
            };
            while let Some(l2) = sub_shards.next_entry().await.map_err(CacheError::from)? {
                if !l2.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    continue;
                }
                let mut entries = match fs::read_dir(l2.path()).await {
                    Ok(d) => d,
                    Err(_) => continue,
                };
                while let Some(entry) = entries.next_entry().await.map_err(CacheError::from)? {
                    if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                        continue;
                    }
                    let entry_dir = entry.path();
                    if let Some(candidate) =
                        self.purge_inspect_entry(&entry_dir, now, &mut deleted).await
                    {
                        candidates.push(candidate);
                    }
                }
            }
        }

        let low = self.low_watermark_pct();
        if usage.pct <= low {
            return Ok(deleted);
        }
        let target_bytes = usage.total * (usage.pct - low) / 100;
        candidates.sort_by_key(|(atime, _, _)| *atime);
        let mut freed = 0u64;
        for (_, size, entry_dir) in candidates {
            if freed >= target_bytes {
                break;
            }
            if remove_entry_files(&entry_dir).await {
                remove_empty_shards(&entry_dir).await;
                freed += size;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Classify one entry directory: reclaim it right away (expired entry,
    /// corrupt metadata, stale leftovers), leave it alone, or return it as
    /// an eviction candidate `(atime, size, dir)`.
    async fn purge_inspect_entry(
        &self,
        entry_dir: &Path,
        now: u64,
        deleted: &mut usize,
    ) -> Option<(u64, u64, PathBuf)> {
        let meta_bytes = match fs::read(entry_dir.join(CACHE_META_FILE)).await {
            Ok(b) => b,
            Err(_) => {
                // uncommitted leftovers are reclaimed only once stale, a
                // fill may still be writing here
                if partial_is_stale(entry_dir, now).await && remove_entry_files(entry_dir).await {
                    remove_empty_shards(entry_dir).await;
                    *deleted += 1;
                }
                return None;
            }
        };
        let meta = match serde_json::from_slice::<CacheEntryMeta>(&meta_bytes) {
            Ok(m) => m,
            Err(e) => {
                warn!("cache purge: corrupt meta under {}: {}", entry_dir.display(), e);
                if remove_entry_files(entry_dir).await {
                    remove_empty_shards(entry_dir).await;
                    *deleted += 1;
                }
                return None;
            }
        };

        let expiry = self.effective_expiry(&meta);
        if expiry != TIME_SENTINEL && now >= expiry {
            if remove_entry_files(entry_dir).await {
                remove_empty_shards(entry_dir).await;
                *deleted += 1;
            }
            return None;
        }

        let data_meta = match fs::metadata(entry_dir.join(CACHE_DATA_FILE)).await {
            Ok(m) => m,
            Err(_) => return None,
        };
        let atime = data_meta
            .accessed()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if now.saturating_sub(atime) < PURGE_RECENT_ACCESS_GRACE_SECS {
            return None;
        }
        Some((atime, data_meta.len(), entry_dir.to_path_buf()))
    }
}

async fn abort_put(entry_dir: &Path) {
    let _ = fs::remove_file(entry_dir.join(CACHE_DATA_TMP_FILE)).await;
    let _ = fs::remove_file(entry_dir.join(CACHE_META_TMP_FILE)).await;
    let _ = fs::remove_dir(entry_dir).await;
}

async fn remove_entry_files(entry_dir: &Path) -> bool {
    let mut removed = false;
    for name in [
        CACHE_META_FILE,
        CACHE_DATA_FILE,
        CACHE_META_TMP_FILE,
        CACHE_DATA_TMP_FILE,
    ] {
        if fs::remove_file(entry_dir.join(name)).await.is_ok() {
            removed = true;
        }
    }
    let _ = fs::remove_dir(entry_dir).await;
    removed
}

async fn remove_empty_shards(entry_dir: &Path) {
    if let Some(shard) = entry_dir.parent() {
        let _ = fs::remove_dir(shard).await;
        if let Some(parent) = shard.parent() {
            let _ = fs::remove_dir(parent).await;
        }
    }
}

async fn partial_is_stale(entry_dir: &Path, now: u64) -> bool {
    for name in [CACHE_DATA_TMP_FILE, CACHE_DATA_FILE] {
        if let Ok(md) = fs::metadata(entry_dir.join(name)).await {
            let modified = md
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(now);
            return now.saturating_sub(modified) > STALE_PARTIAL_AGE_SECS;
        }
    }
    // an empty entry directory is always reclaimable
    true
}

pub(crate) async fn write_meta_file(entry_dir: &Path, meta: &CacheEntryMeta) -> CacheResult<()> {
    let meta_str =
        serde_json::to_string(meta).map_err(|e| CacheError::Internal(e.to_string()))?;
    let tmp_path = entry_dir.join(CACHE_META_TMP_FILE);
    fs::write(&tmp_path, meta_str.as_bytes()).await.map_err(|e| {
        warn!("cache: write meta temp failed! {}", e);
        CacheError::IoError(e.to_string())
    })?;
    fs::rename(&tmp_path, entry_dir.join(CACHE_META_FILE))
        .await
        .map_err(|e| {
            warn!("cache: commit meta failed! {}", e);
            CacheError::IoError(e.to_string())
        })
}

/// Probe that the filesystem under `dir` advances atime: write a file,
/// wait, read it back and compare access times. Drives that fail this are
/// rejected, eviction would otherwise run blind.
async fn check_atime_support(dir: &Path) -> CacheResult<()> {
    let probe = dir.join(".atime-probe");
    fs::write(&probe, b"atime probe").await.map_err(|e| {
        CacheError::IoError(format!("atime probe write failed: {}", e))
    })?;
    let before = probe_atime(&probe).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let _ = fs::read(&probe).await.map_err(|e| {
        CacheError::IoError(format!("atime probe read failed: {}", e))
    })?;
    let after = probe_atime(&probe).await?;
    let _ = fs::remove_file(&probe).await;
    if after <= before {
        return Err(CacheError::AtimeUnsupported(format!(
            "filesystem under {} does not update atime",
            dir.display()
        )));
    }
    Ok(())
}

async fn probe_atime(path: &Path) -> CacheResult<std::time::SystemTime> {
    let md = fs::metadata(path)
        .await
        .map_err(|e| CacheError::IoError(format!("atime probe stat failed: {}", e)))?;
    md.accessed().map_err(|e| {
        CacheError::AtimeUnsupported(format!("atime not reported by the filesystem: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn test_metadata(etag: &str) -> HashMap<String, String> {
        let mut metadata = HashMap::new();
        metadata.insert(METADATA_ETAG.to_string(), etag.to_string());
        metadata.insert(METADATA_CONTENT_TYPE.to_string(), "text/plain".to_string());
        metadata.insert(METADATA_MOD_TIME.to_string(), unix_now().to_string());
        metadata
    }

    async fn new_cache(dir: &TempDir) -> DiskCache {
        DiskCache::new(dir.path().to_path_buf(), 90, 100)
            .await
            .unwrap()
    }

    fn reader_for(data: &[u8]) -> ObjectReader {
        Box::pin(Cursor::new(data.to_vec()))
    }

    async fn read_all(reader: &mut GetObjectReader) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache = new_cache(&dir).await;
        let ctx = CancellationToken::new();
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();

        cache
            .put(&ctx, "b", "obj", reader_for(&data), data.len() as i64, &test_metadata("etag-a"))
            .await
            .unwrap();

        let mut reader = cache.get(&ctx, "b", "obj", None).await.unwrap();
        assert_eq!(reader.object_info.etag, "etag-a");
        assert_eq!(reader.object_info.size, 4096);
        assert_eq!(read_all(&mut reader).await, data);

        let info = cache.stat("b", "obj").await.unwrap();
        assert_eq!(info.size, 4096);
        assert!(cache.exists("b", "obj").await);
    }

    #[tokio::test]
    async fn test_zero_byte_entry() {
        let dir = TempDir::new().unwrap();
        let cache = new_cache(&dir).await;
        let ctx = CancellationToken::new();

        cache
            .put(&ctx, "b", "empty", reader_for(&[]), 0, &test_metadata("etag-0"))
            .await
            .unwrap();
        let mut reader = cache.get(&ctx, "b", "empty", None).await.unwrap();
        assert!(read_all(&mut reader).await.is_empty());
        assert_eq!(cache.stat("b", "empty").await.unwrap().size, 0);
    }

    #[tokio::test]
    async fn test_unknown_size_records_observed_length() {
        let dir = TempDir::new().unwrap();
        let cache = new_cache(&dir).await;
        let ctx = CancellationToken::new();
        let data = vec![7u8; 12345];

        cache
            .put(&ctx, "b", "stream", reader_for(&data), obj_lib::SIZE_UNKNOWN, &test_metadata("etag-s"))
            .await
            .unwrap();
        assert_eq!(cache.stat("b", "stream").await.unwrap().size, 12345);
    }

    #[tokio::test]
    async fn test_put_rejects_oversized_object_as_drive_full() {
        let dir = TempDir::new().unwrap();
        let cache = new_cache(&dir).await;
        let ctx = CancellationToken::new();

        // no filesystem can hold this
        let err = cache
            .put(&ctx, "b", "huge", reader_for(b"x"), 1 << 60, &test_metadata("etag-h"))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::DriveFull(_)));
        assert!(!cache.exists("b", "huge").await);

        let entry_dir = cache.entry_dir("b", "huge");
        assert!(!entry_dir.join(CACHE_DATA_TMP_FILE).exists());
        assert!(!entry_dir.join(CACHE_META_TMP_FILE).exists());
    }

    #[tokio::test]
    async fn test_put_rejects_unknown_size_over_watermark() {
        let dir = TempDir::new().unwrap();
        // a zero watermark counts any usage as full, so the gate must fire
        // even though the stream's length is unknown up front
        let cache = DiskCache::new(dir.path().to_path_buf(), 90, 0)
            .await
            .unwrap();
        let ctx = CancellationToken::new();

        let err = cache
            .put(
                &ctx,
                "b",
                "stream",
                reader_for(&vec![5u8; 4096]),
                obj_lib::SIZE_UNKNOWN,
                &test_metadata("etag-u"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::DriveFull(_)));
        assert!(!cache.exists("b", "stream").await);
    }

    #[tokio::test]
    async fn test_short_stream_leaves_no_trace() {
        let dir = TempDir::new().unwrap();
        let cache = new_cache(&dir).await;
        let ctx = CancellationToken::new();
        let data = vec![1u8; 100];

        let err = cache
            .put(&ctx, "b", "short", reader_for(&data), 200, &test_metadata("etag-x"))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::IoError(_)));
        assert!(!cache.exists("b", "short").await);

        let entry_dir = cache.entry_dir("b", "short");
        assert!(!entry_dir.join(CACHE_DATA_TMP_FILE).exists());
        assert!(!entry_dir.join(CACHE_META_TMP_FILE).exists());
    }

    #[tokio::test]
    async fn test_ranged_get() {
        let dir = TempDir::new().unwrap();
        let cache = new_cache(&dir).await;
        let ctx = CancellationToken::new();
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        cache
            .put(&ctx, "b", "ranged", reader_for(&data), 1000, &test_metadata("etag-r"))
            .await
            .unwrap();

        let rs = HttpRangeSpec::from_offset_length(100, 50);
        let mut reader = cache.get(&ctx, "b", "ranged", Some(&rs)).await.unwrap();
        assert_eq!(read_all(&mut reader).await, &data[100..150]);

        let rs = HttpRangeSpec::from_offset(2000);
        let err = cache.get(&ctx, "b", "ranged", Some(&rs)).await.unwrap_err();
        assert!(matches!(err, CacheError::InvalidParam(_)));
    }

    #[tokio::test]
    async fn test_delete_then_stat_not_found() {
        let dir = TempDir::new().unwrap();
        let cache = new_cache(&dir).await;
        let ctx = CancellationToken::new();
        cache
            .put(&ctx, "b", "gone", reader_for(b"xyz"), 3, &test_metadata("etag-g"))
            .await
            .unwrap();

        cache.delete(&ctx, "b", "gone").await.unwrap();
        let err = cache.stat("b", "gone").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!cache.exists("b", "gone").await);
    }

    #[tokio::test]
    async fn test_corrupt_meta_treated_as_not_found() {
        let dir = TempDir::new().unwrap();
        let cache = new_cache(&dir).await;
        let ctx = CancellationToken::new();
        cache
            .put(&ctx, "b", "corrupt", reader_for(b"data"), 4, &test_metadata("etag-c"))
            .await
            .unwrap();

        let meta_path = cache.entry_dir("b", "corrupt").join(CACHE_META_FILE);
        fs::write(&meta_path, b"{not json").await.unwrap();

        let err = cache.stat("b", "corrupt").await.unwrap_err();
        assert!(err.is_not_found());
        // the corrupt entry is reaped, drive stays online
        assert!(!cache.exists("b", "corrupt").await);
        assert!(cache.is_online());
    }

    #[tokio::test]
    async fn test_update_metadata_if_changed() {
        let dir = TempDir::new().unwrap();
        let cache = new_cache(&dir).await;
        let ctx = CancellationToken::new();
        cache
            .put(&ctx, "b", "meta", reader_for(b"12345678"), 8, &test_metadata("etag-m"))
            .await
            .unwrap();
        let old_info = cache.stat("b", "meta").await.unwrap();

        let mut new_info = old_info.clone();
        new_info.content_type = "application/json".to_string();
        new_info
            .user_defined
            .insert("x-amz-meta-color".to_string(), "blue".to_string());
        cache
            .update_metadata_if_changed("b", "meta", &new_info, &old_info)
            .await
            .unwrap();

        let refreshed = cache.stat("b", "meta").await.unwrap();
        assert_eq!(refreshed.content_type, "application/json");
        assert_eq!(refreshed.size, 8);
        assert_eq!(
            refreshed.user_defined.get("x-amz-meta-color").unwrap(),
            "blue"
        );
    }

    #[tokio::test]
    async fn test_purge_removes_expired_entries() {
        let dir = TempDir::new().unwrap();
        let cache = new_cache(&dir).await;
        let ctx = CancellationToken::new();

        let mut expired = test_metadata("etag-e");
        expired.insert(METADATA_EXPIRES.to_string(), (unix_now() - 10).to_string());
        cache
            .put(&ctx, "b", "expired", reader_for(b"old"), 3, &expired)
            .await
            .unwrap();

        cache.purge_pass().await.unwrap();
        assert!(!cache.exists("b", "expired").await);
    }

    #[tokio::test]
    async fn test_purge_respects_future_expiry() {
        let dir = TempDir::new().unwrap();
        let cache = new_cache(&dir).await;
        let ctx = CancellationToken::new();

        let mut fresh = test_metadata("etag-f");
        fresh.insert(
            METADATA_EXPIRES.to_string(),
            (unix_now() + 3600).to_string(),
        );
        cache
            .put(&ctx, "b", "fresh", reader_for(b"new"), 3, &fresh)
            .await
            .unwrap();

        cache.purge_pass().await.unwrap();
        assert!(cache.exists("b", "fresh").await);
    }

    #[tokio::test]
    async fn test_cancelled_put_rolls_back() {
        let dir = TempDir::new().unwrap();
        let cache = new_cache(&dir).await;
        let ctx = CancellationToken::new();
        ctx.cancel();

        let err = cache
            .put(&ctx, "b", "c", reader_for(&vec![0u8; 4096]), 4096, &test_metadata("etag"))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(!cache.exists("b", "c").await);
    }

    #[tokio::test]
    async fn test_offline_drive_rejects_put() {
        let dir = TempDir::new().unwrap();
        let cache = new_cache(&dir).await;
        let ctx = CancellationToken::new();
        cache.set_offline();

        let err = cache
            .put(&ctx, "b", "o", reader_for(b"x"), 1, &test_metadata("etag"))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::DriveOffline(_)));
    }
}
