use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};
use obj_lib::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::disk_cache::{write_meta_file, CacheEntryMeta, DiskCache, CACHE_DATA_FILE};

pub const CACHE_FORMAT_FILE: &str = "format.json";
const CACHE_FORMAT_TMP_FILE: &str = "format.tmp";

pub const CACHE_FORMAT_V1: u32 = 1;
pub const CACHE_FORMAT_V2: u32 = 2;

/// Files of the old flat layout: `<drive>/<bucket>/<object path>/` holding
/// a data file and its metadata document.
const CACHE_V1_META_FILE: &str = "cache.json";
const CACHE_V1_DATA_FILE: &str = "data";

/// Layout descriptor at the root of every formatted cache drive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheFormat {
    pub version: u32,
    pub id: String,
}

/// Old metadata document; every field optional, old writers differed.
#[derive(Debug, Default, Deserialize)]
struct CacheMetaV1 {
    #[serde(default)]
    size: i64,
    #[serde(default)]
    etag: String,
    #[serde(default)]
    mod_time: u64,
    #[serde(default)]
    expires: u64,
    #[serde(default)]
    cache_control: String,
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    content_encoding: String,
    #[serde(default)]
    user_defined: HashMap<String, String>,
}

/// Read (or initialize) the format descriptor of every configured drive.
///
/// Returns one slot per drive, `None` for drives that can not serve (an
/// unreadable directory, a corrupt or unsupported descriptor, or a
/// non-empty directory that was never formatted), plus whether any drive
/// still carries the V1 layout and needs migration.
pub async fn load_and_validate_cache_format(
    drives: &[PathBuf],
) -> CacheResult<(Vec<Option<CacheFormat>>, bool)> {
    let mut formats = Vec::with_capacity(drives.len());
    for dir in drives {
        formats.push(load_drive_format(dir).await);
    }
    let migrating = formats
        .iter()
        .flatten()
        .any(|f| f.version == CACHE_FORMAT_V1);
    Ok((formats, migrating))
}

async fn load_drive_format(dir: &Path) -> Option<CacheFormat> {
    if let Err(e) = fs::create_dir_all(dir).await {
        warn!("cache format: drive {} unusable: {}", dir.display(), e);
        return None;
    }
    let format_path = dir.join(CACHE_FORMAT_FILE);
    match fs::read(&format_path).await {
        Ok(data) => match serde_json::from_slice::<CacheFormat>(&data) {
            Ok(format) if format.version == CACHE_FORMAT_V1 || format.version == CACHE_FORMAT_V2 => {
                Some(format)
            }
            Ok(format) => {
                warn!(
                    "cache format: drive {} has unsupported version {}",
                    dir.display(),
                    format.version
                );
                None
            }
            Err(e) => {
                warn!("cache format: drive {} corrupt format.json: {}", dir.display(), e);
                None
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // only a genuinely empty directory is adopted and formatted;
            // anything else without a descriptor stays out of the pool
            match dir_is_empty(dir).await {
                Ok(true) => {
                    let format = CacheFormat {
                        version: CACHE_FORMAT_V2,
                        id: new_drive_id(dir),
                    };
                    match write_format(dir, &format).await {
                        Ok(()) => Some(format),
                        Err(e) => {
                            warn!("cache format: init drive {} failed: {}", dir.display(), e);
                            None
                        }
                    }
                }
                Ok(false) => {
                    warn!(
                        "cache format: drive {} is unformatted but not empty",
                        dir.display()
                    );
                    None
                }
                Err(e) => {
                    warn!("cache format: inspect drive {} failed: {}", dir.display(), e);
                    None
                }
            }
        }
        Err(e) => {
            warn!("cache format: read {} failed: {}", format_path.display(), e);
            None
        }
    }
}

async fn dir_is_empty(dir: &Path) -> CacheResult<bool> {
    let mut entries = fs::read_dir(dir).await.map_err(CacheError::from)?;
    Ok(entries.next_entry().await.map_err(CacheError::from)?.is_none())
}

pub(crate) async fn write_format(dir: &Path, format: &CacheFormat) -> CacheResult<()> {
    let format_str =
        serde_json::to_string(format).map_err(|e| CacheError::Internal(e.to_string()))?;
    let tmp_path = dir.join(CACHE_FORMAT_TMP_FILE);
    fs::write(&tmp_path, format_str.as_bytes())
        .await
        .map_err(|e| CacheError::IoError(e.to_string()))?;
    fs::rename(&tmp_path, dir.join(CACHE_FORMAT_FILE))
        .await
        .map_err(|e| CacheError::IoError(e.to_string()))
}

fn new_drive_id(dir: &Path) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let mut hasher = Sha256::new();
    hasher.update(dir.to_string_lossy().as_bytes());
    hasher.update(nanos.to_be_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Rewrite one drive from the V1 flat layout to the sharded V2 layout.
/// Entries move one at a time through temp names so a crash mid-migration
/// leaves each entry either fully in the old place or fully in the new
/// one; the format descriptor flips to V2 only after the walk completes.
pub async fn migrate_old_cache(cache: &DiskCache) -> CacheResult<()> {
    let drive_dir = cache.dir().to_path_buf();
    let format_data = fs::read(drive_dir.join(CACHE_FORMAT_FILE))
        .await
        .map_err(|e| CacheError::IoError(format!("read cache format: {}", e)))?;
    let format: CacheFormat = serde_json::from_slice(&format_data)
        .map_err(|e| CacheError::Corruption(format!("cache format: {}", e)))?;
    if format.version == CACHE_FORMAT_V2 {
        return Ok(());
    }

    info!("cache drive {}: migrating v1 layout", drive_dir.display());

    // (directory, bucket, object path so far)
    let mut pending: Vec<(PathBuf, String, String)> = Vec::new();
    let mut bucket_dirs: Vec<PathBuf> = Vec::new();

    let mut top = fs::read_dir(&drive_dir).await.map_err(CacheError::from)?;
    while let Some(entry) = top.next_entry().await.map_err(CacheError::from)? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || name == CACHE_FORMAT_FILE {
            continue;
        }
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            bucket_dirs.push(entry.path());
            pending.push((entry.path(), name, String::new()));
        }
    }

    while let Some((fs_dir, bucket, object_prefix)) = pending.pop() {
        if fs::metadata(fs_dir.join(CACHE_V1_META_FILE)).await.is_ok() {
            migrate_v1_entry(cache, &fs_dir, &bucket, &object_prefix).await?;
            continue;
        }
        let mut children = match fs::read_dir(&fs_dir).await {
            Ok(d) => d,
            Err(e) => {
                return Err(CacheError::IoError(format!(
                    "walk {}: {}",
                    fs_dir.display(),
                    e
                )))
            }
        };
        while let Some(child) = children.next_entry().await.map_err(CacheError::from)? {
            if !child.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = child.file_name().to_string_lossy().to_string();
            let object = if object_prefix.is_empty() {
                name
            } else {
                format!("{}/{}", object_prefix, name)
            };
            pending.push((child.path(), bucket.clone(), object));
        }
    }

    write_format(
        &drive_dir,
        &CacheFormat {
            version: CACHE_FORMAT_V2,
            id: format.id,
        },
    )
    .await?;

    for bucket_dir in bucket_dirs {
        remove_dir_tree_if_empty(&bucket_dir).await;
    }
    info!("cache drive {}: v1 migration done", drive_dir.display());
    Ok(())
}

async fn migrate_v1_entry(
    cache: &DiskCache,
    old_dir: &Path,
    bucket: &str,
    object: &str,
) -> CacheResult<()> {
    let meta_bytes = fs::read(old_dir.join(CACHE_V1_META_FILE))
        .await
        .map_err(|e| CacheError::IoError(e.to_string()))?;
    let old_meta: CacheMetaV1 = match serde_json::from_slice(&meta_bytes) {
        Ok(m) => m,
        Err(e) => {
            // a v1 entry we can not decode is dropped, not carried over
            warn!(
                "cache migrate: corrupt v1 meta under {}: {}, dropping entry",
                old_dir.display(),
                e
            );
            let _ = fs::remove_dir_all(old_dir).await;
            return Ok(());
        }
    };

    let new_dir = cache.entry_dir(bucket, object);
    fs::create_dir_all(&new_dir)
        .await
        .map_err(|e| CacheError::IoError(e.to_string()))?;

    let scratch_data = new_dir.join("part.migrating");
    fs::rename(old_dir.join(CACHE_V1_DATA_FILE), &scratch_data)
        .await
        .map_err(|e| CacheError::IoError(format!("move v1 data: {}", e)))?;

    let mut metadata = old_meta.user_defined.clone();
    metadata.insert(obj_lib::METADATA_ETAG.to_string(), old_meta.etag.clone());
    if !old_meta.cache_control.is_empty() {
        metadata.insert(
            obj_lib::METADATA_CACHE_CONTROL.to_string(),
            old_meta.cache_control.clone(),
        );
    }
    let mut meta = CacheEntryMeta::from_metadata(bucket, object, old_meta.size, &metadata);
    meta.mod_time = old_meta.mod_time;
    meta.expires = old_meta.expires;
    meta.content_type = old_meta.content_type;
    meta.content_encoding = old_meta.content_encoding;

    fs::rename(&scratch_data, new_dir.join(CACHE_DATA_FILE))
        .await
        .map_err(|e| CacheError::IoError(format!("commit migrated data: {}", e)))?;
    write_meta_file(&new_dir, &meta).await?;

    let _ = fs::remove_dir_all(old_dir).await;
    Ok(())
}

async fn remove_dir_tree_if_empty(dir: &Path) {
    // depth-first sweep of now-empty v1 directories; non-empty ones stay
    let mut stack = vec![dir.to_path_buf()];
    let mut ordered = Vec::new();
    while let Some(current) = stack.pop() {
        ordered.push(current.clone());
        if let Ok(mut entries) = fs::read_dir(&current).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    stack.push(entry.path());
                }
            }
        }
    }
    for current in ordered.iter().rev() {
        let _ = fs::remove_dir(current).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obj_lib::unix_now;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fresh_drive_is_initialized_to_v2() {
        let dir = TempDir::new().unwrap();
        let drives = vec![dir.path().to_path_buf()];
        let (formats, migrating) = load_and_validate_cache_format(&drives).await.unwrap();
        assert!(!migrating);
        let format = formats[0].as_ref().unwrap();
        assert_eq!(format.version, CACHE_FORMAT_V2);
        assert!(!format.id.is_empty());

        // a second load sees the persisted descriptor
        let (formats2, _) = load_and_validate_cache_format(&drives).await.unwrap();
        assert_eq!(formats2[0].as_ref().unwrap().id, format.id);
    }

    #[tokio::test]
    async fn test_unformatted_non_empty_drive_is_skipped() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("stray.bin"), b"junk")
            .await
            .unwrap();
        let (formats, migrating) =
            load_and_validate_cache_format(&[dir.path().to_path_buf()])
                .await
                .unwrap();
        assert!(formats[0].is_none());
        assert!(!migrating);
    }

    #[tokio::test]
    async fn test_corrupt_format_is_skipped() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join(CACHE_FORMAT_FILE), b"not json")
            .await
            .unwrap();
        let (formats, _) = load_and_validate_cache_format(&[dir.path().to_path_buf()])
            .await
            .unwrap();
        assert!(formats[0].is_none());
    }

    #[tokio::test]
    async fn test_v1_drive_flags_migration() {
        let dir = TempDir::new().unwrap();
        let format = CacheFormat {
            version: CACHE_FORMAT_V1,
            id: "abc".to_string(),
        };
        write_format(dir.path(), &format).await.unwrap();

        let (formats, migrating) = load_and_validate_cache_format(&[dir.path().to_path_buf()])
            .await
            .unwrap();
        assert!(migrating);
        assert_eq!(formats[0].as_ref().unwrap().version, CACHE_FORMAT_V1);
    }

    async fn seed_v1_entry(drive: &Path, bucket: &str, object: &str, data: &[u8], etag: &str) {
        let entry_dir = drive.join(bucket).join(object);
        fs::create_dir_all(&entry_dir).await.unwrap();
        fs::write(entry_dir.join(CACHE_V1_DATA_FILE), data)
            .await
            .unwrap();
        let meta = serde_json::json!({
            "size": data.len() as i64,
            "etag": etag,
            "mod_time": unix_now(),
            "content_type": "application/octet-stream",
        });
        fs::write(entry_dir.join(CACHE_V1_META_FILE), meta.to_string())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_migrate_v1_entries_to_sharded_layout() {
        let dir = TempDir::new().unwrap();
        write_format(
            dir.path(),
            &CacheFormat {
                version: CACHE_FORMAT_V1,
                id: "drive-1".to_string(),
            },
        )
        .await
        .unwrap();
        seed_v1_entry(dir.path(), "photos", "summer/beach.jpg", b"jpeg bytes", "e1").await;
        seed_v1_entry(dir.path(), "docs", "readme.txt", b"hello", "e2").await;

        let cache = DiskCache::new(dir.path().to_path_buf(), 90, 100)
            .await
            .unwrap();
        migrate_old_cache(&cache).await.unwrap();

        // entries are reachable through the v2 layout
        assert!(cache.exists("photos", "summer/beach.jpg").await);
        assert!(cache.exists("docs", "readme.txt").await);
        let info = cache.stat("photos", "summer/beach.jpg").await.unwrap();
        assert_eq!(info.etag, "e1");
        assert_eq!(info.size, b"jpeg bytes".len() as i64);

        // format advanced, drive id preserved, old tree gone
        let format: CacheFormat = serde_json::from_slice(
            &fs::read(dir.path().join(CACHE_FORMAT_FILE)).await.unwrap(),
        )
        .unwrap();
        assert_eq!(format.version, CACHE_FORMAT_V2);
        assert_eq!(format.id, "drive-1");
        assert!(!dir.path().join("photos").exists());

        // second run is a no-op
        migrate_old_cache(&cache).await.unwrap();
    }
}
