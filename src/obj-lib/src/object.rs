use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::TIME_SENTINEL;

/// User-metadata key carried by objects encrypted with a client-provided key.
/// Such objects can not be cached: the cache never holds key material.
pub const SSEC_ALGORITHM_KEY: &str = "x-amz-server-side-encryption-customer-algorithm";

/// User-metadata key the backend sets while a multipart upload is still being
/// assembled in place.
pub const MULTIPART_IN_PROGRESS_KEY: &str = "x-amz-multipart-upload-in-progress";

pub const METADATA_ETAG: &str = "etag";
pub const METADATA_CONTENT_TYPE: &str = "content-type";
pub const METADATA_CONTENT_ENCODING: &str = "content-encoding";
pub const METADATA_EXPIRES: &str = "expires";
pub const METADATA_MOD_TIME: &str = "mod-time";
pub const METADATA_CACHE_CONTROL: &str = "cache-control";

/// Descriptive state of one object, as reported by the backend or
/// reconstructed from a cached metadata document. Timestamps are unix
/// seconds, `TIME_SENTINEL` meaning "not set".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub bucket: String,
    pub name: String,
    pub etag: String,
    /// Total payload bytes; `SIZE_UNKNOWN` when the length is not known.
    pub size: i64,
    pub mod_time: u64,
    pub expires: u64,
    pub content_type: String,
    pub content_encoding: String,
    pub user_defined: HashMap<String, String>,
}

impl ObjectInfo {
    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }

    pub fn cache_control(&self) -> Option<&str> {
        self.user_defined
            .get(METADATA_CACHE_CONTROL)
            .map(|s| s.as_str())
    }

    /// Only fully-materialized, non-SSE-C, non-in-progress objects are
    /// admitted into the cache.
    pub fn is_cacheable(&self) -> bool {
        !self.is_dir()
            && !self.user_defined.contains_key(SSEC_ALGORITHM_KEY)
            && !self.user_defined.contains_key(MULTIPART_IN_PROGRESS_KEY)
    }

    /// Flatten this info into the metadata map handed to a cache fill.
    pub fn fill_metadata(&self) -> HashMap<String, String> {
        let mut metadata = HashMap::new();
        metadata.insert(METADATA_ETAG.to_string(), self.etag.clone());
        metadata.insert(METADATA_CONTENT_TYPE.to_string(), self.content_type.clone());
        if !self.content_encoding.is_empty() {
            metadata.insert(
                METADATA_CONTENT_ENCODING.to_string(),
                self.content_encoding.clone(),
            );
        }
        if self.expires != TIME_SENTINEL {
            metadata.insert(METADATA_EXPIRES.to_string(), self.expires.to_string());
        }
        if self.mod_time != TIME_SENTINEL {
            metadata.insert(METADATA_MOD_TIME.to_string(), self.mod_time.to_string());
        }
        for (k, v) in &self.user_defined {
            metadata.insert(k.clone(), v.clone());
        }
        metadata
    }
}

/// Per-call options threaded through the object API.
#[derive(Debug, Clone, Default)]
pub struct ObjectOptions {
    pub user_defined: HashMap<String, String>,
}

/// Total and free capacity of the cache drives (or of the backend storage).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStorageInfo {
    pub total: u64,
    pub free: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketInfo {
    pub name: String,
    pub created: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ListObjectsInfo {
    pub is_truncated: bool,
    pub next_marker: String,
    pub objects: Vec<ObjectInfo>,
    pub prefixes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_info() -> ObjectInfo {
        ObjectInfo {
            bucket: "photos".to_string(),
            name: "2024/cat.jpg".to_string(),
            etag: "abc123".to_string(),
            size: 4096,
            mod_time: 1_700_000_000,
            ..Default::default()
        }
    }

    #[test]
    fn test_is_cacheable() {
        let info = base_info();
        assert!(info.is_cacheable());

        let mut dir = base_info();
        dir.name = "2024/".to_string();
        assert!(!dir.is_cacheable());

        let mut ssec = base_info();
        ssec.user_defined
            .insert(SSEC_ALGORITHM_KEY.to_string(), "AES256".to_string());
        assert!(!ssec.is_cacheable());

        let mut multipart = base_info();
        multipart
            .user_defined
            .insert(MULTIPART_IN_PROGRESS_KEY.to_string(), "true".to_string());
        assert!(!multipart.is_cacheable());
    }

    #[test]
    fn test_fill_metadata() {
        let mut info = base_info();
        info.content_type = "image/jpeg".to_string();
        info.expires = 1_800_000_000;
        info.user_defined
            .insert("x-amz-meta-owner".to_string(), "alice".to_string());

        let metadata = info.fill_metadata();
        assert_eq!(metadata.get(METADATA_ETAG).unwrap(), "abc123");
        assert_eq!(metadata.get(METADATA_CONTENT_TYPE).unwrap(), "image/jpeg");
        assert_eq!(metadata.get(METADATA_EXPIRES).unwrap(), "1800000000");
        assert_eq!(metadata.get("x-amz-meta-owner").unwrap(), "alice");
        assert!(!metadata.contains_key(METADATA_CONTENT_ENCODING));
    }
}
