use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    BucketInfo, CacheResult, CacheStorageInfo, GetObjectReader, HttpRangeSpec, ListObjectsInfo,
    ObjectInfo, ObjectOptions, ObjectReader,
};

/// Capability interface to the upstream object store the cache fronts.
///
/// The cache coordinator is constructed with one of these; it never reaches
/// the backend any other way. Implementations must be safe to call from many
/// tasks at once. Every call takes a cancellation token; an implementation
/// observing cancellation should abort and return `CacheError::Cancelled`.
#[async_trait]
pub trait BackendObjectLayer: Send + Sync {
    async fn get_object_ninfo(
        &self,
        ctx: &CancellationToken,
        bucket: &str,
        object: &str,
        range: Option<&HttpRangeSpec>,
        opts: &ObjectOptions,
    ) -> CacheResult<GetObjectReader>;

    async fn get_object_info(
        &self,
        ctx: &CancellationToken,
        bucket: &str,
        object: &str,
        opts: &ObjectOptions,
    ) -> CacheResult<ObjectInfo>;

    async fn put_object(
        &self,
        ctx: &CancellationToken,
        bucket: &str,
        object: &str,
        data: ObjectReader,
        size: i64,
        opts: &ObjectOptions,
    ) -> CacheResult<ObjectInfo>;

    async fn delete_object(
        &self,
        ctx: &CancellationToken,
        bucket: &str,
        object: &str,
    ) -> CacheResult<()>;

    async fn list_buckets(&self, ctx: &CancellationToken) -> CacheResult<Vec<BucketInfo>>;

    async fn list_objects(
        &self,
        ctx: &CancellationToken,
        bucket: &str,
        prefix: &str,
        marker: &str,
        delimiter: &str,
        max_keys: usize,
    ) -> CacheResult<ListObjectsInfo>;

    async fn make_bucket_with_location(
        &self,
        ctx: &CancellationToken,
        bucket: &str,
        location: &str,
    ) -> CacheResult<()>;

    async fn storage_info(&self, ctx: &CancellationToken) -> CacheResult<CacheStorageInfo>;

    async fn get_bucket_policy(
        &self,
        ctx: &CancellationToken,
        bucket: &str,
    ) -> CacheResult<String>;

    async fn set_bucket_policy(
        &self,
        ctx: &CancellationToken,
        bucket: &str,
        policy: &str,
    ) -> CacheResult<()>;

    async fn delete_bucket_policy(
        &self,
        ctx: &CancellationToken,
        bucket: &str,
    ) -> CacheResult<()>;
}
