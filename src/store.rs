//! # Persistence Collaborator
//!
//! Keyed bucket store used for identity key material and the beacon
//! list. The trait is the seam; [`MemStore`] is the in-process
//! implementation used by the binary and the test suite. Ordered
//! iteration (`first`/`next`) exists solely so the beacon bucket can be
//! replayed at startup.

use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

/// Bucket holding persisted beacon records (signing key -> address).
pub const BEACON_BUCKET: &[u8] = b"beacon";

/// Bucket holding identity key configuration.
pub const CONFIG_BUCKET: &[u8] = b"config";

/// Config key: whether the identity key is static across restarts.
pub const STATIC_KEY_FLAG: &[u8] = b"static";

/// Config key: the persisted identity secret key.
pub const IDENTITY_KEY: &[u8] = b"key";

/// Keyed bucket storage. All operations may fail (the real store is
/// backed by disk); callers decide whether a failure is fatal.
pub trait BucketStore: Send + Sync {
    fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn set(&self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<()>;
    /// First entry of a bucket in key order.
    fn first(&self, bucket: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>>;
    /// Entry strictly after `key` in key order.
    fn next(&self, bucket: &[u8], key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>>;
}

/// In-memory bucket store.
#[derive(Default)]
pub struct MemStore {
    buckets: RwLock<HashMap<Vec<u8>, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BucketStore for MemStore {
    fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>> {
        let buckets = self.buckets.read().expect("store lock poisoned");
        Ok(buckets.get(bucket).and_then(|b| b.get(key)).cloned())
    }

    fn set(&self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<()> {
        let mut buckets = self.buckets.write().expect("store lock poisoned");
        buckets
            .entry(bucket.to_vec())
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn first(&self, bucket: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let buckets = self.buckets.read().expect("store lock poisoned");
        Ok(buckets
            .get(bucket)
            .and_then(|b| b.iter().next())
            .map(|(k, v)| (k.clone(), v.clone())))
    }

    fn next(&self, bucket: &[u8], key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        use std::ops::Bound;
        let buckets = self.buckets.read().expect("store lock poisoned");
        Ok(buckets
            .get(bucket)
            .and_then(|b| {
                b.range((Bound::Excluded(key.to_vec()), Bound::Unbounded))
                    .next()
            })
            .map(|(k, v)| (k.clone(), v.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_set_round_trip() {
        let store = MemStore::new();
        assert!(store.get(b"b", b"k").unwrap().is_none());
        store.set(b"b", b"k", b"v").unwrap();
        assert_eq!(store.get(b"b", b"k").unwrap().unwrap(), b"v");
    }

    #[test]
    fn ordered_iteration_walks_whole_bucket() {
        let store = MemStore::new();
        store.set(b"b", b"b-key", b"2").unwrap();
        store.set(b"b", b"a-key", b"1").unwrap();
        store.set(b"b", b"c-key", b"3").unwrap();

        let mut seen = Vec::new();
        let mut cursor = store.first(b"b").unwrap();
        while let Some((k, v)) = cursor {
            seen.push(v);
            cursor = store.next(b"b", &k).unwrap();
        }
        assert_eq!(seen, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
    }

    #[test]
    fn iteration_over_missing_bucket_is_empty() {
        let store = MemStore::new();
        assert!(store.first(b"nope").unwrap().is_none());
    }
}
