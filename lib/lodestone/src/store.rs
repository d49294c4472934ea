use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

/// Number of buckets in the table. Rehashing is deliberately deferred, so
/// chains simply grow past the intended load factor.
pub const BUCKET_COUNT: usize = 16;

struct Entry {
    key: Box<[u8]>,
    value: Box<[u8]>,
}

/// A concurrent mapping of opaque byte keys to opaque byte values. A single
/// lock serializes all operations; command execution is the only writer and
/// requests are serialized per connection, so finer-grained locking buys
/// nothing here.
pub struct Store {
    buckets: Mutex<Vec<Vec<Entry>>>,
}

impl Store {
    pub fn new() -> Store {
        Store {
            buckets: Mutex::new((0..BUCKET_COUNT).map(|_| Vec::new()).collect()),
        }
    }

    #[inline]
    fn bucket_index(key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % BUCKET_COUNT
    }

    /// Look up `key`, returning an independent copy of the value so the
    /// caller is unaffected by a concurrent overwrite or delete.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let buckets = self.buckets.lock().expect("store lock poisoned");

        buckets[Self::bucket_index(key)]
            .iter()
            .find(|entry| &*entry.key == key)
            .map(|entry| entry.value.to_vec())
    }

    /// Install `key -> value`, overwriting any prior mapping.
    pub fn set(&self, key: &[u8], value: &[u8]) {
        let mut buckets = self.buckets.lock().expect("store lock poisoned");
        let bucket = &mut buckets[Self::bucket_index(key)];

        match bucket.iter_mut().find(|entry| &*entry.key == key) {
            Some(entry) => entry.value = value.into(),
            None => bucket.push(Entry {
                key: key.into(),
                value: value.into(),
            }),
        }
    }

    /// Remove the mapping for `key` if present; no-op otherwise.
    pub fn del(&self, key: &[u8]) {
        let mut buckets = self.buckets.lock().expect("store lock poisoned");

        buckets[Self::bucket_index(key)].retain(|entry| &*entry.key != key);
    }

    /// Number of live entries across all buckets.
    pub fn len(&self) -> usize {
        let buckets = self.buckets.lock().expect("store lock poisoned");

        buckets.iter().map(|bucket| bucket.len()).sum()
    }
}

impl Default for Store {
    fn default() -> Store {
        Store::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_get_absent() {
        let store = Store::new();

        assert_eq!(store.get(b"missing"), None);
    }

    #[test]
    fn test_set_then_get() {
        let store = Store::new();

        store.set(b"foo", b"bar");

        assert_eq!(store.get(b"foo"), Some(b"bar".to_vec()));
    }

    #[test]
    fn test_set_is_idempotent() {
        let store = Store::new();

        store.set(b"foo", b"bar");
        store.set(b"foo", b"bar");

        assert_eq!(store.get(b"foo"), Some(b"bar".to_vec()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_set_overwrites() {
        let store = Store::new();

        store.set(b"k", b"v1");
        store.set(b"k", b"v2");

        assert_eq!(store.get(b"k"), Some(b"v2".to_vec()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_del() {
        let store = Store::new();

        store.set(b"k", b"v");
        store.del(b"k");

        assert_eq!(store.get(b"k"), None);
        assert_eq!(store.len(), 0);

        // Deleting an absent key is a no-op.
        store.del(b"k");
    }

    #[test]
    fn test_colliding_chains_keep_distinct_keys() {
        let store = Store::new();

        // Far more keys than buckets, so every chain holds several entries.
        for i in 0..256u32 {
            store.set(format!("key-{}", i).as_bytes(), format!("val-{}", i).as_bytes());
        }

        assert_eq!(store.len(), 256);

        for i in 0..256u32 {
            assert_eq!(
                store.get(format!("key-{}", i).as_bytes()),
                Some(format!("val-{}", i).into_bytes())
            );
        }
    }

    #[test]
    fn test_concurrent_writers_stay_consistent() {
        let store = Arc::new(Store::new());

        let handles: Vec<_> = (0..4u32)
            .map(|writer| {
                let store = store.clone();
                thread::spawn(move || {
                    for i in 0..500u32 {
                        let key = format!("key-{}", i % 16);
                        let value = format!("w{}-{}", writer, i);
                        store.set(key.as_bytes(), value.as_bytes());

                        if let Some(seen) = store.get(key.as_bytes()) {
                            // Any observed value must be a well-formed write.
                            assert!(seen.starts_with(b"w"));
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // One entry per distinct key, regardless of interleaving.
        assert_eq!(store.len(), 16);
    }
}
