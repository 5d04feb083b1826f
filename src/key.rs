//! The sub-provider-opaque key and the sharded node table that maps it to a
//! live node (spec §3 `K`, §4.2).

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::RwLock;

use siphasher::sip::SipHasher13;

use crate::entry::NodeId;

/// Fixed seed so that two identical keys always produce identical `hash64`,
/// as required by spec §3 ("Hash is stable and seeded"). Any fixed pair
/// works; these are arbitrary.
const HASH_SEED_0: u64 = 0x7a6f_6f6c_6b65_7921;
const HASH_SEED_1: u64 = 0x6e66_7376_3463_6163;

/// Sub-provider-opaque key identifying one object across the cache.
#[derive(Debug, Clone)]
pub struct Key {
    pub provider_id: u16,
    pub opaque_bytes: Vec<u8>,
    pub hash64: u64,
}

impl Key {
    /// Build a key from provider id + opaque bytes, computing the stable hash.
    pub fn new(provider_id: u16, opaque_bytes: Vec<u8>) -> Self {
        let hash64 = Self::hash_of(provider_id, &opaque_bytes);
        Key { provider_id, opaque_bytes, hash64 }
    }

    fn hash_of(provider_id: u16, opaque_bytes: &[u8]) -> u64 {
        let mut hasher = SipHasher13::new_with_keys(HASH_SEED_0, HASH_SEED_1);
        hasher.write_u16(provider_id);
        hasher.write(opaque_bytes);
        hasher.finish()
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.provider_id == other.provider_id && self.opaque_bytes == other.opaque_bytes
    }
}
impl Eq for Key {}

impl std::hash::Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Delegate to the precomputed stable hash so the HashMap's own
        // hasher doesn't need to rehash the opaque bytes on every probe.
        state.write_u64(self.hash64);
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key(provider={}, bytes=", self.provider_id)?;
        for b in self.opaque_bytes.iter().take(32) {
            write!(f, "{:02x}", b)?;
        }
        if self.opaque_bytes.len() > 32 {
            write!(f, "...")?;
        }
        write!(f, ")")
    }
}

/// One shard of the node table: a plain map guarded by its own latch. Never
/// held across a sub-provider call (spec §5).
struct Shard {
    map: RwLock<HashMap<Key, NodeId>>,
}

/// Sharded associative table from [`Key`] to [`NodeId`] (spec §4.2).
///
/// Sharding is by the low bits of `hash64`, mirroring the teacher's
/// `DATASTORE_MAP` idiom (`pbs-datastore::datastore`) but split across
/// multiple locks so lookups for unrelated keys never contend.
pub struct NodeTable {
    shards: Vec<Shard>,
    mask: u64,
}

impl NodeTable {
    pub fn new(shard_count: u32) -> Self {
        assert!(shard_count.is_power_of_two(), "shard_count must be a power of two");
        let shards = (0..shard_count).map(|_| Shard { map: RwLock::new(HashMap::new()) }).collect();
        NodeTable { shards, mask: (shard_count as u64) - 1 }
    }

    fn shard_for(&self, key: &Key) -> &Shard {
        let idx = (key.hash64 & self.mask) as usize;
        &self.shards[idx]
    }

    /// Shared-latch lookup. Returns the node id if present.
    pub fn lookup(&self, key: &Key) -> Option<NodeId> {
        let shard = self.shard_for(key);
        let guard = shard.map.read().unwrap();
        guard.get(key).copied()
    }

    /// Publish `id` under `key`, write-latched. Fails only if the key is
    /// already present (the caller is expected to have already checked via
    /// [`NodeTable::lookup`] under the race protocol of spec §4.2; a
    /// concurrent racer winning between the read and the write is reported
    /// back as `Some(existing)` rather than silently overwritten).
    pub fn publish(&self, key: Key, id: NodeId) -> Result<(), NodeId> {
        let shard = self.shard_for(&key);
        let mut guard = shard.map.write().unwrap();
        if let Some(existing) = guard.get(&key) {
            return Err(*existing);
        }
        guard.insert(key, id);
        Ok(())
    }

    /// Remove the sentinel mapping for `key`. Returns the id that was
    /// removed, if any.
    pub fn remove(&self, key: &Key) -> Option<NodeId> {
        let shard = self.shard_for(key);
        let mut guard = shard.map.write().unwrap();
        guard.remove(key)
    }

    /// Atomically get-or-reserve: used by the creation race protocol
    /// (§4.2) to detect, under the shard write latch, whether a racer
    /// published first between the initial shared-latch miss and now.
    pub fn get_or_insert_with(&self, key: Key, make: impl FnOnce() -> NodeId) -> (NodeId, bool) {
        let shard = self.shard_for(&key);
        let mut guard = shard.map.write().unwrap();
        if let Some(existing) = guard.get(&key) {
            return (*existing, false);
        }
        let id = make();
        guard.insert(key, id);
        (id, true)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.map.read().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_keys_hash_identically() {
        let a = Key::new(1, b"abc".to_vec());
        let b = Key::new(1, b"abc".to_vec());
        assert_eq!(a.hash64, b.hash64);
        assert_eq!(a, b);
    }

    #[test]
    fn different_provider_differs() {
        let a = Key::new(1, b"abc".to_vec());
        let b = Key::new(2, b"abc".to_vec());
        assert_ne!(a, b);
    }

    #[test]
    fn publish_then_lookup() {
        let table = NodeTable::new(8);
        let key = Key::new(1, b"x".to_vec());
        assert!(table.lookup(&key).is_none());
        table.publish(key.clone(), NodeId(1)).unwrap();
        assert_eq!(table.lookup(&key), Some(NodeId(1)));
    }

    #[test]
    fn publish_rejects_duplicate() {
        let table = NodeTable::new(8);
        let key = Key::new(1, b"x".to_vec());
        table.publish(key.clone(), NodeId(1)).unwrap();
        let err = table.publish(key, NodeId(2)).unwrap_err();
        assert_eq!(err, NodeId(1));
    }

    #[test]
    fn remove_drops_mapping() {
        let table = NodeTable::new(8);
        let key = Key::new(1, b"x".to_vec());
        table.publish(key.clone(), NodeId(1)).unwrap();
        assert_eq!(table.remove(&key), Some(NodeId(1)));
        assert!(table.lookup(&key).is_none());
    }
}
