//! The top-level cache: node storage, the LRU/reclaimer queues, and the
//! node lifecycle (spec §4.2, §4.3, §4.4).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, trace};

use crate::arena::Arena;
use crate::config::Config;
use crate::context::{ExportId, OpContext};
use crate::entry::{flags, Entry, NodeId};
use crate::error::{CacheResult, Major, Status};
use crate::export::{check_mapping, Export};
use crate::key::{Key, NodeTable};
use crate::lru::LruQueue;
use crate::subprovider::{Attrs, SubProvider};

/// One live node plus its LRU membership, owned by the cache arena.
struct Slot<S: SubProvider> {
    entry: Arc<Entry<S>>,
}

/// Which LRU queue a node currently sits on (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Queue {
    Active,
    Reusable,
    Cleanup,
}

struct Queues {
    active: LruQueue<NodeId>,
    reusable: LruQueue<NodeId>,
    cleanup: Vec<NodeId>,
    membership: HashMap<NodeId, Queue>,
}

impl Queues {
    fn new() -> Self {
        Queues { active: LruQueue::new(), reusable: LruQueue::new(), cleanup: Vec::new(), membership: HashMap::new() }
    }

    fn insert_active(&mut self, id: NodeId) {
        self.active.push_front(id);
        self.membership.insert(id, Queue::Active);
    }

    fn bump_active(&mut self, id: NodeId) {
        match self.membership.get(&id) {
            Some(Queue::Active) => self.active.bump(id),
            Some(Queue::Reusable) => {
                self.reusable.remove(id);
                self.active.push_front(id);
                self.membership.insert(id, Queue::Active);
            }
            _ => self.insert_active(id),
        }
    }

    fn move_to_reusable(&mut self, id: NodeId) {
        if self.membership.get(&id) == Some(&Queue::Active) {
            self.active.remove(id);
        }
        self.reusable.push_front(id);
        self.membership.insert(id, Queue::Reusable);
    }

    fn move_to_cleanup(&mut self, id: NodeId) {
        self.active.remove(id);
        self.reusable.remove(id);
        self.cleanup.push(id);
        self.membership.insert(id, Queue::Cleanup);
    }

    fn forget(&mut self, id: NodeId) {
        self.active.remove(id);
        self.reusable.remove(id);
        self.cleanup.retain(|&x| x != id);
        self.membership.remove(&id);
    }

    /// LRU-ordered candidates in the `reusable` queue, for the reclaimer.
    fn reusable_candidates(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.reusable.iter_mru_to_lru().collect();
        ids.reverse();
        ids
    }
}

/// The metadata cache itself, generic over the sub-provider it wraps.
pub struct Mdcache<S: SubProvider> {
    provider: S,
    config: Config,
    table: NodeTable,
    nodes: Mutex<Arena<Slot<S>>>,
    queues: Mutex<Queues>,
    exports: RwLock<HashMap<ExportId, Arc<Export>>>,
}

impl<S: SubProvider> Mdcache<S> {
    pub fn new(provider: S, config: Config) -> Self {
        let table = NodeTable::new(config.shard_count);
        Mdcache {
            provider,
            config,
            table,
            nodes: Mutex::new(Arena::new()),
            queues: Mutex::new(Queues::new()),
            exports: RwLock::new(HashMap::new()),
        }
    }

    pub fn provider(&self) -> &S {
        &self.provider
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get-or-create the [`Export`] bookkeeping for `id` (spec §4.6).
    pub fn export(&self, id: ExportId) -> Arc<Export> {
        if let Some(e) = self.exports.read().unwrap().get(&id) {
            return e.clone();
        }
        let mut guard = self.exports.write().unwrap();
        guard.entry(id).or_insert_with(|| Arc::new(Export::new(id))).clone()
    }

    fn get_node(&self, id: NodeId) -> Option<Arc<Entry<S>>> {
        self.nodes.lock().unwrap().get(id.0).map(|slot| slot.entry.clone())
    }

    /// Look up a node already resident in the table without bumping its
    /// refcount or checking export reachability (spec §4.1 housekeeping
    /// paths — `unlink`/`rename` fixing up the moved/removed child after
    /// the dirent update already holds its own reference elsewhere).
    pub fn peek(&self, key: &Key) -> Option<Arc<Entry<S>>> {
        let id = self.table.lookup(key)?;
        self.get_node(id)
    }

    /// `find_keyed` (spec §4.2): shared-latch lookup, refcount bump, LRU
    /// bump to active, and export-mapping enforcement. `Ok(None)` is a
    /// plain cache miss; `Err` carries a hard failure (currently only a
    /// failed export mapping).
    pub fn find_keyed(&self, key: &Key, ctx: &OpContext) -> CacheResult<Option<Arc<Entry<S>>>> {
        let Some(id) = self.table.lookup(key) else { return Ok(None) };
        let Some(entry) = self.get_node(id) else { return Ok(None) };
        entry.take_ref();
        self.queues.lock().unwrap().bump_active(id);
        let export = self.export(ctx.export);
        if let Err(status) = check_mapping(&entry, &export) {
            entry.put_ref();
            return Err(status);
        }
        Ok(Some(entry))
    }

    fn default_expire(&self, _ctx: &OpContext) -> u32 {
        self.config.expire_time_attr_secs
    }

    /// Allocate/publish/merge (spec §4.2 creation race protocol, §4.4
    /// Allocate/Publish/Merge). `handle`/`attrs` must already have come
    /// from a successful sub-provider call; on a lost race the losing
    /// handle is merged into the winner and released.
    pub fn publish_or_merge(&self, key: Key, handle: S::Handle, attrs: Attrs, ctx: &OpContext) -> CacheResult<Arc<Entry<S>>> {
        if let Some(existing) = self.find_keyed(&key, ctx)? {
            existing.flags.clear(flags::UNREACHABLE);
            if let Some(result) = existing.with_handle(|existing_handle| self.provider.merge(ctx, existing_handle, &handle)) {
                result?;
            }
            self.provider.release(handle);
            trace!("publish_or_merge: merged into existing node {}", key);
            return Ok(existing);
        }

        let expire = self.default_expire(ctx);
        let entry = Arc::new(Entry::new(key.clone(), handle, attrs, expire));
        let provisional_id = {
            let mut nodes = self.nodes.lock().unwrap();
            NodeId(nodes.insert(Slot { entry: entry.clone() }))
        };
        entry.set_node_id(provisional_id);

        let (winner_id, won) = self.table.get_or_insert_with(key.clone(), || provisional_id);
        if won {
            self.queues.lock().unwrap().insert_active(provisional_id);
            let export = self.export(ctx.export);
            check_mapping(&entry, &export)?;
            debug!("publish_or_merge: published new node {}", key);
            return Ok(entry);
        }

        // Lost the race: drop our speculative slot and merge into the winner.
        self.nodes.lock().unwrap().remove(provisional_id.0);
        let winner = self.get_node(winner_id).ok_or_else(|| Status::new(Major::ServerFault))?;
        winner.take_ref();
        self.queues.lock().unwrap().bump_active(winner_id);
        if let Some(losing_handle) = entry.take_handle() {
            if let Some(result) = winner.with_handle(|winner_handle| self.provider.merge(ctx, winner_handle, &losing_handle)) {
                result?;
            }
            self.provider.release(losing_handle);
        }
        Ok(winner)
    }

    /// Release a caller-held reference (spec §6.1 `put_ref`). If this was
    /// the last reference and the node has already had its sentinel
    /// removed (it's on the cleanup queue), finalise it now.
    pub fn put_ref(&self, entry: &Entry<S>) {
        let id = entry.node_id();
        let remaining = entry.put_ref();
        if remaining == 0 {
            let on_cleanup = self.queues.lock().unwrap().membership.get(&id) == Some(&Queue::Cleanup);
            if on_cleanup {
                self.clean(id);
            }
        }
    }

    /// **Kill** (spec §4.4): drop the sentinel reference. If refcount
    /// doesn't immediately hit zero, the node moves to the cleanup queue
    /// for out-of-line finalisation by the last `put_ref`.
    pub fn kill_entry(&self, id: NodeId) {
        let Some(entry) = self.get_node(id) else { return };
        entry.flags.set(flags::UNREACHABLE);
        if self.table.remove(&entry.key).is_none() {
            return; // already killed by a racer
        }
        let remaining = entry.put_ref();
        if remaining == 0 {
            self.clean(id);
        } else {
            self.queues.lock().unwrap().move_to_cleanup(id);
        }
    }

    /// **Clean** (spec §4.4): drop directory content, remove from every
    /// queue, release the sub-provider handle, free the arena slot.
    fn clean(&self, id: NodeId) {
        if let Some(entry) = self.get_node(id) {
            if let Ok(mut content) = entry.content_lock.write() {
                if let Some(dir) = content.as_mut() {
                    dir.invalidate_all();
                }
                *content = None;
            }
        }
        self.queues.lock().unwrap().forget(id);
        let removed = self.nodes.lock().unwrap().remove(id.0);
        if let Some(slot) = removed {
            if let Some(h) = slot.entry.take_handle() {
                self.provider.release(h);
            }
            if Arc::strong_count(&slot.entry) > 1 {
                debug!("clean: node {} released with {} references still outstanding", id.0, Arc::strong_count(&slot.entry));
            }
        }
    }

    /// Demote the LRU tail of `active` into `reusable` when it has no
    /// caller-held references beyond the sentinel (spec §4.3 `bump`,
    /// reclaimer half of `get`).
    pub fn reclaim_pass(&self) -> usize {
        let candidates: Vec<NodeId> = {
            let q = self.queues.lock().unwrap();
            q.active.iter_mru_to_lru().collect()
        };
        let mut demoted = 0;
        for id in candidates.into_iter().rev() {
            if demoted + self.len_reusable() >= self.config.lru_high_water {
                break;
            }
            if let Some(entry) = self.get_node(id) {
                if entry.refcount() <= 1 {
                    self.queues.lock().unwrap().move_to_reusable(id);
                    demoted += 1;
                }
            }
        }
        demoted
    }

    /// Kill every node still idle in `reusable` once the table holds more
    /// live nodes than `lru_high_water` (spec §4.3 `get`'s reclamation).
    pub fn evict_pass(&self) -> usize {
        if self.table.len() <= self.config.lru_high_water {
            return 0;
        }
        let candidates = self.queues.lock().unwrap().reusable_candidates();
        let mut killed = 0;
        for id in candidates {
            if self.table.len() <= self.config.lru_high_water {
                break;
            }
            if let Some(entry) = self.get_node(id) {
                if entry.refcount() <= 1 {
                    self.kill_entry(id);
                    killed += 1;
                }
            }
        }
        killed
    }

    pub fn len_reusable(&self) -> usize {
        self.queues.lock().unwrap().reusable.len()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn node_id_for(&self, key: &Key) -> Option<NodeId> {
        self.table.lookup(key)
    }
}
