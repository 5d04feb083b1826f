//! The directory chunk engine (spec §4.5) — the hardest part of the cache.
//!
//! A directory's content cache keeps two parallel ordered views over the
//! same dirent arena — `name_tree` (serves `lookup`/negative caching) and
//! `cookie_tree` (serves `readdir` continuation) — plus a chunk arena that
//! groups adjacent cookie ranges, and a bounded LRU of dirents that could
//! not be slotted into any chunk ("detached").

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::arena::Arena;
use crate::config::Config;
use crate::dirent::{Chunk, ChunkId, Dirent, DirentFlags, DirentId};
use crate::key::Key;
use crate::lru::LruQueue;
use crate::spin::SpinLock;

/// Detached-dirent bookkeeping, guarded by its own spin lock so a bare LRU
/// bump never has to take `content_lock` (spec §5).
#[derive(Default)]
pub struct Detached {
    lru: LruQueue<usize>,
    count: u32,
}

/// Outcome of [`DirectoryContent::place_dirent`] (spec §4.5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Inserted(DirentId),
    Detached(DirentId),
}

/// Per-directory content cache (spec §3 "If type == directory").
pub struct DirectoryContent {
    dirents: Arena<Dirent>,
    chunks: Arena<Chunk>,
    name_tree: BTreeMap<Vec<u8>, usize>,
    cookie_tree: BTreeMap<u64, usize>,
    /// Tombstones: names recently removed, kept so a racing create/rename
    /// can recognise "this name was just deleted out from under me"
    /// instead of silently colliding (spec §3 `deleted_tree`).
    deleted_tree: BTreeMap<Vec<u8>, usize>,
    detached: SpinLock<Detached>,
    /// Cookie of the first dirent, if the first chunk is cached, else 0.
    pub first_cookie: u64,
    pub parent_key: Option<Key>,
    /// Count of in-flight creations into this directory; while nonzero,
    /// negative lookups must not be trusted (spec §4.1 `lookup`).
    create_refcount: AtomicU32,
}

impl Default for DirectoryContent {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectoryContent {
    pub fn new() -> Self {
        DirectoryContent {
            dirents: Arena::new(),
            chunks: Arena::new(),
            name_tree: BTreeMap::new(),
            cookie_tree: BTreeMap::new(),
            deleted_tree: BTreeMap::new(),
            detached: SpinLock::new(Detached::default()),
            first_cookie: 0,
            parent_key: None,
            create_refcount: AtomicU32::new(0),
        }
    }

    // -- accessors ------------------------------------------------------------

    pub fn dirent(&self, id: DirentId) -> Option<&Dirent> {
        self.dirents.get(id.0)
    }

    pub fn dirent_mut(&mut self, id: DirentId) -> Option<&mut Dirent> {
        self.dirents.get_mut(id.0)
    }

    pub fn chunk(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunks.get(id.0)
    }

    pub fn chunk_mut(&mut self, id: ChunkId) -> Option<&mut Chunk> {
        self.chunks.get_mut(id.0)
    }

    pub fn find_by_name(&self, name: &[u8]) -> Option<DirentId> {
        self.name_tree.get(name).map(|&idx| DirentId(idx))
    }

    pub fn is_tombstoned(&self, name: &[u8]) -> bool {
        self.deleted_tree.contains_key(name)
    }

    pub fn find_by_cookie(&self, ck: u64) -> Option<DirentId> {
        self.cookie_tree.get(&ck).map(|&idx| DirentId(idx))
    }

    /// Next dirent at or after `ck` in cookie order, used to resume a
    /// chunked readdir (spec §4.5.3).
    pub fn cookie_ceiling(&self, ck: u64) -> Option<DirentId> {
        self.cookie_tree.range(ck..).next().map(|(_, &idx)| DirentId(idx))
    }

    /// Number of *active* (non-tombstoned) dirents, the quantity bounded by
    /// `avl_max` (spec §8 "Bounded memory").
    pub fn active_len(&self) -> usize {
        self.name_tree.len()
    }

    /// Active dirents in name order, for full-population readdir's
    /// name-tree walk (spec §4.1 `readdir`, full-population mode).
    pub fn iter_by_name(&self) -> impl Iterator<Item = (&[u8], DirentId)> + '_ {
        self.name_tree.iter().map(|(name, &idx)| (name.as_slice(), DirentId(idx)))
    }

    pub fn begin_create(&self) {
        self.create_refcount.fetch_add(1, Ordering::AcqRel);
    }

    pub fn end_create(&self) {
        self.create_refcount.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn creating(&self) -> bool {
        self.create_refcount.load(Ordering::Acquire) > 0
    }

    // -- detached list ----------------------------------------------------------

    /// Fast-path MRU bump for a detached dirent: only the spin lock is
    /// taken, never `content_lock` (spec §5).
    pub fn bump_detached(&self, id: DirentId) {
        self.detached.lock().lru.bump(id.0);
    }

    /// Add `id` to the detached list, evicting the LRU tail past
    /// `avl_detached_max`. Returns ids evicted from the detached list (the
    /// caller must still unlink them from `name_tree` and free their arena
    /// slots — this only manages list membership + the bounded count).
    fn detach(&mut self, id: DirentId, avl_detached_max: u32) -> Vec<DirentId> {
        let mut evicted = Vec::new();
        let mut d = self.detached.lock();
        d.lru.push_front(id.0);
        d.count += 1;
        while d.count > avl_detached_max {
            if let Some(victim) = d.lru.pop_lru() {
                d.count -= 1;
                evicted.push(DirentId(victim));
            } else {
                break;
            }
        }
        evicted
    }

    fn undetach(&mut self, id: DirentId) {
        let mut d = self.detached.lock();
        if d.lru.remove(id.0) {
            d.count = d.count.saturating_sub(1);
        }
    }

    // -- insertion ----------------------------------------------------------------

    /// Insert a brand-new dirent as detached (used whenever chunking can't
    /// place it: chunking disabled, cookie unsupported, or a distrust
    /// condition). Evicted overflow dirents are fully freed.
    pub fn insert_detached(&mut self, name: Vec<u8>, ckey: Key, avl_detached_max: u32) -> DirentId {
        let dirent = Dirent::new(name.clone(), ckey);
        let idx = self.dirents.insert(dirent);
        self.name_tree.insert(name, idx);
        let id = DirentId(idx);
        for evicted in self.detach(id, avl_detached_max) {
            self.free_evicted_detached(evicted);
        }
        id
    }

    fn free_evicted_detached(&mut self, id: DirentId) {
        if let Some(d) = self.dirents.remove(id.0) {
            self.name_tree.remove(&d.name);
            if d.ck != 0 {
                self.cookie_tree.remove(&d.ck);
            }
        }
    }

    /// Place a freshly-discovered dirent into the chunk engine (spec
    /// §4.5.1). `cookie` is the sub-provider's
    /// `compute_readdir_cookie(parent, name)` result (0 = unsupported).
    /// `recompute_first_cookie` is called only in the "collision with the
    /// existing first cookie" case, to re-derive that dirent's true cookie.
    ///
    /// Returns the placement outcome and whether the whole chunk cache
    /// should now be distrusted (the caller clears
    /// `DIR_POPULATED | TRUST_DIR_CHUNKS` on that signal).
    pub fn place_dirent(
        &mut self,
        name: Vec<u8>,
        ckey: Key,
        cookie: u64,
        cfg: &Config,
        mut recompute_first_cookie: impl FnMut(&Dirent) -> Option<u64>,
    ) -> (Placement, bool) {
        if cookie == 0 {
            let id = self.insert_detached(name, ckey, cfg.avl_detached_max);
            return (Placement::Detached(id), true);
        }

        if self.cookie_tree.is_empty() {
            let mut dirent = Dirent::new(name.clone(), ckey);
            dirent.ck = cookie;
            let idx = self.dirents.insert(dirent);
            self.name_tree.insert(name, idx);
            self.cookie_tree.insert(cookie, idx);
            let id = DirentId(idx);
            for evicted in self.detach(id, cfg.avl_detached_max) {
                self.free_evicted_detached(evicted);
            }
            return (Placement::Detached(id), true);
        }

        if let Some(&existing_idx) = self.cookie_tree.get(&cookie) {
            let existing_id = DirentId(existing_idx);
            let recomputed = {
                let existing = self.dirents.get(existing_idx).expect("cookie_tree entry must exist");
                recompute_first_cookie(existing)
            };
            return match recomputed {
                Some(new_cookie) => {
                    self.cookie_tree.remove(&cookie);
                    self.dirents.get_mut(existing_idx).unwrap().ck = new_cookie;
                    self.cookie_tree.insert(new_cookie, existing_idx);

                    let mut dirent = Dirent::new(name.clone(), ckey);
                    dirent.ck = cookie;
                    let chunk_of_existing = self.dirents.get(existing_idx).unwrap().chunk;
                    let idx = self.dirents.insert(dirent);
                    self.name_tree.insert(name, idx);
                    self.cookie_tree.insert(cookie, idx);
                    let id = DirentId(idx);
                    if let Some(chunk_id) = chunk_of_existing {
                        self.insert_into_chunk_before(chunk_id, existing_id, id, cfg);
                    }
                    (Placement::Inserted(id), false)
                }
                None => {
                    let id = self.insert_detached(name, ckey, cfg.avl_detached_max);
                    (Placement::Detached(id), true)
                }
            };
        }

        let prev = self.cookie_tree.range(..cookie).next_back().map(|(_, &idx)| DirentId(idx));
        let next = self.cookie_tree.range(cookie..).next().map(|(_, &idx)| DirentId(idx));

        let prev_chunk = prev.and_then(|id| self.dirents.get(id.0)).and_then(|d| d.chunk);
        let next_chunk = next.and_then(|id| self.dirents.get(id.0)).and_then(|d| d.chunk);

        let insertable_between = match (prev, next, prev_chunk, next_chunk) {
            (Some(p), Some(n), Some(pc), Some(nc)) if pc == nc => Some((p, n, pc)),
            (Some(p), Some(n), Some(pc), Some(nc)) if self.chunk_follows(pc, nc) => Some((p, n, pc)),
            _ => None,
        };

        match insertable_between {
            Some((p, _n, chunk_id)) => {
                let mut dirent = Dirent::new(name.clone(), ckey);
                dirent.ck = cookie;
                let idx = self.dirents.insert(dirent);
                self.name_tree.insert(name, idx);
                self.cookie_tree.insert(cookie, idx);
                let id = DirentId(idx);
                self.insert_into_chunk_before(chunk_id, p, id, cfg);
                (Placement::Inserted(id), false)
            }
            None => {
                // Gap between non-adjacent chunks: keep trusting the
                // chunks we already have, but this dirent can't be slotted
                // in; detach it without distrusting anything.
                let id = self.insert_detached(name, ckey, cfg.avl_detached_max);
                (Placement::Detached(id), false)
            }
        }
    }

    fn chunk_follows(&self, pc: ChunkId, nc: ChunkId) -> bool {
        self.chunks.get(nc.0).map(|c| c.prev_chunk == Some(pc)).unwrap_or(false)
    }

    /// Insert `new_id` into `chunk_id`'s ordered list immediately after
    /// `after_id` (or at the start if `after_id` is itself the chunk's
    /// first entry and the cookie sorts before it), splitting the chunk if
    /// it now reaches `avl_chunk_split`.
    fn insert_into_chunk_before(&mut self, chunk_id: ChunkId, after_id: DirentId, new_id: DirentId, cfg: &Config) {
        {
            let chunk = self.chunks.get_mut(chunk_id.0).expect("chunk must exist");
            let pos = chunk.dirents.iter().position(|&d| d == after_id).map(|p| p + 1).unwrap_or(chunk.dirents.len());
            chunk.dirents.insert(pos, new_id);
        }
        if let Some(d) = self.dirents.get_mut(new_id.0) {
            d.chunk = Some(chunk_id);
            d.flags.insert(DirentFlags::SORTED);
        }
        self.relink_chunk_boundaries(chunk_id);
        self.maybe_split(chunk_id, cfg);
    }

    fn relink_chunk_boundaries(&mut self, chunk_id: ChunkId) {
        let next_ck = {
            let chunk = self.chunks.get(chunk_id.0).expect("chunk must exist");
            chunk.dirents.last().and_then(|&id| self.dirents.get(id.0)).map(|d| d.ck)
        };
        if let (Some(ck), Some(prev)) = (next_ck, self.chunks.get(chunk_id.0).and_then(|c| c.prev_chunk)) {
            if let Some(prev_chunk) = self.chunks.get_mut(prev.0) {
                if prev_chunk.next_ck == 0 {
                    prev_chunk.next_ck = ck;
                }
            }
        }
    }

    /// Splits a chunk in two once it reaches `avl_chunk_split` entries
    /// (spec §4.5.1 step 3). The second half moves to a new chunk whose
    /// `prev_chunk` is the original; `next_ck` linkage is updated on both.
    fn maybe_split(&mut self, chunk_id: ChunkId, cfg: &Config) {
        let should_split = self.chunks.get(chunk_id.0).map(|c| c.dirents.len() as u32 >= cfg.avl_chunk_split).unwrap_or(false);
        if !should_split || cfg.avl_chunk == 0 {
            return;
        }
        let (moved, old_next_ck) = {
            let chunk = self.chunks.get_mut(chunk_id.0).unwrap();
            let half = chunk.dirents.len() / 2;
            let moved: Vec<DirentId> = chunk.dirents.split_off(half);
            (moved, chunk.next_ck)
        };
        if moved.is_empty() {
            return;
        }
        let mut new_chunk = Chunk::new(Some(chunk_id));
        new_chunk.next_ck = old_next_ck;
        new_chunk.dirents = moved.clone();
        let new_chunk_idx = self.chunks.insert(new_chunk);
        let new_chunk_id = ChunkId(new_chunk_idx);

        let first_cookie_of_new = moved.first().and_then(|&id| self.dirents.get(id.0)).map(|d| d.ck).unwrap_or(0);
        for id in &moved {
            if let Some(d) = self.dirents.get_mut(id.0) {
                d.chunk = Some(new_chunk_id);
            }
        }
        if let Some(old_chunk) = self.chunks.get_mut(chunk_id.0) {
            old_chunk.next_ck = first_cookie_of_new;
        }
    }

    // -- chunk population (spec §4.5.2) -------------------------------------------

    pub fn alloc_chunk(&mut self, prev_chunk: Option<ChunkId>) -> ChunkId {
        ChunkId(self.chunks.insert(Chunk::new(prev_chunk)))
    }

    pub fn discard_chunk(&mut self, id: ChunkId) {
        self.chunks.remove(id.0);
    }

    /// Append a dirent discovered while streaming the sub-provider's
    /// `readdir` into `chunk_id`. Returns the outcome the caller uses to
    /// decide the next `DirAction` (spec §4.5.2 step 3).
    pub fn append_during_population(&mut self, chunk_id: ChunkId, name: Vec<u8>, ckey: Key, cookie: u64) -> PopulateOutcome {
        if let Some(&existing_idx) = self.name_tree.get(name.as_slice()) {
            let existing_id = DirentId(existing_idx);
            let existing_chunk = self.dirents.get(existing_idx).and_then(|d| d.chunk);
            if let Some(other_chunk) = existing_chunk {
                if other_chunk != chunk_id {
                    return PopulateOutcome::CollidedWithOtherChunk { existing: existing_id, cookie: self.dirents.get(existing_idx).map(|d| d.ck).unwrap_or(cookie) };
                }
            }
            self.undetach(existing_id);
            if let Some(d) = self.dirents.get_mut(existing_idx) {
                d.ck = cookie;
                d.chunk = Some(chunk_id);
            }
            self.cookie_tree.insert(cookie, existing_idx);
            if let Some(chunk) = self.chunks.get_mut(chunk_id.0) {
                if !chunk.dirents.contains(&existing_id) {
                    chunk.dirents.push(existing_id);
                }
            }
            return PopulateOutcome::Existing(existing_id);
        }

        let mut dirent = Dirent::new(name.clone(), ckey);
        dirent.ck = cookie;
        dirent.chunk = Some(chunk_id);
        let idx = self.dirents.insert(dirent);
        self.name_tree.insert(name, idx);
        self.cookie_tree.insert(cookie, idx);
        let id = DirentId(idx);
        if let Some(chunk) = self.chunks.get_mut(chunk_id.0) {
            chunk.dirents.push(id);
        }
        PopulateOutcome::Fresh(id)
    }

    pub fn mark_eod(&mut self, id: DirentId) {
        if let Some(d) = self.dirents.get_mut(id.0) {
            d.eod = true;
        }
    }

    pub fn link_prev_next_ck(&mut self, prev: ChunkId, cookie: u64) {
        if let Some(chunk) = self.chunks.get_mut(prev.0) {
            if chunk.next_ck == 0 {
                chunk.next_ck = cookie;
            }
        }
    }

    // -- removal / rename -----------------------------------------------------------

    /// Remove an active dirent by name (spec §4.1 `unlink`). If the dirent
    /// lives in a chunk, it is left in the chunk's list but flagged
    /// `DELETED` (readdir skips it, spec §4.5.3); if detached, it is fully
    /// freed. Either way it leaves `name_tree` and gains a tombstone.
    pub fn remove_active(&mut self, name: &[u8]) -> Option<DirentId> {
        let idx = self.name_tree.remove(name)?;
        let id = DirentId(idx);
        let (ck, in_chunk) = {
            let d = self.dirents.get_mut(idx)?;
            d.flags.insert(DirentFlags::DELETED);
            (d.ck, d.chunk.is_some())
        };
        if ck != 0 {
            self.cookie_tree.remove(&ck);
        }
        if in_chunk {
            self.deleted_tree.insert(name.to_vec(), idx);
        } else {
            self.undetach(id);
            self.dirents.remove(idx);
        }
        Some(id)
    }

    pub fn prune_tombstone(&mut self, name: &[u8]) {
        if let Some(idx) = self.deleted_tree.remove(name) {
            if let Some(d) = self.dirents.get(idx) {
                if let Some(chunk_id) = d.chunk {
                    if let Some(chunk) = self.chunks.get_mut(chunk_id.0) {
                        chunk.dirents.retain(|&x| x.0 != idx);
                    }
                }
            }
            self.dirents.remove(idx);
        }
    }

    /// In-place rename within the same (non-chunked) directory (spec §4.1
    /// `rename` step 5, "same directory, non-chunked"). On collision with
    /// an existing active dirent, the old entry is deleted and the new one
    /// takes its place.
    pub fn rename_in_place(&mut self, old_name: &[u8], new_name: Vec<u8>) -> Option<DirentId> {
        let idx = *self.name_tree.get(old_name)?;
        if let Some(&collide_idx) = self.name_tree.get(new_name.as_slice()) {
            if collide_idx != idx {
                let collide_name = self.dirents.get(collide_idx).map(|d| d.name.clone());
                if let Some(n) = collide_name {
                    self.remove_active(&n);
                }
            }
        }
        self.name_tree.remove(old_name);
        if let Some(d) = self.dirents.get_mut(idx) {
            d.name = new_name.clone();
        }
        self.name_tree.insert(new_name, idx);
        Some(DirentId(idx))
    }

    /// Reclaim a chunk under memory pressure (spec §4.3, recovered from
    /// `mdcache_clean_dirent_chunk` — see SPEC_FULL.md §4): every dirent it
    /// owned leaves `cookie_tree`; if detached-list room remains it is kept
    /// (as detached), otherwise it is dropped from `name_tree` too.
    pub fn reclaim_chunk(&mut self, chunk_id: ChunkId, avl_detached_max: u32) {
        let Some(chunk) = self.chunks.remove(chunk_id.0) else { return };
        for id in chunk.dirents {
            let Some(d) = self.dirents.get_mut(id.0) else { continue };
            if d.ck != 0 {
                self.cookie_tree.remove(&d.ck);
            }
            d.chunk = None;
            if d.is_deleted() {
                let name = d.name.clone();
                self.prune_tombstone(&name);
                continue;
            }
            for evicted in self.detach(id, avl_detached_max) {
                self.free_evicted_detached(evicted);
            }
        }
        if self.first_cookie != 0 && !self.cookie_tree.contains_key(&self.first_cookie) {
            self.first_cookie = 0;
        }
    }

    /// Drop the entire content cache: every dirent, chunk, and tree entry
    /// (spec §4.1 `unlink` on `NOTEMPTY`, §4.4 "Clean"). `parent_key` is
    /// preserved.
    pub fn invalidate_all(&mut self) {
        self.dirents = Arena::new();
        self.chunks = Arena::new();
        self.name_tree.clear();
        self.cookie_tree.clear();
        self.deleted_tree.clear();
        self.detached = SpinLock::new(Detached::default());
        self.first_cookie = 0;
    }
}

/// Outcome of appending a dirent while streaming a sub-provider `readdir`
/// (spec §4.5.2 step 3).
#[derive(Debug, Clone, Copy)]
pub enum PopulateOutcome {
    Fresh(DirentId),
    Existing(DirentId),
    /// The name was already cached in a *different* chunk: the chunk being
    /// built has collided with previously-cached content and population
    /// must stop (spec §4.5.2 step 4).
    CollidedWithOtherChunk { existing: DirentId, cookie: u64 },
}
