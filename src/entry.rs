//! The cached node itself (spec §3 `Entry`) and its atomic flag word.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Instant;

use crate::context::AttrMask;
use crate::directory::DirectoryContent;
use crate::key::Key;
use crate::subprovider::{Attrs, NodeType, SubProvider};

/// Index into the cache's node arena. Never reused while any reference
/// (caller-held or table-held) to the entry it names is live; see
/// [`crate::cache::Mdcache`] for the reclamation rule that makes this safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

/// Atomic flag bits (spec §3 `flags`). Individually CAS'd; the surrounding
/// `attr_lock`/`content_lock` guard the *consistency* of the broader state
/// each bit summarizes, not the bit's own atomicity.
pub mod flags {
    pub const TRUST_ATTRS: u32 = 1 << 0;
    pub const TRUST_CONTENT: u32 = 1 << 1;
    pub const TRUST_DIR_CHUNKS: u32 = 1 << 2;
    pub const DIR_POPULATED: u32 = 1 << 3;
    pub const BYPASS_DIRCACHE: u32 = 1 << 4;
    pub const UNREACHABLE: u32 = 1 << 5;
}

/// Thin wrapper over an [`AtomicU32`] exposing the bit operations the
/// cache needs: set/clear/test, without callers reaching for raw
/// `Ordering` everywhere.
#[derive(Debug, Default)]
pub struct AtomicFlags(AtomicU32);

impl AtomicFlags {
    pub fn new(initial: u32) -> Self {
        AtomicFlags(AtomicU32::new(initial))
    }

    pub fn test(&self, bits: u32) -> bool {
        self.0.load(Ordering::Acquire) & bits == bits
    }

    pub fn test_any(&self, bits: u32) -> bool {
        self.0.load(Ordering::Acquire) & bits != 0
    }

    pub fn set(&self, bits: u32) {
        self.0.fetch_or(bits, Ordering::AcqRel);
    }

    pub fn clear(&self, bits: u32) {
        self.0.fetch_and(!bits, Ordering::AcqRel);
    }

    pub fn snapshot(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

/// Cached attributes plus the bookkeeping needed to know when they expire
/// (spec §3 `attrs`).
pub struct AttrState {
    pub attrs: Attrs,
    pub request_mask: AttrMask,
    /// Captured once at publish time from the export's default; never
    /// re-read afterwards (SPEC_FULL.md §9, Open Question 3).
    pub expire_time_attr_secs: u32,
    pub last_refresh: Instant,
    /// Lazily fetched, ref-counted so multiple readers can share one copy
    /// without re-fetching from the sub-provider.
    pub acl: Option<std::sync::Arc<Vec<u8>>>,
}

impl AttrState {
    pub fn is_valid(&self) -> bool {
        self.last_refresh.elapsed().as_secs() < self.expire_time_attr_secs as u64
    }
}

/// Per-node export reachability (spec §4.6).
#[derive(Default)]
pub struct ExportList {
    pub exports: Vec<crate::context::ExportId>,
    pub first_export_id: AtomicU32,
}

const NO_EXPORT: u32 = u32::MAX;

impl ExportList {
    pub fn new() -> Self {
        ExportList { exports: Vec::new(), first_export_id: AtomicU32::new(NO_EXPORT) }
    }

    pub fn fast_path_hit(&self, export: crate::context::ExportId) -> bool {
        self.first_export_id.load(Ordering::Acquire) == export.0 as u32
    }

    pub fn contains(&self, export: crate::context::ExportId) -> bool {
        self.exports.contains(&export)
    }

    pub fn add(&mut self, export: crate::context::ExportId) {
        if !self.exports.contains(&export) {
            self.exports.push(export);
        }
        self.first_export_id.store(export.0 as u32, Ordering::Release);
    }
}

/// One cached object (spec §3 `Entry`). Generic over the sub-provider so the
/// cache never has to type-erase or downcast a provider handle.
pub struct Entry<S: SubProvider> {
    pub key: Key,
    /// Behind a `Mutex` (not a plain field) so [`Entry::take_handle`] can
    /// remove it for release purely on the logical refcount reaching zero,
    /// independent of how many `Arc<Entry<S>>` clones happen to still be
    /// outstanding at that instant (spec invariant 8).
    sub_handle: Mutex<Option<S::Handle>>,
    pub node_type: NodeType,
    pub flags: AtomicFlags,
    pub attr_lock: RwLock<AttrState>,
    pub refcount: AtomicUsize,
    pub export_list: RwLock<ExportList>,
    /// `Some` only for directories (spec §3: "If type == directory").
    pub content_lock: RwLock<Option<DirectoryContent>>,
    /// Set exactly once by [`crate::cache::Mdcache`] right after the arena
    /// slot is reserved, before the entry becomes reachable from any other
    /// thread. Lets callers that only hold an `Arc<Entry<S>>` (e.g. a
    /// readdir callback) release their reference without the cache having
    /// to thread a `NodeId` through every call site.
    node_id: AtomicUsize,
}

const UNASSIGNED_NODE_ID: usize = usize::MAX;

impl<S: SubProvider> Entry<S> {
    pub fn new(key: Key, sub_handle: S::Handle, attrs: Attrs, expire_time_attr_secs: u32) -> Self {
        let node_type = attrs.node_type;
        let content = if node_type.is_dir() { Some(DirectoryContent::new()) } else { None };
        Entry {
            key,
            sub_handle: Mutex::new(Some(sub_handle)),
            node_type,
            // A freshly attached node trusts its attrs until proven otherwise.
            flags: AtomicFlags::new(flags::TRUST_ATTRS),
            attr_lock: RwLock::new(AttrState {
                attrs,
                request_mask: AttrMask::NONE,
                expire_time_attr_secs,
                last_refresh: Instant::now(),
                acl: None,
            }),
            refcount: AtomicUsize::new(1),
            export_list: RwLock::new(ExportList::new()),
            content_lock: RwLock::new(content),
            node_id: AtomicUsize::new(UNASSIGNED_NODE_ID),
        }
    }

    /// Called once by the cache right after reserving this entry's arena
    /// slot.
    pub fn set_node_id(&self, id: NodeId) {
        self.node_id.store(id.0, Ordering::Release);
    }

    pub fn node_id(&self) -> NodeId {
        NodeId(self.node_id.load(Ordering::Acquire))
    }

    pub fn is_directory(&self) -> bool {
        self.node_type.is_dir()
    }

    /// Run `f` against the live sub-provider handle, if one is still
    /// present. `None` once [`Entry::take_handle`] has already run.
    pub fn with_handle<R>(&self, f: impl FnOnce(&S::Handle) -> R) -> Option<R> {
        self.sub_handle.lock().unwrap().as_ref().map(f)
    }

    /// Take the handle out for release. Idempotent: returns `None` if
    /// already taken.
    pub fn take_handle(&self) -> Option<S::Handle> {
        self.sub_handle.lock().unwrap().take()
    }

    pub fn is_unreachable(&self) -> bool {
        self.flags.test(flags::UNREACHABLE)
    }

    /// Bump the refcount for a new caller-held reference.
    pub fn take_ref(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Release a caller-held reference. Returns the count *after* the
    /// decrement so the caller can tell whether this was the last one.
    pub fn put_ref(&self) -> usize {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::flags::*;
    use super::*;

    #[test]
    fn flags_set_clear_test() {
        let f = AtomicFlags::new(0);
        assert!(!f.test(TRUST_ATTRS));
        f.set(TRUST_ATTRS | TRUST_CONTENT);
        assert!(f.test(TRUST_ATTRS));
        assert!(f.test(TRUST_CONTENT));
        f.clear(TRUST_ATTRS);
        assert!(!f.test(TRUST_ATTRS));
        assert!(f.test(TRUST_CONTENT));
    }

    #[test]
    fn export_list_fast_path() {
        use crate::context::ExportId;
        let mut list = ExportList::new();
        assert!(!list.fast_path_hit(ExportId(3)));
        list.add(ExportId(3));
        assert!(list.fast_path_hit(ExportId(3)));
        assert!(list.contains(ExportId(3)));
    }
}
