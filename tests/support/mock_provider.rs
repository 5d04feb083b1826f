//! In-memory sub-provider used by the integration tests: enough of a real
//! filesystem to drive `lookup`/`create`/`mkdir`/`unlink`/`rename`/`readdir`
//! end to end against `mdcache::ops`. Supports `compute_readdir_cookie` but
//! not `Feature::WhenceIsName`, matching the scenario seeds' stated
//! sub-provider capabilities.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use mdcache::context::{AttrMask, OpContext};
use mdcache::error::{CacheResult, Major, Status};
use mdcache::subprovider::{Attrs, DirAction, Feature, LockOp, NodeType, RawDirent, SubProvider, WhencePtr};

struct MockObject {
    node_type: NodeType,
    /// cookie -> (name, child id), the provider's own canonical listing.
    children: BTreeMap<u64, (Vec<u8>, u64)>,
}

/// An in-memory, single-root filesystem. `Handle = u64`, the root is always
/// id `0`.
pub struct MockProvider {
    objects: Mutex<HashMap<u64, MockObject>>,
    cookies: Mutex<HashMap<(u64, Vec<u8>), u64>>,
    next_id: AtomicU64,
    next_cookie: AtomicU64,
    stale: Mutex<HashSet<u64>>,
    pub lookup_calls: AtomicU64,
}

impl MockProvider {
    pub fn new() -> Self {
        let mut objects = HashMap::new();
        objects.insert(0, MockObject { node_type: NodeType::Directory, children: BTreeMap::new() });
        MockProvider {
            objects: Mutex::new(objects),
            cookies: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            next_cookie: AtomicU64::new(mdcache::readdir::FIRST_VALID_COOKIE),
            stale: Mutex::new(HashSet::new()),
            lookup_calls: AtomicU64::new(0),
        }
    }

    fn cookie_for(&self, parent: u64, name: &[u8]) -> u64 {
        let mut cookies = self.cookies.lock().unwrap();
        *cookies.entry((parent, name.to_vec())).or_insert_with(|| self.next_cookie.fetch_add(1, Ordering::SeqCst))
    }

    fn attrs_for(&self, id: u64, node_type: NodeType) -> Attrs {
        Attrs {
            node_type,
            fsid: (0, 0),
            fileid: id,
            size: 0,
            mtime_secs: 0,
            ctime_secs: 0,
            change: 0,
            owner: 0,
            group: 0,
            mode: if node_type.is_dir() { 0o755 } else { 0o644 },
            nlink: 1,
            opaque: Vec::new(),
        }
    }

    fn insert_child(&self, parent: u64, name: &[u8], node_type: NodeType) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cookie = self.cookie_for(parent, name);
        let mut objects = self.objects.lock().unwrap();
        objects.insert(id, MockObject { node_type, children: BTreeMap::new() });
        objects.get_mut(&parent).expect("parent must exist").children.insert(cookie, (name.to_vec(), id));
        id
    }

    /// Make the next `getattrs` call against `id` fail with `Stale`,
    /// simulating the sub-provider discovering the handle is gone
    /// out-of-band (scenario seed 6).
    pub fn inject_stale(&self, id: u64) {
        self.stale.lock().unwrap().insert(id);
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SubProvider for MockProvider {
    type Handle = u64;

    fn lookup(&self, _: &OpContext, parent: &u64, name: &[u8]) -> CacheResult<(u64, Attrs)> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects.lock().unwrap();
        let parent_obj = objects.get(parent).ok_or_else(|| Status::new(Major::Stale))?;
        let (_, child) = parent_obj.children.values().find(|(n, _)| n == name).ok_or_else(|| Status::new(Major::NoEnt))?;
        let node_type = objects.get(child).map(|o| o.node_type).unwrap_or(NodeType::Regular);
        Ok((*child, self.attrs_for(*child, node_type)))
    }

    fn create(&self, _: &OpContext, parent: &u64, name: &[u8], _: u32) -> CacheResult<(u64, Attrs)> {
        let id = self.insert_child(*parent, name, NodeType::Regular);
        Ok((id, self.attrs_for(id, NodeType::Regular)))
    }

    fn mkdir(&self, _: &OpContext, parent: &u64, name: &[u8], _: u32) -> CacheResult<(u64, Attrs)> {
        let id = self.insert_child(*parent, name, NodeType::Directory);
        Ok((id, self.attrs_for(id, NodeType::Directory)))
    }

    fn mknode(&self, _: &OpContext, _: &u64, _: &[u8], _: NodeType, _: u32) -> CacheResult<(u64, Attrs)> {
        unimplemented!()
    }
    fn symlink(&self, _: &OpContext, _: &u64, _: &[u8], _: &[u8]) -> CacheResult<(u64, Attrs)> {
        unimplemented!()
    }
    fn readlink(&self, _: &OpContext, _: &u64) -> CacheResult<Vec<u8>> {
        unimplemented!()
    }
    fn link(&self, _: &OpContext, _: &u64, _: &u64, _: &[u8]) -> CacheResult<()> {
        unimplemented!()
    }

    fn unlink(&self, _: &OpContext, parent: &u64, name: &[u8]) -> CacheResult<()> {
        let mut objects = self.objects.lock().unwrap();
        let parent_obj = objects.get_mut(parent).ok_or_else(|| Status::new(Major::Stale))?;
        let cookie = parent_obj.children.iter().find(|(_, (n, _))| n == name).map(|(&c, _)| c);
        match cookie {
            Some(c) => {
                parent_obj.children.remove(&c);
                Ok(())
            }
            None => Err(Status::new(Major::NoEnt)),
        }
    }

    fn rename(&self, _: &OpContext, old_parent: &u64, old_name: &[u8], new_parent: &u64, new_name: &[u8]) -> CacheResult<()> {
        let mut objects = self.objects.lock().unwrap();
        let old_entry = {
            let old_obj = objects.get_mut(old_parent).ok_or_else(|| Status::new(Major::Stale))?;
            let cookie = old_obj.children.iter().find(|(_, (n, _))| n == old_name).map(|(&c, _)| c).ok_or_else(|| Status::new(Major::NoEnt))?;
            old_obj.children.remove(&cookie).expect("cookie just found").1
        };
        let new_cookie = self.cookie_for(*new_parent, new_name);
        let new_obj = objects.get_mut(new_parent).ok_or_else(|| Status::new(Major::Stale))?;
        new_obj.children.insert(new_cookie, (new_name.to_vec(), old_entry.1));
        Ok(())
    }

    fn readdir(&self, _: &OpContext, dir: &u64, whence: WhencePtr<'_>, cb: &mut dyn FnMut(RawDirent<u64>) -> DirAction) -> CacheResult<()> {
        let start = match whence {
            WhencePtr::Cookie(c) => c,
            WhencePtr::Name(_) => return Err(Status::new(Major::Inval)),
        };
        let objects = self.objects.lock().unwrap();
        let dir_obj = objects.get(dir).ok_or_else(|| Status::new(Major::Stale))?;
        let mut iter = dir_obj.children.range(start..).peekable();
        while let Some((&cookie, (name, child_id))) = iter.next() {
            let is_last = iter.peek().is_none();
            let node_type = objects.get(child_id).map(|o| o.node_type).unwrap_or(NodeType::Regular);
            let attrs = self.attrs_for(*child_id, node_type);
            let action = cb(RawDirent { name: name.clone(), handle: *child_id, attrs, cookie, eod: is_last });
            if !matches!(action, DirAction::Continue) {
                return Ok(());
            }
        }
        Ok(())
    }

    fn getattrs(&self, _: &OpContext, handle: &u64, _: AttrMask) -> CacheResult<Attrs> {
        if self.stale.lock().unwrap().remove(handle) {
            return Err(Status::new(Major::Stale));
        }
        let objects = self.objects.lock().unwrap();
        let obj = objects.get(handle).ok_or_else(|| Status::new(Major::Stale))?;
        Ok(self.attrs_for(*handle, obj.node_type))
    }
    fn setattrs(&self, _: &OpContext, _: &u64, _: &Attrs) -> CacheResult<()> {
        Ok(())
    }
    fn setattr2(&self, _: &OpContext, _: &u64, _: &Attrs, _: bool) -> CacheResult<()> {
        Ok(())
    }
    fn open(&self, _: &OpContext, _: &u64, _: u32) -> CacheResult<()> {
        Ok(())
    }
    fn close(&self, _: &OpContext, _: &u64) -> CacheResult<()> {
        Ok(())
    }
    fn read(&self, _: &OpContext, _: &u64, _: u64, _: &mut [u8]) -> CacheResult<usize> {
        Ok(0)
    }
    fn write(&self, _: &OpContext, _: &u64, _: u64, _: &[u8]) -> CacheResult<usize> {
        Ok(0)
    }
    fn commit(&self, _: &OpContext, _: &u64, _: u64, _: u64) -> CacheResult<()> {
        Ok(())
    }
    fn lock_op(&self, _: &OpContext, _: &u64, _: LockOp) -> CacheResult<()> {
        Ok(())
    }
    fn layoutget(&self, _: &OpContext, _: &u64) -> CacheResult<Vec<u8>> {
        unimplemented!()
    }
    fn layoutreturn(&self, _: &OpContext, _: &u64) -> CacheResult<()> {
        unimplemented!()
    }
    fn layoutcommit(&self, _: &OpContext, _: &u64) -> CacheResult<()> {
        unimplemented!()
    }
    fn list_xattr(&self, _: &OpContext, _: &u64) -> CacheResult<Vec<Vec<u8>>> {
        unimplemented!()
    }
    fn get_xattr(&self, _: &OpContext, _: &u64, _: &[u8]) -> CacheResult<Vec<u8>> {
        unimplemented!()
    }
    fn set_xattr(&self, _: &OpContext, _: &u64, _: &[u8], _: &[u8]) -> CacheResult<()> {
        unimplemented!()
    }
    fn remove_xattr(&self, _: &OpContext, _: &u64, _: &[u8]) -> CacheResult<()> {
        unimplemented!()
    }
    fn handle_to_wire(&self, h: &u64) -> Vec<u8> {
        h.to_le_bytes().to_vec()
    }
    fn handle_to_key(&self, h: &u64) -> Vec<u8> {
        h.to_le_bytes().to_vec()
    }
    fn handle_cmp(&self, a: &u64, b: &u64) -> bool {
        a == b
    }
    fn handle_is(&self, handle: &u64, node_type: NodeType) -> bool {
        self.objects.lock().unwrap().get(handle).map(|o| o.node_type == node_type).unwrap_or(false)
    }
    fn merge(&self, _: &OpContext, _: &u64, _: &u64) -> CacheResult<()> {
        Ok(())
    }
    fn release(&self, _: u64) {}
    fn lookup_path(&self, _: &OpContext, _: &[u8]) -> CacheResult<(u64, Attrs)> {
        unimplemented!()
    }
    fn create_handle(&self, _: &OpContext, _: &[u8]) -> CacheResult<u64> {
        unimplemented!()
    }
    fn host_to_key(&self, wire: &[u8]) -> Vec<u8> {
        wire.to_vec()
    }
    fn fs_supported_attrs(&self, _: &OpContext) -> AttrMask {
        AttrMask::NONE
    }
    fn fs_supports(&self, feature: Feature) -> bool {
        match feature {
            Feature::WhenceIsName => false,
            Feature::RenameChangesKey => false,
        }
    }
    fn compute_readdir_cookie(&self, _: &OpContext, parent: &u64, name: &[u8]) -> u64 {
        self.cookie_for(*parent, name)
    }
}
