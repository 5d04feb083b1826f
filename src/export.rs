//! Per-export reachability bookkeeping (spec §4.6).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::context::ExportId;
use crate::entry::Entry;
use crate::error::{CacheResult, Major, Status};
use crate::subprovider::SubProvider;

/// One export a node may be reachable through. `lock` is the `mdc_exp_lock`
/// of spec §5, taken only while linking a fresh mapping.
pub struct Export {
    pub id: ExportId,
    unexported: AtomicBool,
    lock: Mutex<()>,
}

impl Export {
    pub fn new(id: ExportId) -> Self {
        Export { id, unexported: AtomicBool::new(false), lock: Mutex::new(()) }
    }

    pub fn mark_unexported(&self) {
        self.unexported.store(true, Ordering::Release);
    }

    pub fn is_unexported(&self) -> bool {
        self.unexported.load(Ordering::Acquire)
    }
}

/// Ensure `entry` carries a mapping to `export` (spec §4.6 `check_mapping`).
///
/// 1. A flagged-`UNEXPORT` export fails the whole operation with `Stale`.
/// 2. Fast path: a reader-locked walk of the export list (or the atomic
///    `first_export_id` hint) may already find it.
/// 3. Slow path: upgrade to a writer, re-check (a racer may have added it
///    first), take the export's own lock, re-check `UNEXPORT` once more,
///    then link.
pub fn check_mapping<S: SubProvider>(entry: &Entry<S>, export: &Export) -> CacheResult<()> {
    if export.is_unexported() {
        return Err(Status::new(Major::Stale));
    }

    {
        let list = entry.export_list.read().unwrap();
        if list.fast_path_hit(export.id) || list.contains(export.id) {
            return Ok(());
        }
    }

    let mut list = entry.export_list.write().unwrap();
    if list.contains(export.id) {
        return Ok(());
    }
    let _export_guard = export.lock.lock().unwrap();
    if export.is_unexported() {
        return Err(Status::new(Major::Stale));
    }
    list.add(export.id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AttrMask, Credentials, OpContext};
    use crate::key::Key;
    use crate::subprovider::{Attrs, NodeType};

    struct NullProvider;
    impl SubProvider for NullProvider {
        type Handle = ();
        fn lookup(&self, _: &OpContext, _: &(), _: &[u8]) -> CacheResult<((), Attrs)> {
            unimplemented!()
        }
        fn create(&self, _: &OpContext, _: &(), _: &[u8], _: u32) -> CacheResult<((), Attrs)> {
            unimplemented!()
        }
        fn mkdir(&self, _: &OpContext, _: &(), _: &[u8], _: u32) -> CacheResult<((), Attrs)> {
            unimplemented!()
        }
        fn mknode(&self, _: &OpContext, _: &(), _: &[u8], _: NodeType, _: u32) -> CacheResult<((), Attrs)> {
            unimplemented!()
        }
        fn symlink(&self, _: &OpContext, _: &(), _: &[u8], _: &[u8]) -> CacheResult<((), Attrs)> {
            unimplemented!()
        }
        fn readlink(&self, _: &OpContext, _: &()) -> CacheResult<Vec<u8>> {
            unimplemented!()
        }
        fn link(&self, _: &OpContext, _: &(), _: &(), _: &[u8]) -> CacheResult<()> {
            unimplemented!()
        }
        fn unlink(&self, _: &OpContext, _: &(), _: &[u8]) -> CacheResult<()> {
            unimplemented!()
        }
        fn rename(&self, _: &OpContext, _: &(), _: &[u8], _: &(), _: &[u8]) -> CacheResult<()> {
            unimplemented!()
        }
        fn readdir(
            &self,
            _: &OpContext,
            _: &(),
            _: crate::subprovider::WhencePtr<'_>,
            _: &mut dyn FnMut(crate::subprovider::RawDirent<()>) -> crate::subprovider::DirAction,
        ) -> CacheResult<()> {
            unimplemented!()
        }
        fn getattrs(&self, _: &OpContext, _: &(), _: AttrMask) -> CacheResult<Attrs> {
            unimplemented!()
        }
        fn setattrs(&self, _: &OpContext, _: &(), _: &Attrs) -> CacheResult<()> {
            unimplemented!()
        }
        fn setattr2(&self, _: &OpContext, _: &(), _: &Attrs, _: bool) -> CacheResult<()> {
            unimplemented!()
        }
        fn open(&self, _: &OpContext, _: &(), _: u32) -> CacheResult<()> {
            unimplemented!()
        }
        fn close(&self, _: &OpContext, _: &()) -> CacheResult<()> {
            unimplemented!()
        }
        fn read(&self, _: &OpContext, _: &(), _: u64, _: &mut [u8]) -> CacheResult<usize> {
            unimplemented!()
        }
        fn write(&self, _: &OpContext, _: &(), _: u64, _: &[u8]) -> CacheResult<usize> {
            unimplemented!()
        }
        fn commit(&self, _: &OpContext, _: &(), _: u64, _: u64) -> CacheResult<()> {
            unimplemented!()
        }
        fn lock_op(&self, _: &OpContext, _: &(), _: crate::subprovider::LockOp) -> CacheResult<()> {
            unimplemented!()
        }
        fn layoutget(&self, _: &OpContext, _: &()) -> CacheResult<Vec<u8>> {
            unimplemented!()
        }
        fn layoutreturn(&self, _: &OpContext, _: &()) -> CacheResult<()> {
            unimplemented!()
        }
        fn layoutcommit(&self, _: &OpContext, _: &()) -> CacheResult<()> {
            unimplemented!()
        }
        fn list_xattr(&self, _: &OpContext, _: &()) -> CacheResult<Vec<Vec<u8>>> {
            unimplemented!()
        }
        fn get_xattr(&self, _: &OpContext, _: &(), _: &[u8]) -> CacheResult<Vec<u8>> {
            unimplemented!()
        }
        fn set_xattr(&self, _: &OpContext, _: &(), _: &[u8], _: &[u8]) -> CacheResult<()> {
            unimplemented!()
        }
        fn remove_xattr(&self, _: &OpContext, _: &(), _: &[u8]) -> CacheResult<()> {
            unimplemented!()
        }
        fn handle_to_wire(&self, _: &()) -> Vec<u8> {
            unimplemented!()
        }
        fn handle_to_key(&self, _: &()) -> Vec<u8> {
            unimplemented!()
        }
        fn handle_cmp(&self, _: &(), _: &()) -> bool {
            unimplemented!()
        }
        fn handle_is(&self, _: &(), _: NodeType) -> bool {
            unimplemented!()
        }
        fn merge(&self, _: &OpContext, _: &(), _: &()) -> CacheResult<()> {
            unimplemented!()
        }
        fn release(&self, _: ()) {}
        fn lookup_path(&self, _: &OpContext, _: &[u8]) -> CacheResult<((), Attrs)> {
            unimplemented!()
        }
        fn create_handle(&self, _: &OpContext, _: &[u8]) -> CacheResult<()> {
            unimplemented!()
        }
        fn host_to_key(&self, _: &[u8]) -> Vec<u8> {
            unimplemented!()
        }
        fn fs_supported_attrs(&self, _: &OpContext) -> AttrMask {
            AttrMask::NONE
        }
        fn fs_supports(&self, _: crate::subprovider::Feature) -> bool {
            false
        }
    }

    fn entry() -> Entry<NullProvider> {
        let attrs = Attrs {
            node_type: NodeType::Regular,
            fsid: (0, 0),
            fileid: 1,
            size: 0,
            mtime_secs: 0,
            ctime_secs: 0,
            change: 0,
            owner: 0,
            group: 0,
            mode: 0,
            nlink: 1,
            opaque: Vec::new(),
        };
        Entry::new(Key::new(1, vec![1]), (), attrs, 60)
    }

    #[test]
    fn unexported_fails_fast() {
        let e = entry();
        let export = Export::new(ExportId(1));
        export.mark_unexported();
        let result = check_mapping(&e, &export);
        assert_eq!(result.unwrap_err().major, Major::Stale);
    }

    #[test]
    fn check_mapping_links_once() {
        let e = entry();
        let export = Export::new(ExportId(7));
        check_mapping(&e, &export).unwrap();
        assert!(e.export_list.read().unwrap().contains(ExportId(7)));
        // idempotent second call hits the fast path
        check_mapping(&e, &export).unwrap();
        assert_eq!(e.export_list.read().unwrap().exports.len(), 1);
    }

    #[test]
    fn credentials_are_just_data() {
        let c = Credentials { uid: 1, gid: 1 };
        assert_eq!(c, Credentials { uid: 1, gid: 1 });
    }
}
