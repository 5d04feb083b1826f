//! Background reclaimer thread (spec §4.3): periodically demotes idle
//! `active` nodes to `reusable`, then kills `reusable` nodes once the table
//! is over its high-water mark.
//!
//! Grounded on the teacher's `proxmox-rrd` cache journal-commit thread: a
//! `crossbeam_channel::tick` ticker racing a stop channel in `select!`,
//! joined on `Drop`.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use log::{debug, trace};

use crate::cache::Mdcache;
use crate::subprovider::SubProvider;

/// Owns the background reclaim thread; dropping it asks the thread to stop
/// and waits for it to exit.
pub struct Reclaimer {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Reclaimer {
    /// Spawn the reclaimer, running a pass every `interval`.
    pub fn spawn<S>(cache: Arc<Mdcache<S>>, interval: Duration) -> Self
    where
        S: SubProvider + Send + Sync + 'static,
        S::Handle: Send + Sync,
    {
        let (stop_tx, stop_rx): (Sender<()>, Receiver<()>) = bounded(0);
        let handle = std::thread::Builder::new()
            .name("mdcache-reclaim".into())
            .spawn(move || run(cache, interval, stop_rx))
            .expect("spawning the reclaim thread should not fail");
        Reclaimer { stop_tx, handle: Some(handle) }
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run<S>(cache: Arc<Mdcache<S>>, interval: Duration, stop_rx: Receiver<()>)
where
    S: SubProvider + Send + Sync + 'static,
    S::Handle: Send + Sync,
{
    let ticker = tick(interval);
    loop {
        select! {
            recv(ticker) -> _ => {
                let demoted = cache.reclaim_pass();
                let killed = cache.evict_pass();
                if demoted > 0 || killed > 0 {
                    debug!("reclaim pass: demoted {} node(s), killed {} node(s), {} live", demoted, killed, cache.len());
                } else {
                    trace!("reclaim pass: nothing to do, {} live", cache.len());
                }
            }
            recv(stop_rx) -> _ => {
                debug!("reclaim thread stopping");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::{AttrMask, Credentials, ExportId, OpContext};
    use crate::key::Key;
    use crate::subprovider::{Attrs, NodeType};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NullProvider {
        releases: AtomicU32,
    }

    impl SubProvider for NullProvider {
        type Handle = u32;
        fn lookup(&self, _: &OpContext, _: &u32, _: &[u8]) -> crate::error::CacheResult<(u32, Attrs)> {
            unimplemented!()
        }
        fn create(&self, _: &OpContext, _: &u32, _: &[u8], _: u32) -> crate::error::CacheResult<(u32, Attrs)> {
            unimplemented!()
        }
        fn mkdir(&self, _: &OpContext, _: &u32, _: &[u8], _: u32) -> crate::error::CacheResult<(u32, Attrs)> {
            unimplemented!()
        }
        fn mknode(&self, _: &OpContext, _: &u32, _: &[u8], _: NodeType, _: u32) -> crate::error::CacheResult<(u32, Attrs)> {
            unimplemented!()
        }
        fn symlink(&self, _: &OpContext, _: &u32, _: &[u8], _: &[u8]) -> crate::error::CacheResult<(u32, Attrs)> {
            unimplemented!()
        }
        fn readlink(&self, _: &OpContext, _: &u32) -> crate::error::CacheResult<Vec<u8>> {
            unimplemented!()
        }
        fn link(&self, _: &OpContext, _: &u32, _: &u32, _: &[u8]) -> crate::error::CacheResult<()> {
            unimplemented!()
        }
        fn unlink(&self, _: &OpContext, _: &u32, _: &[u8]) -> crate::error::CacheResult<()> {
            unimplemented!()
        }
        fn rename(&self, _: &OpContext, _: &u32, _: &[u8], _: &u32, _: &[u8]) -> crate::error::CacheResult<()> {
            unimplemented!()
        }
        fn readdir(
            &self,
            _: &OpContext,
            _: &u32,
            _: crate::subprovider::WhencePtr<'_>,
            _: &mut dyn FnMut(crate::subprovider::RawDirent<u32>) -> crate::subprovider::DirAction,
        ) -> crate::error::CacheResult<()> {
            unimplemented!()
        }
        fn getattrs(&self, _: &OpContext, _: &u32, _: AttrMask) -> crate::error::CacheResult<Attrs> {
            unimplemented!()
        }
        fn setattrs(&self, _: &OpContext, _: &u32, _: &Attrs) -> crate::error::CacheResult<()> {
            unimplemented!()
        }
        fn setattr2(&self, _: &OpContext, _: &u32, _: &Attrs, _: bool) -> crate::error::CacheResult<()> {
            unimplemented!()
        }
        fn open(&self, _: &OpContext, _: &u32, _: u32) -> crate::error::CacheResult<()> {
            unimplemented!()
        }
        fn close(&self, _: &OpContext, _: &u32) -> crate::error::CacheResult<()> {
            unimplemented!()
        }
        fn read(&self, _: &OpContext, _: &u32, _: u64, _: &mut [u8]) -> crate::error::CacheResult<usize> {
            unimplemented!()
        }
        fn write(&self, _: &OpContext, _: &u32, _: u64, _: &[u8]) -> crate::error::CacheResult<usize> {
            unimplemented!()
        }
        fn commit(&self, _: &OpContext, _: &u32, _: u64, _: u64) -> crate::error::CacheResult<()> {
            unimplemented!()
        }
        fn lock_op(&self, _: &OpContext, _: &u32, _: crate::subprovider::LockOp) -> crate::error::CacheResult<()> {
            unimplemented!()
        }
        fn layoutget(&self, _: &OpContext, _: &u32) -> crate::error::CacheResult<Vec<u8>> {
            unimplemented!()
        }
        fn layoutreturn(&self, _: &OpContext, _: &u32) -> crate::error::CacheResult<()> {
            unimplemented!()
        }
        fn layoutcommit(&self, _: &OpContext, _: &u32) -> crate::error::CacheResult<()> {
            unimplemented!()
        }
        fn list_xattr(&self, _: &OpContext, _: &u32) -> crate::error::CacheResult<Vec<Vec<u8>>> {
            unimplemented!()
        }
        fn get_xattr(&self, _: &OpContext, _: &u32, _: &[u8]) -> crate::error::CacheResult<Vec<u8>> {
            unimplemented!()
        }
        fn set_xattr(&self, _: &OpContext, _: &u32, _: &[u8], _: &[u8]) -> crate::error::CacheResult<()> {
            unimplemented!()
        }
        fn remove_xattr(&self, _: &OpContext, _: &u32, _: &[u8]) -> crate::error::CacheResult<()> {
            unimplemented!()
        }
        fn handle_to_wire(&self, h: &u32) -> Vec<u8> {
            h.to_le_bytes().to_vec()
        }
        fn handle_to_key(&self, h: &u32) -> Vec<u8> {
            h.to_le_bytes().to_vec()
        }
        fn handle_cmp(&self, a: &u32, b: &u32) -> bool {
            a == b
        }
        fn handle_is(&self, _: &u32, _: NodeType) -> bool {
            true
        }
        fn merge(&self, _: &OpContext, _: &u32, _: &u32) -> crate::error::CacheResult<()> {
            Ok(())
        }
        fn release(&self, _: u32) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
        fn lookup_path(&self, _: &OpContext, _: &[u8]) -> crate::error::CacheResult<(u32, Attrs)> {
            unimplemented!()
        }
        fn create_handle(&self, _: &OpContext, _: &[u8]) -> crate::error::CacheResult<u32> {
            unimplemented!()
        }
        fn host_to_key(&self, wire: &[u8]) -> Vec<u8> {
            wire.to_vec()
        }
        fn fs_supported_attrs(&self, _: &OpContext) -> AttrMask {
            AttrMask::NONE
        }
        fn fs_supports(&self, _: crate::subprovider::Feature) -> bool {
            false
        }
    }

    fn attrs() -> Attrs {
        Attrs {
            node_type: NodeType::Regular,
            fsid: (0, 0),
            fileid: 1,
            size: 0,
            mtime_secs: 0,
            ctime_secs: 0,
            change: 0,
            owner: 0,
            group: 0,
            mode: 0o644,
            nlink: 1,
            opaque: Vec::new(),
        }
    }

    #[test]
    fn reclaimer_runs_a_pass_and_shuts_down_cleanly() {
        let mut cfg = Config::scenario_seed();
        cfg.lru_high_water = 1;
        let cache = Arc::new(Mdcache::new(NullProvider { releases: AtomicU32::new(0) }, cfg));
        let ctx = OpContext::new(ExportId(1), Credentials { uid: 0, gid: 0 }, AttrMask::NONE);

        let a = cache.publish_or_merge(Key::new(1, b"a".to_vec()), 1, attrs(), &ctx).unwrap();
        let b = cache.publish_or_merge(Key::new(1, b"b".to_vec()), 2, attrs(), &ctx).unwrap();
        cache.put_ref(&a);
        cache.put_ref(&b);

        let reclaimer = Reclaimer::spawn(cache.clone(), Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(60));
        drop(reclaimer);

        assert!(cache.len() <= 1, "evict_pass should have killed nodes past the high-water mark, {} remain", cache.len());
    }
}
