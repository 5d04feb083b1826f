//! The operation surface (spec §4.1): thin adapters that take the right
//! locks, call the sub-provider, and update the caches. This is what a
//! front end actually calls; every other module in this crate exists to
//! support these functions.
//!
//! Every node-producing operation hands the caller a node already holding
//! one initial reference, per spec §4.1 — callers release it via
//! [`crate::cache::Mdcache::put_ref`].

use std::sync::{Arc, RwLockWriteGuard};
use std::time::{Duration, Instant};

use log::warn;

use crate::cache::Mdcache;
use crate::context::{AttrMask, OpContext};
use crate::directory::DirectoryContent;
use crate::entry::{flags, Entry};
use crate::error::{CacheResult, Major, Minor, Status};
use crate::key::Key;
use crate::readdir::{self, EntryCallback, FIRST_VALID_COOKIE};
use crate::subprovider::{Attrs, DirAction, Feature, NodeType, RawDirent, SubProvider, WhencePtr};

fn stale() -> Status {
    Status::with_minor(Major::Stale, Minor::AlreadyUnreachable)
}

// -- lookup -------------------------------------------------------------------

/// What a cache-only probe of a directory's content found (spec §4.1
/// `lookup`'s `try_get_cached`).
enum Probe<S: SubProvider> {
    Found(Arc<Entry<S>>),
    /// `TRUST_CONTENT | DIR_POPULATED` and no in-flight creation: a miss
    /// here really means "not found", no sub-provider call needed.
    Negative,
    Miss,
}

fn try_get_cached<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, parent: &Entry<S>, name: &[u8]) -> CacheResult<Probe<S>> {
    let ckey = {
        let guard = parent.content_lock.read().unwrap();
        let Some(dir) = guard.as_ref() else { return Ok(Probe::Miss) };
        match dir.find_by_name(name) {
            Some(id) => Some(dir.dirent(id).expect("name_tree entry must exist").ckey.clone()),
            None => {
                let trusted = parent.flags.test(flags::TRUST_CONTENT) && parent.flags.test(flags::DIR_POPULATED);
                if trusted && !dir.creating() {
                    return Ok(Probe::Negative);
                }
                return Ok(Probe::Miss);
            }
        }
    };
    let Some(ckey) = ckey else { return Ok(Probe::Miss) };
    match cache.find_keyed(&ckey, ctx)? {
        Some(entry) => Ok(Probe::Found(entry)),
        // the dirent's weak reference is stale; fall through to a real lookup
        None => Ok(Probe::Miss),
    }
}

fn lookup_uncached<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, parent: &Entry<S>, name: &[u8]) -> CacheResult<(Arc<Entry<S>>, Attrs)> {
    let (handle, attrs) = parent.with_handle(|h| cache.provider().lookup(ctx, h, name)).ok_or_else(stale)??;
    let child_key = Key::new(0, cache.provider().handle_to_key(&handle));
    let entry = cache.publish_or_merge(child_key.clone(), handle, attrs.clone(), ctx)?;

    if parent.is_directory() {
        let cookie = parent.with_handle(|h| cache.provider().compute_readdir_cookie(ctx, h, name)).unwrap_or(0);
        let mut guard = parent.content_lock.write().unwrap();
        if let Some(dir) = guard.as_mut() {
            dir.prune_tombstone(name);
            let (_placement, distrust) = dir.place_dirent(name.to_vec(), child_key, cookie, cache.config(), |_| None);
            if distrust {
                parent.flags.clear(flags::DIR_POPULATED | flags::TRUST_DIR_CHUNKS);
            }
        }
    }
    Ok((entry, attrs))
}

/// `lookup(parent, name) → (E, attrs?)` (spec §4.1). `attrs` is `None` when
/// the node was already cached (the caller should `getattrs` if it needs a
/// fresh snapshot); `Some` when this call just fetched it from the
/// sub-provider.
pub fn lookup<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, parent: &Entry<S>, name: &[u8]) -> CacheResult<(Arc<Entry<S>>, Option<Attrs>)> {
    if name == b"." {
        let entry = cache.peek(&parent.key).ok_or_else(stale)?;
        entry.take_ref();
        return Ok((entry, None));
    }
    if name == b".." {
        let parent_key = {
            let guard = parent.content_lock.read().unwrap();
            guard.as_ref().and_then(|d| d.parent_key.clone())
        };
        let parent_key = parent_key.ok_or_else(|| Status::new(Major::NoEnt))?;
        let entry = cache.find_keyed(&parent_key, ctx)?.ok_or_else(stale)?;
        return Ok((entry, None));
    }

    match try_get_cached(cache, ctx, parent, name)? {
        Probe::Found(entry) => return Ok((entry, None)),
        Probe::Negative => return Err(Status::new(Major::NoEnt)),
        Probe::Miss => {}
    }
    let (entry, attrs) = lookup_uncached(cache, ctx, parent, name)?;
    Ok((entry, Some(attrs)))
}

// -- create / mkdir / mknode / symlink -----------------------------------------

/// Marks a directory as having an in-flight creation for the duration of
/// the guard's lifetime, so a racing negative lookup doesn't trust a
/// `name_tree` miss while this creation might be about to add the name
/// (spec §3 `create_refcount`).
struct CreateGuard<'a, S: SubProvider> {
    parent: &'a Entry<S>,
}

impl<'a, S: SubProvider> Drop for CreateGuard<'a, S> {
    fn drop(&mut self) {
        if let Some(dir) = self.parent.content_lock.read().unwrap().as_ref() {
            dir.end_create();
        }
    }
}

fn begin_create<S: SubProvider>(parent: &Entry<S>) -> Option<CreateGuard<'_, S>> {
    if !parent.is_directory() {
        return None;
    }
    if let Some(dir) = parent.content_lock.read().unwrap().as_ref() {
        dir.begin_create();
    }
    Some(CreateGuard { parent })
}

fn finish_create<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, parent: &Entry<S>, name: &[u8], handle: S::Handle, attrs: Attrs) -> CacheResult<Arc<Entry<S>>> {
    let child_key = Key::new(0, cache.provider().handle_to_key(&handle));
    let entry = cache.publish_or_merge(child_key.clone(), handle, attrs, ctx)?;
    parent.flags.clear(flags::TRUST_ATTRS);
    if parent.is_directory() {
        let cookie = parent.with_handle(|h| cache.provider().compute_readdir_cookie(ctx, h, name)).unwrap_or(0);
        let mut guard = parent.content_lock.write().unwrap();
        if let Some(dir) = guard.as_mut() {
            dir.prune_tombstone(name);
            let (_placement, distrust) = dir.place_dirent(name.to_vec(), child_key, cookie, cache.config(), |_| None);
            if distrust {
                parent.flags.clear(flags::DIR_POPULATED | flags::TRUST_DIR_CHUNKS);
            }
        }
    }
    Ok(entry)
}

pub fn create<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, parent: &Entry<S>, name: &[u8], mode: u32) -> CacheResult<Arc<Entry<S>>> {
    let _guard = begin_create(parent);
    let (handle, attrs) = parent.with_handle(|h| cache.provider().create(ctx, h, name, mode)).ok_or_else(stale)??;
    finish_create(cache, ctx, parent, name, handle, attrs)
}

pub fn mkdir<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, parent: &Entry<S>, name: &[u8], mode: u32) -> CacheResult<Arc<Entry<S>>> {
    let _guard = begin_create(parent);
    let (handle, attrs) = parent.with_handle(|h| cache.provider().mkdir(ctx, h, name, mode)).ok_or_else(stale)??;
    finish_create(cache, ctx, parent, name, handle, attrs)
}

pub fn mknode<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, parent: &Entry<S>, name: &[u8], node_type: NodeType, mode: u32) -> CacheResult<Arc<Entry<S>>> {
    let _guard = begin_create(parent);
    let (handle, attrs) = parent.with_handle(|h| cache.provider().mknode(ctx, h, name, node_type, mode)).ok_or_else(stale)??;
    finish_create(cache, ctx, parent, name, handle, attrs)
}

pub fn symlink<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, parent: &Entry<S>, name: &[u8], target: &[u8]) -> CacheResult<Arc<Entry<S>>> {
    let _guard = begin_create(parent);
    let (handle, attrs) = parent.with_handle(|h| cache.provider().symlink(ctx, h, name, target)).ok_or_else(stale)??;
    finish_create(cache, ctx, parent, name, handle, attrs)
}

// -- unlink / link --------------------------------------------------------------

/// `unlink` (spec §4.1). On `NOTEMPTY` the directory's dirent cache is
/// still invalidated (a concurrent mutation on the sub-provider side may
/// have been what made it non-empty).
pub fn unlink<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, parent: &Entry<S>, name: &[u8]) -> CacheResult<()> {
    let result = parent.with_handle(|h| cache.provider().unlink(ctx, h, name)).ok_or_else(stale)?;

    if let Err(status) = result {
        if status.major == Major::NotEmpty {
            if let Some(dir) = parent.content_lock.write().unwrap().as_mut() {
                dir.invalidate_all();
            }
        }
        return Err(status);
    }

    parent.flags.clear(flags::TRUST_ATTRS);
    let child_key = {
        let mut guard = parent.content_lock.write().unwrap();
        guard.as_mut().and_then(|dir| {
            let ckey = dir.find_by_name(name).and_then(|id| dir.dirent(id)).map(|d| d.ckey.clone());
            dir.remove_active(name);
            ckey
        })
    };
    if let Some(ckey) = child_key {
        if let Some(child) = cache.peek(&ckey) {
            child.flags.clear(flags::TRUST_ATTRS);
            child.flags.set(flags::UNREACHABLE);
            if child.is_directory() {
                if let Some(dir) = child.content_lock.write().unwrap().as_mut() {
                    dir.parent_key = None;
                }
            }
        }
    }
    Ok(())
}

/// `link` (spec §4.1): add `entry` under `dest_dir` as `name`.
pub fn link<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, entry: &Entry<S>, dest_dir: &Entry<S>, name: &[u8]) -> CacheResult<()> {
    let result = entry.with_handle(|eh| dest_dir.with_handle(|dh| cache.provider().link(ctx, eh, dh, name)));
    match result {
        Some(Some(r)) => r?,
        _ => return Err(stale()),
    }

    entry.flags.clear(flags::TRUST_ATTRS);
    let cookie = dest_dir.with_handle(|h| cache.provider().compute_readdir_cookie(ctx, h, name)).unwrap_or(0);
    let mut guard = dest_dir.content_lock.write().unwrap();
    if let Some(dir) = guard.as_mut() {
        dir.prune_tombstone(name);
        let (_placement, distrust) = dir.place_dirent(name.to_vec(), entry.key.clone(), cookie, cache.config(), |_| None);
        if distrust {
            dest_dir.flags.clear(flags::DIR_POPULATED | flags::TRUST_DIR_CHUNKS);
        }
    }
    Ok(())
}

// -- rename ---------------------------------------------------------------------

fn lookup_active_child<S: SubProvider>(dir_entry: &Entry<S>, name: &[u8]) -> Option<Key> {
    let guard = dir_entry.content_lock.read().unwrap();
    let dir = guard.as_ref()?;
    let id = dir.find_by_name(name)?;
    dir.dirent(id).map(|d| d.ckey.clone())
}

/// Lock both directories' `content_lock` for write, ordered by address
/// (spec §5: "order by memory address; identical pointers acquire only
/// once"). Retries the second acquisition with a short backoff rather than
/// blocking, so a racer that locked them in the opposite order cannot
/// deadlock against us.
fn lock_dirs_for_write<'a, S: SubProvider>(
    old_dir: &'a Entry<S>,
    new_dir: &'a Entry<S>,
) -> (RwLockWriteGuard<'a, Option<DirectoryContent>>, Option<RwLockWriteGuard<'a, Option<DirectoryContent>>>) {
    if std::ptr::eq(old_dir, new_dir) {
        return (old_dir.content_lock.write().unwrap(), None);
    }
    let old_first = (old_dir as *const Entry<S> as usize) < (new_dir as *const Entry<S> as usize);
    loop {
        if old_first {
            let og = old_dir.content_lock.write().unwrap();
            match new_dir.content_lock.try_write() {
                Ok(ng) => return (og, Some(ng)),
                Err(_) => {
                    drop(og);
                    std::thread::sleep(Duration::from_micros(50));
                }
            }
        } else {
            let ng = new_dir.content_lock.write().unwrap();
            match old_dir.content_lock.try_write() {
                Ok(og) => return (og, Some(ng)),
                Err(_) => {
                    drop(ng);
                    std::thread::sleep(Duration::from_micros(50));
                }
            }
        }
    }
}

/// Same-directory rename (spec §4.1 `rename` step 5's "same directory,
/// non-chunked" and "otherwise" cases collapsed into one directory).
///
/// A `place_dirent` collision on the chunked path (Open Question
/// resolution #1, SPEC_FULL.md §9) returns `Exist`; the directory's
/// `TRUST_CONTENT` is always cleared in that case so the next lookup or
/// readdir repopulates instead of trusting a half-updated chunk.
fn rename_within_directory<S: SubProvider>(
    cache: &Mdcache<S>,
    ctx: &OpContext,
    dir_entry: &Entry<S>,
    dir: &mut DirectoryContent,
    old_name: &[u8],
    new_name: &[u8],
    changes_key: bool,
) -> CacheResult<()> {
    if changes_key {
        let moved = dir.find_by_name(old_name).and_then(|id| dir.dirent(id)).map(|d| d.ckey.clone());
        dir.remove_active(old_name);
        dir.remove_active(new_name);
        if let Some(key) = moved.and_then(|k| cache.peek(&k)) {
            key.flags.set(flags::UNREACHABLE);
        }
        return Ok(());
    }
    if cache.config().avl_chunk == 0 {
        dir.rename_in_place(old_name, new_name.to_vec());
        return Ok(());
    }
    // chunked: remove both dirents, re-add under the new name, then
    // invalidate the whole directory (SPEC_FULL.md §9 Open Question 2 —
    // whole-directory invalidation, not surgical per-chunk invalidation).
    let moved = dir.find_by_name(old_name).and_then(|id| dir.dirent(id)).map(|d| d.ckey.clone());
    dir.remove_active(old_name);
    dir.remove_active(new_name);
    let mut collided = false;
    if let Some(key) = moved {
        let cookie = dir_entry.with_handle(|h| cache.provider().compute_readdir_cookie(ctx, h, new_name)).unwrap_or(0);
        let (_placement, distrust) = dir.place_dirent(new_name.to_vec(), key, cookie, cache.config(), |_| None);
        collided = distrust;
    }
    dir.invalidate_all();
    if collided {
        dir_entry.flags.clear(flags::TRUST_CONTENT);
        return Err(Status::new(Major::Exist));
    }
    Ok(())
}

/// `rename(old_dir, old_name, new_dir, new_name)` (spec §4.1).
pub fn rename<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, old_dir: &Arc<Entry<S>>, old_name: &[u8], new_dir: &Arc<Entry<S>>, new_name: &[u8]) -> CacheResult<()> {
    let same_dir = Arc::ptr_eq(old_dir, new_dir);

    if let Some(target_key) = lookup_active_child(new_dir, new_name) {
        if let Some(target) = cache.peek(&target_key) {
            if let Some(source_key) = lookup_active_child(old_dir, old_name) {
                if source_key == target_key {
                    return Ok(());
                }
            }
            let is_junction = target.with_handle(|h| cache.provider().is_junction(h)).unwrap_or(false);
            if is_junction {
                return Err(Status::new(Major::XDev));
            }
        }
    }

    let result = old_dir.with_handle(|oh| new_dir.with_handle(|nh| cache.provider().rename(ctx, oh, old_name, nh, new_name)));
    match result {
        Some(Some(r)) => r?,
        _ => return Err(stale()),
    }

    old_dir.flags.clear(flags::TRUST_ATTRS);
    if !same_dir {
        new_dir.flags.clear(flags::TRUST_ATTRS);
    }

    let changes_key = cache.provider().fs_supports(Feature::RenameChangesKey);

    if same_dir {
        let mut guard = old_dir.content_lock.write().unwrap();
        let result = match guard.as_mut() {
            Some(dir) => rename_within_directory(cache, ctx, old_dir, dir, old_name, new_name, changes_key),
            None => Ok(()),
        };
        drop(guard);
        return result;
    }

    let (mut old_guard, new_guard) = lock_dirs_for_write(old_dir, new_dir);
    let mut new_guard = new_guard.expect("distinct directories always yield a second guard");

    let moved_key = old_guard.as_mut().and_then(|dir| {
        let ckey = dir.find_by_name(old_name).and_then(|id| dir.dirent(id)).map(|d| d.ckey.clone());
        dir.remove_active(old_name);
        ckey
    });

    let mut collided = false;
    if let Some(dir) = new_guard.as_mut() {
        dir.remove_active(new_name);
        if !changes_key {
            if let Some(key) = moved_key.clone() {
                let cookie = new_dir.with_handle(|h| cache.provider().compute_readdir_cookie(ctx, h, new_name)).unwrap_or(0);
                let (_placement, distrust) = dir.place_dirent(new_name.to_vec(), key, cookie, cache.config(), |_| None);
                if distrust {
                    new_dir.flags.clear(flags::DIR_POPULATED | flags::TRUST_DIR_CHUNKS);
                    collided = true;
                }
            }
        }
    }
    drop(old_guard);
    drop(new_guard);

    if collided {
        // place_dirent collision: Open Question resolution #1
        // (SPEC_FULL.md §9) — report `Exist` and stop trusting the target
        // directory's content until the next repopulation.
        new_dir.flags.clear(flags::TRUST_CONTENT);
        return Err(Status::new(Major::Exist));
    }

    match moved_key.and_then(|k| cache.peek(&k)) {
        Some(moved) if changes_key => moved.flags.set(flags::UNREACHABLE),
        Some(moved) if moved.is_directory() => {
            if let Some(dir) = moved.content_lock.write().unwrap().as_mut() {
                dir.parent_key = Some(new_dir.key.clone());
            }
        }
        _ => {}
    }
    Ok(())
}

// -- readdir ----------------------------------------------------------------------

fn reject_reserved_cookie(whence: u64) -> CacheResult<()> {
    if whence == 1 || whence == 2 {
        return Err(Status::new(Major::BadCookie));
    }
    Ok(())
}

fn readdir_uncached<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, dir_entry: &Entry<S>, whence: u64, cb: &mut EntryCallback<'_, S>) -> CacheResult<bool> {
    let whence_ptr = if cache.provider().fs_supports(Feature::WhenceIsName) {
        // Uncached mode tracks no prior-name state across calls; a caller
        // resuming mid-stream in this mode gets a fresh pass.
        WhencePtr::Name(None)
    } else {
        WhencePtr::Cookie(whence)
    };

    let mut eod_reached = false;
    let mut terminated = false;
    let ran = dir_entry.with_handle(|handle| {
        cache.provider().readdir(ctx, handle, whence_ptr, &mut |raw: RawDirent<S::Handle>| {
            if raw.eod {
                eod_reached = true;
            }
            let child_key = Key::new(0, cache.provider().handle_to_key(&raw.handle));
            let entry = match cache.publish_or_merge(child_key, raw.handle, raw.attrs.clone(), ctx) {
                Ok(e) => e,
                Err(status) => {
                    warn!("readdir_uncached: publish_or_merge failed: {}", status);
                    return DirAction::Terminate;
                }
            };
            let action = cb(&raw.name, entry.clone(), &raw.attrs, raw.cookie);
            cache.put_ref(&entry);
            if matches!(action, DirAction::Terminate) {
                terminated = true;
            }
            action
        })
    });
    ran.ok_or_else(stale)??;
    Ok(eod_reached && !terminated)
}

fn walk_full_population<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, dir: &DirectoryContent, whence: u64, cb: &mut EntryCallback<'_, S>) -> CacheResult<bool> {
    reject_reserved_cookie(whence)?;
    let start = whence.max(FIRST_VALID_COOKIE);
    let entries: Vec<(Vec<u8>, Key)> = dir.iter_by_name().filter_map(|(name, id)| dir.dirent(id).map(|d| (name.to_vec(), d.ckey.clone()))).collect();

    for (idx, (name, ckey)) in entries.into_iter().enumerate() {
        let this_cookie = FIRST_VALID_COOKIE + idx as u64;
        if this_cookie < start {
            continue;
        }
        let child = match cache.find_keyed(&ckey, ctx)? {
            Some(c) => c,
            None => continue,
        };
        let attrs = child.with_handle(|h| cache.provider().getattrs(ctx, h, ctx.requested_mask)).transpose()?;
        let action = match &attrs {
            Some(a) => cb(&name, child.clone(), a, this_cookie + 1),
            None => DirAction::Terminate,
        };
        cache.put_ref(&child);
        if matches!(action, DirAction::Terminate) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// `readdir(dir, whence, cb, mask)` dispatch (spec §4.1): bypass, chunked,
/// or full-population, picked by the directory's flags and `avl_chunk`.
pub fn readdir<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, dir_entry: &Entry<S>, whence: u64, cb: &mut EntryCallback<'_, S>) -> CacheResult<bool> {
    if dir_entry.flags.test(flags::BYPASS_DIRCACHE) {
        return readdir_uncached(cache, ctx, dir_entry, whence, cb);
    }
    if cache.config().avl_chunk > 0 {
        let mut guard = dir_entry.content_lock.write().unwrap();
        let dir = guard.as_mut().ok_or_else(|| Status::new(Major::NotDir))?;
        return readdir::chunked_readdir(cache, ctx, dir_entry, dir, whence, cb);
    }

    let overflowed = {
        let mut guard = dir_entry.content_lock.write().unwrap();
        let dir = guard.as_mut().ok_or_else(|| Status::new(Major::NotDir))?;
        if dir_entry.flags.test(flags::TRUST_CONTENT) {
            false
        } else {
            match readdir::full_population(cache, ctx, dir_entry, dir) {
                Ok(()) => {
                    dir_entry.flags.set(flags::TRUST_CONTENT | flags::DIR_POPULATED);
                    false
                }
                Err(status) if status.major == Major::Overflow => {
                    dir_entry.flags.set(flags::BYPASS_DIRCACHE);
                    dir.invalidate_all();
                    true
                }
                Err(status) => return Err(status),
            }
        }
    };
    if overflowed {
        return readdir_uncached(cache, ctx, dir_entry, whence, cb);
    }

    let guard = dir_entry.content_lock.read().unwrap();
    let dir = guard.as_ref().ok_or_else(|| Status::new(Major::NotDir))?;
    walk_full_population(cache, ctx, dir, whence, cb)
}

// -- attributes ---------------------------------------------------------------

fn refresh_attrs<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, entry: &Entry<S>, mask: AttrMask) -> CacheResult<Attrs> {
    let requested = mask.union(cache.provider().fs_supported_attrs(ctx));
    let fresh = entry.with_handle(|h| cache.provider().getattrs(ctx, h, requested)).ok_or_else(stale)??;

    let (old_mtime, is_dir) = {
        let mut state = entry.attr_lock.write().unwrap();
        if state.is_valid() && mask.is_subset_of(state.request_mask) {
            return Ok(state.attrs.clone());
        }
        let old_mtime = state.attrs.mtime_secs;
        let is_dir = fresh.node_type.is_dir();
        state.attrs = fresh.clone();
        state.request_mask = requested;
        state.last_refresh = Instant::now();
        state.acl = None;
        (old_mtime, is_dir)
    };
    entry.flags.set(flags::TRUST_ATTRS);

    if is_dir && fresh.mtime_secs > old_mtime {
        if let Some(dir) = entry.content_lock.write().unwrap().as_mut() {
            dir.invalidate_all();
        }
        entry.flags.clear(flags::TRUST_DIR_CHUNKS | flags::DIR_POPULATED);
    }
    Ok(fresh)
}

/// `getattrs` (spec §4.1): reader-locked validity check, refresh on miss.
pub fn getattrs<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, entry: &Entry<S>, mask: AttrMask) -> CacheResult<Attrs> {
    {
        let state = entry.attr_lock.read().unwrap();
        if state.is_valid() && mask.is_subset_of(state.request_mask) {
            return Ok(state.attrs.clone());
        }
    }
    refresh_attrs(cache, ctx, entry, mask)
}

/// `setattrs` (spec §4.1): bumps `change` by one if the sub-provider left
/// it untouched.
pub fn setattrs<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, entry: &Entry<S>, attrs: &Attrs) -> CacheResult<()> {
    entry.with_handle(|h| cache.provider().setattrs(ctx, h, attrs)).ok_or_else(stale)??;
    let mut state = entry.attr_lock.write().unwrap();
    let old_change = state.attrs.change;
    state.attrs = attrs.clone();
    if state.attrs.change == old_change {
        state.attrs.change = old_change.wrapping_add(1);
    }
    state.last_refresh = Instant::now();
    Ok(())
}

pub fn setattr2<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, entry: &Entry<S>, attrs: &Attrs, bypass_acl: bool) -> CacheResult<()> {
    entry.with_handle(|h| cache.provider().setattr2(ctx, h, attrs, bypass_acl)).ok_or_else(stale)??;
    let mut state = entry.attr_lock.write().unwrap();
    state.attrs = attrs.clone();
    state.last_refresh = Instant::now();
    Ok(())
}

/// `readlink` (spec §4.1). The cache has no storage for the target itself
/// (the data model keeps no symlink-specific field beyond the flag), so
/// `TRUST_CONTENT` here records only that the target was confirmed stable
/// by the last fetch.
pub fn readlink<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, entry: &Entry<S>) -> CacheResult<Vec<u8>> {
    let target = entry.with_handle(|h| cache.provider().readlink(ctx, h)).ok_or_else(stale)??;
    entry.flags.set(flags::TRUST_CONTENT);
    Ok(target)
}

/// `test_access` (spec §4.1): owner always passes; otherwise a plain POSIX
/// mode check against cached attrs (`requested` is an `rwx` bitmask, `0o4`
/// read / `0o2` write / `0o1` execute).
pub fn test_access<S: SubProvider>(entry: &Entry<S>, uid: u32, gid: u32, requested: u32) -> CacheResult<()> {
    let state = entry.attr_lock.read().unwrap();
    if uid == 0 || uid == state.attrs.owner {
        return Ok(());
    }
    let mode = state.attrs.mode;
    let bits = if gid == state.attrs.group { (mode >> 3) & 0o7 } else { mode & 0o7 };
    if requested & !bits == 0 {
        Ok(())
    } else {
        Err(Status::new(Major::Access))
    }
}

// -- forwarded I/O ----------------------------------------------------------------

pub fn open<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, entry: &Entry<S>, open_flags: u32) -> CacheResult<()> {
    entry.with_handle(|h| cache.provider().open(ctx, h, open_flags)).ok_or_else(stale)??;
    Ok(())
}

pub fn close<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, entry: &Entry<S>) -> CacheResult<()> {
    entry.with_handle(|h| cache.provider().close(ctx, h)).ok_or_else(stale)??;
    Ok(())
}

pub fn read<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, entry: &Entry<S>, offset: u64, buf: &mut [u8]) -> CacheResult<usize> {
    entry.with_handle(|h| cache.provider().read(ctx, h, offset, buf)).ok_or_else(stale)?
}

pub fn write<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, entry: &Entry<S>, offset: u64, buf: &[u8]) -> CacheResult<usize> {
    let n = entry.with_handle(|h| cache.provider().write(ctx, h, offset, buf)).ok_or_else(stale)??;
    entry.flags.clear(flags::TRUST_ATTRS);
    Ok(n)
}

pub fn commit<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, entry: &Entry<S>, offset: u64, len: u64) -> CacheResult<()> {
    entry.with_handle(|h| cache.provider().commit(ctx, h, offset, len)).ok_or_else(stale)??;
    entry.flags.clear(flags::TRUST_ATTRS);
    Ok(())
}

pub fn lock_op<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, entry: &Entry<S>, op: crate::subprovider::LockOp) -> CacheResult<()> {
    entry.with_handle(|h| cache.provider().lock_op(ctx, h, op)).ok_or_else(stale)??;
    Ok(())
}

pub fn layoutget<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, entry: &Entry<S>) -> CacheResult<Vec<u8>> {
    entry.with_handle(|h| cache.provider().layoutget(ctx, h)).ok_or_else(stale)?
}

pub fn layoutreturn<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, entry: &Entry<S>) -> CacheResult<()> {
    entry.with_handle(|h| cache.provider().layoutreturn(ctx, h)).ok_or_else(stale)??;
    Ok(())
}

pub fn layoutcommit<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, entry: &Entry<S>) -> CacheResult<()> {
    entry.with_handle(|h| cache.provider().layoutcommit(ctx, h)).ok_or_else(stale)??;
    entry.flags.clear(flags::TRUST_ATTRS);
    Ok(())
}

pub fn list_xattr<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, entry: &Entry<S>) -> CacheResult<Vec<Vec<u8>>> {
    entry.with_handle(|h| cache.provider().list_xattr(ctx, h)).ok_or_else(stale)?
}

pub fn get_xattr<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, entry: &Entry<S>, name: &[u8]) -> CacheResult<Vec<u8>> {
    entry.with_handle(|h| cache.provider().get_xattr(ctx, h, name)).ok_or_else(stale)?
}

pub fn set_xattr<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, entry: &Entry<S>, name: &[u8], value: &[u8]) -> CacheResult<()> {
    entry.with_handle(|h| cache.provider().set_xattr(ctx, h, name, value)).ok_or_else(stale)??;
    entry.flags.clear(flags::TRUST_ATTRS);
    Ok(())
}

pub fn remove_xattr<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, entry: &Entry<S>, name: &[u8]) -> CacheResult<()> {
    entry.with_handle(|h| cache.provider().remove_xattr(ctx, h, name)).ok_or_else(stale)??;
    entry.flags.clear(flags::TRUST_ATTRS);
    Ok(())
}
