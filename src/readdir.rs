//! Directory listing orchestration: chunk population (spec §4.5.2),
//! chunked readdir consumption (§4.5.3), full population (§4.5.4), and the
//! uncached passthrough mode.
//!
//! This sits above [`crate::directory`] (which only manipulates the
//! per-directory trees/arena) and below [`crate::ops`] (which picks which
//! of these three modes applies and takes/releases `content_lock`).

use std::sync::Arc;

use log::warn;

use crate::cache::Mdcache;
use crate::context::OpContext;
use crate::directory::{DirectoryContent, PopulateOutcome};
use crate::entry::{flags, Entry};
use crate::error::{CacheResult, Major, Minor, Status};
use crate::key::Key;
use crate::subprovider::{Attrs, DirAction, RawDirent, SubProvider, WhencePtr};

/// Cookies `1` and `2` are reserved for `.` and `..` (spec glossary
/// "Cookie"); the first real dirent starts at `3`.
pub const FIRST_VALID_COOKIE: u64 = 3;

/// What the caller's per-entry callback decided, translated back into a
/// sub-provider [`DirAction`] when we're mid-stream.
pub type EntryCallback<'a, S> = dyn FnMut(&[u8], Arc<Entry<S>>, &Attrs, u64) -> DirAction + 'a;

fn reject_reserved_cookie(whence: u64) -> CacheResult<()> {
    if whence == 1 || whence == 2 {
        return Err(Status::new(Major::BadCookie));
    }
    Ok(())
}

/// Find-or-create the child node for one streamed dirent, and place it
/// into the directory's chunk engine (spec §4.5.2 steps 2-3).
fn absorb_raw_dirent<S: SubProvider>(
    cache: &Mdcache<S>,
    ctx: &OpContext,
    dir: &mut DirectoryContent,
    raw: RawDirent<S::Handle>,
    chunk_id: crate::dirent::ChunkId,
    avl_max: u32,
) -> CacheResult<Option<(Arc<Entry<S>>, u64, bool)>> {
    let child_key = Key::new(0, cache.provider().handle_to_key(&raw.handle));
    let attrs = raw.attrs.clone();
    let entry = cache.publish_or_merge(child_key.clone(), raw.handle, attrs, ctx)?;

    if dir.active_len() as u32 >= avl_max && dir.find_by_name(&raw.name).is_none() {
        cache.put_ref(&entry);
        return Err(Status::new(Major::Overflow));
    }

    let outcome = dir.append_during_population(chunk_id, raw.name.clone(), child_key, raw.cookie);
    match outcome {
        PopulateOutcome::Fresh(id) | PopulateOutcome::Existing(id) => {
            if raw.eod {
                dir.mark_eod(id);
            }
            Ok(Some((entry, raw.cookie, raw.eod)))
        }
        PopulateOutcome::CollidedWithOtherChunk { cookie, .. } => {
            warn!("readdir population: {:?} collided with an already-cached chunk", String::from_utf8_lossy(&raw.name));
            dir.link_prev_next_ck(chunk_id, cookie);
            Ok(None)
        }
    }
}

/// Population pass (spec §4.5.2): stream the sub-provider's `readdir`
/// starting after `prev_chunk`, filling a freshly allocated chunk. Returns
/// the populated chunk id (if anything was committed) and whether EOD was
/// reached.
pub fn populate_chunk<S: SubProvider>(
    cache: &Mdcache<S>,
    ctx: &OpContext,
    dir_entry: &Entry<S>,
    dir: &mut DirectoryContent,
    prev_chunk: Option<crate::dirent::ChunkId>,
    whence_name: Option<Vec<u8>>,
    whence_cookie: u64,
) -> CacheResult<(Option<crate::dirent::ChunkId>, bool)> {
    let chunk_id = dir.alloc_chunk(prev_chunk);
    let avl_max = cache.config().avl_max;
    let avl_chunk = cache.config().avl_chunk;

    let whence = if cache.provider().fs_supports(crate::subprovider::Feature::WhenceIsName) {
        WhencePtr::Name(whence_name.as_deref())
    } else {
        WhencePtr::Cookie(whence_cookie)
    };

    let mut eod_reached = false;
    let mut appended = 0u32;
    let mut collided = false;

    let ran = dir_entry.with_handle(|handle| {
        cache.provider().readdir(ctx, handle, whence, &mut |raw: RawDirent<S::Handle>| {
            if raw.eod {
                eod_reached = true;
            }
            match absorb_raw_dirent(cache, ctx, dir, raw, chunk_id, avl_max) {
                Ok(Some(_)) => {
                    appended += 1;
                    if appended >= avl_chunk {
                        DirAction::Readahead
                    } else {
                        DirAction::Continue
                    }
                }
                Ok(None) => {
                    collided = true;
                    DirAction::Terminate
                }
                Err(_) => DirAction::Terminate,
            }
        })
    });
    ran.ok_or_else(|| Status::with_minor(Major::Stale, Minor::AlreadyUnreachable))??;

    if appended == 0 && !collided {
        dir.discard_chunk(chunk_id);
        return Ok((None, eod_reached));
    }
    if collided && appended == 0 {
        dir.discard_chunk(chunk_id);
        return Ok((None, eod_reached));
    }
    Ok((Some(chunk_id), eod_reached))
}

/// Full single-pass population for non-chunked directories (spec §4.5.4).
/// Adds every streamed entry straight into `name_tree` as detached dirents
/// (there is no chunk engine when `avl_chunk == 0`). Returns `Overflow` or
/// `Delay` per the spec's early-exit rules.
pub fn full_population<S: SubProvider>(cache: &Mdcache<S>, ctx: &OpContext, dir_entry: &Entry<S>, dir: &mut DirectoryContent) -> CacheResult<()> {
    let avl_max = cache.config().avl_max;
    let avl_detached_max = cache.config().avl_detached_max;

    let mut eod_reached = false;
    let mut overflowed = false;

    let ran = dir_entry.with_handle(|handle| {
        cache.provider().readdir(ctx, handle, WhencePtr::Cookie(0), &mut |raw: RawDirent<S::Handle>| {
            if raw.eod {
                eod_reached = true;
            }
            if dir.active_len() as u32 >= avl_max {
                overflowed = true;
                return DirAction::Terminate;
            }
            let child_key = Key::new(0, cache.provider().handle_to_key(&raw.handle));
            match cache.publish_or_merge(child_key.clone(), raw.handle, raw.attrs, ctx) {
                Ok(entry) => {
                    cache.put_ref(&entry);
                    dir.insert_detached(raw.name, child_key, avl_detached_max);
                    DirAction::Continue
                }
                Err(_) => DirAction::Terminate,
            }
        })
    });
    ran.ok_or_else(|| Status::with_minor(Major::Stale, Minor::AlreadyUnreachable))??;

    if overflowed {
        return Err(Status::new(Major::Overflow));
    }
    if !eod_reached && cache.config().retry_readdir {
        return Err(Status::with_minor(Major::Delay, Minor::PartialReaddir));
    }
    Ok(())
}

/// Find the chunk to populate after: walk the `next_ck` chain from the
/// first resident chunk forward, stopping at the last chunk whose
/// `next_ck` doesn't already reach `look_ck` (i.e. the chunk after which
/// the cache actually has a gap).
fn find_prev_chunk(dir: &DirectoryContent, look_ck: u64) -> Option<crate::dirent::ChunkId> {
    let mut current = dir.cookie_ceiling(0).and_then(|id| dir.dirent(id)).and_then(|d| d.chunk);
    loop {
        let Some(cid) = current else { return None };
        let next_ck = match dir.chunk(cid) {
            Some(c) => c.next_ck,
            None => return Some(cid),
        };
        if next_ck == 0 || next_ck > look_ck {
            return Some(cid);
        }
        match dir.find_by_cookie(next_ck).and_then(|id| dir.dirent(id)).and_then(|d| d.chunk) {
            Some(next) if next != cid => current = Some(next),
            _ => return Some(cid),
        }
    }
}

/// Chunked readdir consumption (spec §4.5.3). `whence == 0` resumes from
/// the directory's `first_cookie`. Each resolved dirent is handed to `cb`
/// along with the next cookie to resume from.
pub fn chunked_readdir<S: SubProvider>(
    cache: &Mdcache<S>,
    ctx: &OpContext,
    dir_entry: &Entry<S>,
    dir: &mut DirectoryContent,
    whence: u64,
    cb: &mut EntryCallback<'_, S>,
) -> CacheResult<bool> {
    reject_reserved_cookie(whence)?;
    let mut look_ck = if whence == 0 { dir.first_cookie } else { whence };
    let mut establishing_first_cookie = whence == 0;
    let mark_populated_if_done = |eod_met: bool| {
        if whence == 0 && eod_met {
            dir_entry.flags.set(flags::DIR_POPULATED);
        }
    };

    loop {
        if dir.find_by_cookie(look_ck).is_none() && !(look_ck == 0 && dir.first_cookie == 0 && dir.active_len() == 0) {
            let prev_chunk = find_prev_chunk(dir, look_ck);
            let (_new_chunk, eod) = populate_chunk(cache, ctx, dir_entry, dir, prev_chunk, None, look_ck)?;
            if establishing_first_cookie {
                if let Some(id) = dir.cookie_ceiling(FIRST_VALID_COOKIE) {
                    if let Some(d) = dir.dirent(id) {
                        dir.first_cookie = d.ck;
                        look_ck = d.ck;
                    }
                }
                establishing_first_cookie = false;
            }
            if dir.find_by_cookie(look_ck).is_none() {
                mark_populated_if_done(eod);
                return Ok(eod);
            }
        }

        let mut cursor = dir.find_by_cookie(look_ck);
        let mut eod_met = false;
        let mut last_ck = look_ck;
        let mut resume_ck = 0u64;

        while let Some(id) = cursor {
            let (name, ckey, ck, is_deleted, is_eod, chunk_of) = {
                let d = dir.dirent(id).expect("cursor must reference a live dirent");
                (d.name.clone(), d.ckey.clone(), d.ck, d.is_deleted(), d.eod, d.chunk)
            };
            last_ck = ck;

            if ck == whence && whence != 0 {
                cursor = dir.cookie_ceiling(ck + 1);
                continue;
            }
            if is_deleted {
                cursor = dir.cookie_ceiling(ck + 1);
                continue;
            }

            let child = match cache.find_keyed(&ckey, ctx)? {
                Some(c) => c,
                None => {
                    let looked_up = dir_entry
                        .with_handle(|parent_handle| cache.provider().lookup(ctx, parent_handle, &name))
                        .ok_or_else(|| Status::with_minor(Major::Stale, Minor::AlreadyUnreachable))??;
                    let (handle, attrs) = looked_up;
                    let key = Key::new(0, cache.provider().handle_to_key(&handle));
                    cache.publish_or_merge(key, handle, attrs, ctx)?
                }
            };

            let attrs = child.with_handle(|h| cache.provider().getattrs(ctx, h, ctx.requested_mask)).transpose()?;
            let next_ck = dir.cookie_ceiling(ck + 1).and_then(|nid| dir.dirent(nid)).map(|d| d.ck).unwrap_or(0);

            let action = match attrs {
                Some(a) => cb(&name, child.clone(), &a, if next_ck == 0 { ck } else { next_ck }),
                None => DirAction::Terminate,
            };
            cache.put_ref(&child);

            if is_eod {
                eod_met = true;
            }

            match action {
                DirAction::Terminate => {
                    mark_populated_if_done(eod_met);
                    return Ok(eod_met);
                }
                _ => {
                    cursor = dir.cookie_ceiling(ck + 1);
                    if cursor.is_none() {
                        let chunk_next_ck = chunk_of.and_then(|cid| dir.chunk(cid)).map(|c| c.next_ck).unwrap_or(0);
                        resume_ck = if chunk_next_ck != 0 { chunk_next_ck } else { ck + 1 };
                    }
                }
            }
        }

        if eod_met || cursor.is_some() {
            mark_populated_if_done(eod_met);
            return Ok(eod_met);
        }
        // Ran off the resident chunk chain without reaching eod: repopulate,
        // resuming right after the last dirent we actually saw.
        look_ck = if resume_ck != 0 { resume_ck } else { last_ck + 1 };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_cookies_rejected() {
        assert_eq!(reject_reserved_cookie(1).unwrap_err().major, Major::BadCookie);
        assert_eq!(reject_reserved_cookie(2).unwrap_err().major, Major::BadCookie);
        assert!(reject_reserved_cookie(3).is_ok());
        assert!(reject_reserved_cookie(0).is_ok());
    }
}
