//! Directory entries and chunks (spec §3 `Dirent`, `Chunk`).

use bitflags::bitflags;

use crate::key::Key;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DirentId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(pub usize);

bitflags! {
    #[derive(Default)]
    pub struct DirentFlags: u8 {
        const DELETED = 1 << 0;
        const SORTED = 1 << 1;
    }
}

/// A cached directory entry: `(name, child-key, cookie)` triple.
pub struct Dirent {
    pub name: Vec<u8>,
    /// Weak reference to the child: looked up by key, never owned (spec §9
    /// "Weak dirent references").
    pub ckey: Key,
    /// Sub-provider cookie; 0 = unknown/unsupported.
    pub ck: u64,
    pub flags: DirentFlags,
    pub chunk: Option<ChunkId>,
    pub eod: bool,
}

impl Dirent {
    pub fn new(name: Vec<u8>, ckey: Key) -> Self {
        Dirent { name, ckey, ck: 0, flags: DirentFlags::empty(), chunk: None, eod: false }
    }

    pub fn is_detached(&self) -> bool {
        self.chunk.is_none()
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.contains(DirentFlags::DELETED)
    }
}

/// A fixed-capacity ordered group of dirents forming a contiguous cookie
/// range.
pub struct Chunk {
    pub dirents: Vec<DirentId>,
    pub prev_chunk: Option<ChunkId>,
    /// Cookie of the first dirent of the next chunk, 0 if unknown.
    pub next_ck: u64,
}

impl Chunk {
    pub fn new(prev_chunk: Option<ChunkId>) -> Self {
        Chunk { dirents: Vec::new(), prev_chunk, next_ck: 0 }
    }

    pub fn num_entries(&self) -> usize {
        self.dirents.len()
    }

    pub fn first_cookie(&self, arena: &[Option<Dirent>]) -> Option<u64> {
        self.dirents.first().and_then(|id| arena[id.0].as_ref()).map(|d| d.ck)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirent_flags_roundtrip() {
        let mut f = DirentFlags::empty();
        assert!(!f.contains(DirentFlags::DELETED));
        f.set(DirentFlags::DELETED, true);
        assert!(f.contains(DirentFlags::DELETED));
        f.set(DirentFlags::DELETED, false);
        assert!(!f.contains(DirentFlags::DELETED));
    }
}
