//! Explicit per-operation context, passed by reference through every call
//! instead of the thread-local `op_ctx` the original source relies on (see
//! SPEC_FULL.md §9).

/// Opaque export identifier. Equality/ordering are by raw id only; the
/// cache never interprets what an id means beyond "two nodes reachable
/// through the same export id are reachable through the same export".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExportId(pub u16);

/// Credentials the front end resolved for the current caller. The cache
/// only ever compares these for the "owner may always pass" short-circuit
/// in `test_access` (spec §4.1); it never interprets ACLs itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

/// A bitmask of requested attributes, opaque to the cache beyond being
/// unioned and compared for "is the cached copy enough to answer this".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttrMask(pub u64);

impl AttrMask {
    pub const NONE: AttrMask = AttrMask(0);

    pub fn union(self, other: AttrMask) -> AttrMask {
        AttrMask(self.0 | other.0)
    }

    pub fn is_subset_of(self, other: AttrMask) -> bool {
        self.0 & !other.0 == 0
    }
}

/// Read-only per-operation context: the export the operation is running
/// under, the caller's credentials, and the attribute mask the front end
/// asked for. Replaces the original source's thread-local `op_ctx`.
#[derive(Debug, Clone, Copy)]
pub struct OpContext {
    pub export: ExportId,
    pub creds: Credentials,
    pub requested_mask: AttrMask,
}

impl OpContext {
    pub fn new(export: ExportId, creds: Credentials, requested_mask: AttrMask) -> Self {
        OpContext { export, creds, requested_mask }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_mask_union_and_subset() {
        let a = AttrMask(0b0011);
        let b = AttrMask(0b0100);
        let u = a.union(b);
        assert_eq!(u.0, 0b0111);
        assert!(a.is_subset_of(u));
        assert!(!u.is_subset_of(a));
    }
}
