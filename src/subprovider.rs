//! The sub-provider contract (spec §6.2): the opaque file-system driver
//! behind the cache. This crate never implements one — front ends bring
//! their own FSAL-equivalent and the cache only ever calls through this
//! trait.

use crate::context::OpContext;
use crate::error::Status;

/// Object type, shared between the cache and the sub-provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Regular,
    Directory,
    Symlink,
    Block,
    Char,
    Fifo,
    Socket,
}

impl NodeType {
    pub fn is_dir(self) -> bool {
        matches!(self, NodeType::Directory)
    }
}

/// Attributes as returned by the sub-provider. Kept intentionally narrow —
/// the cache only ever inspects `node_type`, `mtime`, `owner`/`group`, and
/// `change`; everything else it stores opaquely for the front end.
#[derive(Debug, Clone)]
pub struct Attrs {
    pub node_type: NodeType,
    pub fsid: (u64, u64),
    pub fileid: u64,
    pub size: u64,
    pub mtime_secs: i64,
    pub ctime_secs: i64,
    pub change: u64,
    pub owner: u32,
    pub group: u32,
    pub mode: u32,
    pub nlink: u32,
    /// Opaque blob the front end requested beyond the fields above
    /// (xattrs, ACL handle id, ...). The cache never interprets it.
    pub opaque: Vec<u8>,
}

/// A feature flag the cache probes for via [`SubProvider::fs_supports`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    /// Rename mutates the underlying handle, so the cache must treat the
    /// moved node as unreachable under its old key (spec §4.1 `rename`,
    /// §9 "Rename-changes-key policy").
    RenameChangesKey,
    /// Readdir continuation is driven by the last returned *name* rather
    /// than a cookie (spec §4.5.2 step 2).
    WhenceIsName,
}

/// Disposition returned by the per-entry readdir callback (spec §4.1,
/// §4.5.2/.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirAction {
    Continue,
    Readahead,
    Terminate,
}

/// A single entry observed while streaming a sub-provider `readdir`.
pub struct RawDirent<H> {
    pub name: Vec<u8>,
    pub handle: H,
    pub attrs: Attrs,
    pub cookie: u64,
    pub eod: bool,
}

/// The sub-provider operation table (spec §6.2). `Handle` is the
/// sub-provider's opaque per-object reference; the cache only ever moves
/// it around and eventually calls [`SubProvider::release`] on it exactly
/// once (spec invariant 8).
pub trait SubProvider {
    type Handle: Send + Sync;

    // -- per-object operations -------------------------------------------------
    fn lookup(&self, ctx: &OpContext, parent: &Self::Handle, name: &[u8]) -> Result<(Self::Handle, Attrs), Status>;
    fn create(&self, ctx: &OpContext, parent: &Self::Handle, name: &[u8], mode: u32) -> Result<(Self::Handle, Attrs), Status>;
    fn mkdir(&self, ctx: &OpContext, parent: &Self::Handle, name: &[u8], mode: u32) -> Result<(Self::Handle, Attrs), Status>;
    fn mknode(&self, ctx: &OpContext, parent: &Self::Handle, name: &[u8], node_type: NodeType, mode: u32) -> Result<(Self::Handle, Attrs), Status>;
    fn symlink(&self, ctx: &OpContext, parent: &Self::Handle, name: &[u8], target: &[u8]) -> Result<(Self::Handle, Attrs), Status>;
    fn readlink(&self, ctx: &OpContext, handle: &Self::Handle) -> Result<Vec<u8>, Status>;
    fn link(&self, ctx: &OpContext, handle: &Self::Handle, dest_dir: &Self::Handle, name: &[u8]) -> Result<(), Status>;
    fn unlink(&self, ctx: &OpContext, parent: &Self::Handle, name: &[u8]) -> Result<(), Status>;
    fn rename(&self, ctx: &OpContext, old_dir: &Self::Handle, old_name: &[u8], new_dir: &Self::Handle, new_name: &[u8]) -> Result<(), Status>;

    /// Stream a directory's contents via `cb`, starting from `whence_ptr`
    /// (either a cookie or a name, per [`Feature::WhenceIsName`]). `cb`
    /// returns the disposition the sub-provider should honour next.
    fn readdir(
        &self,
        ctx: &OpContext,
        dir: &Self::Handle,
        whence: WhencePtr<'_>,
        cb: &mut dyn FnMut(RawDirent<Self::Handle>) -> DirAction,
    ) -> Result<(), Status>;

    fn getattrs(&self, ctx: &OpContext, handle: &Self::Handle, mask: crate::context::AttrMask) -> Result<Attrs, Status>;
    fn setattrs(&self, ctx: &OpContext, handle: &Self::Handle, attrs: &Attrs) -> Result<(), Status>;
    fn setattr2(&self, ctx: &OpContext, handle: &Self::Handle, attrs: &Attrs, bypass_acl: bool) -> Result<(), Status>;

    fn open(&self, ctx: &OpContext, handle: &Self::Handle, flags: u32) -> Result<(), Status>;
    fn close(&self, ctx: &OpContext, handle: &Self::Handle) -> Result<(), Status>;
    fn read(&self, ctx: &OpContext, handle: &Self::Handle, offset: u64, buf: &mut [u8]) -> Result<usize, Status>;
    fn write(&self, ctx: &OpContext, handle: &Self::Handle, offset: u64, buf: &[u8]) -> Result<usize, Status>;
    fn commit(&self, ctx: &OpContext, handle: &Self::Handle, offset: u64, len: u64) -> Result<(), Status>;

    fn lock_op(&self, ctx: &OpContext, handle: &Self::Handle, op: LockOp) -> Result<(), Status>;
    fn layoutget(&self, ctx: &OpContext, handle: &Self::Handle) -> Result<Vec<u8>, Status>;
    fn layoutreturn(&self, ctx: &OpContext, handle: &Self::Handle) -> Result<(), Status>;
    fn layoutcommit(&self, ctx: &OpContext, handle: &Self::Handle) -> Result<(), Status>;

    fn list_xattr(&self, ctx: &OpContext, handle: &Self::Handle) -> Result<Vec<Vec<u8>>, Status>;
    fn get_xattr(&self, ctx: &OpContext, handle: &Self::Handle, name: &[u8]) -> Result<Vec<u8>, Status>;
    fn set_xattr(&self, ctx: &OpContext, handle: &Self::Handle, name: &[u8], value: &[u8]) -> Result<(), Status>;
    fn remove_xattr(&self, ctx: &OpContext, handle: &Self::Handle, name: &[u8]) -> Result<(), Status>;

    fn handle_to_wire(&self, handle: &Self::Handle) -> Vec<u8>;
    fn handle_to_key(&self, handle: &Self::Handle) -> Vec<u8>;
    fn handle_cmp(&self, a: &Self::Handle, b: &Self::Handle) -> bool;
    fn handle_is(&self, handle: &Self::Handle, node_type: NodeType) -> bool;

    /// Reconcile a losing-race handle into the winning one (spec §4.2/§4.4
    /// "Merge"). Called with the handle that lost the publish race; the
    /// sub-provider folds any provider-internal state into `existing` and
    /// the cache releases `losing` immediately afterwards.
    fn merge(&self, ctx: &OpContext, existing: &Self::Handle, losing: &Self::Handle) -> Result<(), Status>;

    /// Release exactly once, per spec invariant 8.
    fn release(&self, handle: Self::Handle);

    // -- export operations ------------------------------------------------------
    fn lookup_path(&self, ctx: &OpContext, path: &[u8]) -> Result<(Self::Handle, Attrs), Status>;
    fn create_handle(&self, ctx: &OpContext, wire: &[u8]) -> Result<Self::Handle, Status>;
    fn host_to_key(&self, wire: &[u8]) -> Vec<u8>;
    fn fs_supported_attrs(&self, ctx: &OpContext) -> crate::context::AttrMask;
    fn fs_supports(&self, feature: Feature) -> bool;

    /// Compute the readdir cookie a fresh `(parent, name)` pair would have,
    /// without a full directory listing (spec §4.5.1). `0` means the
    /// sub-provider cannot do this (equivalent to `fs_supports` being false
    /// for this particular name, even if the provider generally can).
    fn compute_readdir_cookie(&self, ctx: &OpContext, parent: &Self::Handle, name: &[u8]) -> u64 {
        let _ = (ctx, parent, name);
        0
    }

    /// Whether `handle` is a junction (a mount point into another export);
    /// renames across junctions are rejected with `XDev` (spec §4.1
    /// `rename`, glossary "Junction").
    fn is_junction(&self, handle: &Self::Handle) -> bool {
        let _ = handle;
        false
    }
}

/// Starting point for a `readdir` continuation: either the sub-provider's
/// native cookie, or (when [`Feature::WhenceIsName`] holds) the last
/// cached name.
pub enum WhencePtr<'a> {
    Cookie(u64),
    Name(Option<&'a [u8]>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOp {
    Lock,
    Unlock,
    Test,
}
