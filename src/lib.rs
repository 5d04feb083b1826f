//! A metadata cache sitting between a network file-serving front end
//! (NFSv3/v4, 9P, ...) and a pluggable sub-provider file system, modeled on
//! NFS-Ganesha's `FSAL_MDCACHE`.
//!
//! The cache owns node identity, attribute/content freshness, directory
//! listings, and export reachability; it never touches the wire protocol or
//! the storage backend directly — both of those are the front end's and the
//! [`subprovider::SubProvider`] implementation's job respectively.
//!
//! Start at [`ops`] for the operation surface a front end actually calls;
//! [`cache::Mdcache`] is the top-level handle tying node storage, the LRU
//! queues, and export mapping together.

pub mod arena;
pub mod cache;
pub mod config;
pub mod context;
pub mod directory;
pub mod dirent;
pub mod entry;
pub mod error;
pub mod export;
pub mod key;
pub mod lru;
pub mod ops;
pub mod readdir;
pub mod reclaim;
pub mod spin;
pub mod subprovider;

pub use cache::Mdcache;
pub use config::Config;
pub use context::OpContext;
pub use error::{CacheResult, Major, Minor, Status};
pub use subprovider::SubProvider;
