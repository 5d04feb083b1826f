//! Cache tuning configuration (spec §6.3).

use serde::{Deserialize, Serialize};

/// Tuning knobs recognised by the cache. All durations are seconds; all
/// sizes are entry/dirent counts, not bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Size of each cached dirent chunk. 0 disables chunking entirely and
    /// falls back to full-population mode (§4.5.4).
    #[serde(default = "default_avl_chunk")]
    pub avl_chunk: u32,

    /// Split threshold: a chunk splits into two roughly-equal halves once it
    /// reaches this many entries. Must be `> avl_chunk`, or chunking
    /// degrades into permanent single-entry chunks.
    #[serde(default = "default_avl_chunk_split")]
    pub avl_chunk_split: u32,

    /// Cap on detached dirents kept per directory before the LRU one is
    /// evicted from `name_tree` as well.
    #[serde(default = "default_avl_detached_max")]
    pub avl_detached_max: u32,

    /// Cap on the total number of dirents cached per directory. Exceeding
    /// it on insert returns `Overflow`.
    #[serde(default = "default_avl_max")]
    pub avl_max: u32,

    /// If a full-population `readdir` pass (non-chunked mode) ends before
    /// EOD, return `Delay` so the caller retries instead of returning a
    /// partial directory.
    #[serde(default = "default_retry_readdir")]
    pub retry_readdir: bool,

    /// Default attribute validity window, used when the export does not
    /// supply one. Captured once per `Entry` at publish time (see
    /// SPEC_FULL.md §9, Open Question 3) and never re-read afterwards.
    #[serde(default = "default_expire_time_attr")]
    pub expire_time_attr_secs: u32,

    /// Number of shards in the node table's hash. Must be a power of two.
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,

    /// Soft cap on the number of live `Entry` objects before the reclaimer
    /// starts reusing `reusable`-queue entries aggressively.
    #[serde(default = "default_lru_high_water")]
    pub lru_high_water: usize,

    /// Soft cap on the number of cached directory chunks, independent of
    /// `lru_high_water` (spec §4.3: chunks have their own LRU).
    #[serde(default = "default_chunk_high_water")]
    pub chunk_high_water: usize,
}

fn default_avl_chunk() -> u32 {
    32
}
fn default_avl_chunk_split() -> u32 {
    48
}
fn default_avl_detached_max() -> u32 {
    8
}
fn default_avl_max() -> u32 {
    100_000
}
fn default_retry_readdir() -> bool {
    true
}
fn default_expire_time_attr() -> u32 {
    60
}
fn default_shard_count() -> u32 {
    64
}
fn default_lru_high_water() -> usize {
    100_000
}
fn default_chunk_high_water() -> usize {
    200_000
}

impl Default for Config {
    fn default() -> Self {
        Config {
            avl_chunk: default_avl_chunk(),
            avl_chunk_split: default_avl_chunk_split(),
            avl_detached_max: default_avl_detached_max(),
            avl_max: default_avl_max(),
            retry_readdir: default_retry_readdir(),
            expire_time_attr_secs: default_expire_time_attr(),
            shard_count: default_shard_count(),
            lru_high_water: default_lru_high_water(),
            chunk_high_water: default_chunk_high_water(),
        }
    }
}

impl Config {
    /// The configuration used by the §8 scenario seeds.
    pub fn scenario_seed() -> Self {
        Config {
            avl_chunk: 32,
            avl_chunk_split: 48,
            avl_detached_max: 8,
            avl_max: 100_000,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.avl_chunk > 0 && self.avl_chunk_split <= self.avl_chunk {
            anyhow::bail!(
                "avl_chunk_split ({}) must be greater than avl_chunk ({})",
                self.avl_chunk_split,
                self.avl_chunk
            );
        }
        if !self.shard_count.is_power_of_two() {
            anyhow::bail!("shard_count ({}) must be a power of two", self.shard_count);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn scenario_seed_matches_spec() {
        let cfg = Config::scenario_seed();
        assert_eq!(cfg.avl_chunk, 32);
        assert_eq!(cfg.avl_chunk_split, 48);
        assert_eq!(cfg.avl_detached_max, 8);
        assert_eq!(cfg.avl_max, 100_000);
    }

    #[test]
    fn rejects_bad_split_threshold() {
        let mut cfg = Config::default();
        cfg.avl_chunk_split = cfg.avl_chunk;
        assert!(cfg.validate().is_err());
    }
}
