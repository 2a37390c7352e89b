//! Scheduler and hash-table tuning knobs.
//!
//! `ScheduleConfig` and `HashTableConfig` are plain data: this crate
//! doesn't read a file or environment variable on its own, it just gives
//! an embedding application a `serde`-friendly shape to deserialize from
//! whatever configuration layer it already has.

use serde::{Deserialize, Serialize};

/// Tuning knobs for a [`crate::scheduler::Schedule`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// `0` means unlimited (spec Open Question, decided in DESIGN.md).
    pub max_descriptors: usize,
    /// How often the free-timeout-task pool is swept, in seconds.
    pub pool_gc_interval_secs: u64,
    /// Pool sweeps down to at most this many free slots once triggered.
    pub pool_gc_floor: usize,
    /// The pool is only swept when it holds more than this many free
    /// slots *and* more than `pool_gc_floor` relative to the live
    /// timeout-task count.
    pub pool_gc_threshold: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig {
            max_descriptors: 0,
            pool_gc_interval_secs: 3600,
            pool_gc_floor: 10,
            pool_gc_threshold: 10,
        }
    }
}

/// Tuning knobs for a [`crate::hash_table::HashTable`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HashTableConfig {
    pub auto_rehash: bool,
    /// Rehash up once `entry_count > buckets * grow_ratio` (spec §3/§4.B:
    /// `entry_count > 2 * bucket_count`, i.e. `grow_ratio == 2.0`).
    pub grow_ratio: f64,
    /// Rehash down once `entry_count < buckets * shrink_ratio` (spec §3/§4.B:
    /// `entry_count * 2 < bucket_count`, i.e. `shrink_ratio == 0.5`).
    pub shrink_ratio: f64,
}

impl Default for HashTableConfig {
    fn default() -> Self {
        HashTableConfig {
            auto_rehash: true,
            grow_ratio: 2.0,
            shrink_ratio: 0.5,
        }
    }
}
