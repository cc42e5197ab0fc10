//! Pool configuration and its operational bounds.

use serde::Deserialize;

pub const MIN_UNITS: u32 = 1;
pub const MAX_UNITS: u32 = 1000;
pub const MAX_UNIT_LIFETIME_SECS: u64 = 86400;
pub const MIN_DISPOSE_DELAY_SECS: u64 = 1;
pub const DEFAULT_HEAP_FLOOR_MB: u64 = 512;
pub const MAX_HEAP_LIMIT_MB: u64 = 8192;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum live execution units, clamped to [1, 1000].
    pub max_units: u32,
    /// Seconds a unit may live before it is retired; 0 disables expiry.
    pub unit_lifetime_secs: u64,
    /// Grace period between retiring a unit and tearing it down.
    pub dispose_delay_secs: u64,
    /// How long one acquisition may wait before failing.
    pub acquire_timeout_secs: u64,
    /// Consecutive acquire failures after which the process is
    /// considered wedged and the exit handler fires.
    pub fail_exit_threshold: u32,
    /// Minimum spacing between heap inspections of one unit.
    pub heap_check_interval_secs: u64,
    /// Heap size below which forced collections never trigger.
    pub heap_floor_mb: u64,
    /// Growth over the last baseline (percent) that triggers collection.
    pub heap_growth_pct: u32,
    /// Hard V8 heap ceiling; 0 derives the minimum from the floor.
    pub heap_limit_mb: u64,
    /// Dump a heap snapshot whenever a collection is forced.
    pub dev_mode: bool,
    /// Snapshot output directory; empty means the system temp dir.
    pub snapshot_dir: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_units: (num_cpus::get() as u32) * 2,
            unit_lifetime_secs: 3600,
            dispose_delay_secs: 5,
            acquire_timeout_secs: 5,
            fail_exit_threshold: 1000,
            heap_check_interval_secs: 5,
            heap_floor_mb: DEFAULT_HEAP_FLOOR_MB,
            heap_growth_pct: 120,
            heap_limit_mb: 0,
            dev_mode: false,
            snapshot_dir: String::new(),
        }
    }
}

impl PoolConfig {
    /// Clamp every field into its operational range. The heap limit is
    /// forced to at least 150% of the floor so a collection can always
    /// reclaim headroom before the ceiling is hit.
    pub fn normalized(mut self) -> Self {
        self.max_units = self.max_units.clamp(MIN_UNITS, MAX_UNITS);
        self.unit_lifetime_secs = self.unit_lifetime_secs.min(MAX_UNIT_LIFETIME_SECS);
        self.dispose_delay_secs = self.dispose_delay_secs.max(MIN_DISPOSE_DELAY_SECS);
        self.fail_exit_threshold = self.fail_exit_threshold.max(1);
        self.heap_check_interval_secs = self.heap_check_interval_secs.max(1);
        self.heap_floor_mb = self.heap_floor_mb.max(1);
        self.heap_growth_pct = self.heap_growth_pct.max(100);
        let min_limit = self.heap_floor_mb * 3 / 2;
        self.heap_limit_mb = self.heap_limit_mb.clamp(min_limit, MAX_HEAP_LIMIT_MB);
        self
    }
}
