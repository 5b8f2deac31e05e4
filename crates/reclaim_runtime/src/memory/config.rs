//! Garbage collection configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::{CpuRefreshKind, RefreshKind, System};

/// Garbage collection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Smallest batch handed to a trace worker
    pub min_objects_per_task: usize,
    /// Allow marking on more than one thread
    pub allow_parallel_gc: bool,
    /// Trace worker count (0 = one per logical CPU)
    pub worker_threads: usize,
    /// Missed lock attempts before `try_collect_garbage` blocks (0 = never)
    pub retries_before_forcing_gc: u32,
    /// Budget of a time-limited incremental purge step, in milliseconds
    pub incremental_purge_time_limit_ms: f64,
    /// Check cluster invariants before every collection
    pub verify_assumptions: bool,
    /// A reference to a cluster member also keeps the member's cluster alive.
    ///
    /// Off by default: an outside reference only flags the member. If nothing
    /// reaches the root, the cluster is dissolved at the end of marking, the
    /// referenced members survive as standalone objects and the rest are
    /// purged. That frees unused members early, at the cost of re-tracing the
    /// survivors and losing the cluster for later collections.
    ///
    /// When on, reaching any member claims the root and the whole cluster
    /// stays intact. Marking is cheaper, but one referenced member keeps
    /// every other member and everything the cluster references alive.
    pub member_reference_keeps_cluster: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            min_objects_per_task: 128,
            allow_parallel_gc: true,
            worker_threads: 0, // Auto
            retries_before_forcing_gc: 0,
            incremental_purge_time_limit_ms: 2.0,
            verify_assumptions: cfg!(debug_assertions),
            member_reference_keeps_cluster: false,
        }
    }
}

impl GcConfig {
    /// Configuration that never marks in parallel
    pub fn single_threaded() -> Self {
        Self {
            allow_parallel_gc: false,
            worker_threads: 1,
            ..Default::default()
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Override fields that are set in the environment
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var("RECLAIM_GC_MIN_OBJECTS_PER_TASK")
            && let Ok(count) = value.parse::<usize>()
        {
            self.min_objects_per_task = count.max(1);
        }

        if let Ok(value) = std::env::var("RECLAIM_GC_ALLOW_PARALLEL")
            && let Ok(allow) = value.parse::<bool>()
        {
            self.allow_parallel_gc = allow;
        }

        if let Ok(value) = std::env::var("RECLAIM_GC_WORKER_THREADS")
            && let Ok(threads) = value.parse::<usize>()
        {
            self.worker_threads = threads;
        }

        if let Ok(value) = std::env::var("RECLAIM_GC_RETRIES_BEFORE_FORCING")
            && let Ok(retries) = value.parse::<u32>()
        {
            self.retries_before_forcing_gc = retries;
        }

        if let Ok(value) = std::env::var("RECLAIM_GC_PURGE_TIME_LIMIT_MS")
            && let Ok(limit) = value.parse::<f64>()
            && limit >= 0.0
        {
            self.incremental_purge_time_limit_ms = limit;
        }

        if let Ok(value) = std::env::var("RECLAIM_GC_VERIFY")
            && let Ok(verify) = value.parse::<bool>()
        {
            self.verify_assumptions = verify;
        }

        if let Ok(value) = std::env::var("RECLAIM_GC_MEMBER_KEEPS_CLUSTER")
            && let Ok(keeps) = value.parse::<bool>()
        {
            self.member_reference_keeps_cluster = keeps;
        }
    }

    /// Number of trace workers to start, resolving 0 to the CPU count
    pub fn worker_count(&self) -> usize {
        if !self.allow_parallel_gc {
            return 1;
        }
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        let system =
            System::new_with_specifics(RefreshKind::new().with_cpu(CpuRefreshKind::everything()));
        system.cpus().len().max(1)
    }

    pub fn incremental_purge_time_limit(&self) -> Duration {
        Duration::from_secs_f64(self.incremental_purge_time_limit_ms.max(0.0) / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GcConfig::default();
        assert_eq!(config.min_objects_per_task, 128);
        assert!(config.allow_parallel_gc);
        assert_eq!(config.retries_before_forcing_gc, 0);
        assert!(!config.member_reference_keeps_cluster);
        assert_eq!(
            config.incremental_purge_time_limit(),
            Duration::from_millis(2)
        );
    }

    #[test]
    fn test_worker_count() {
        assert_eq!(GcConfig::single_threaded().worker_count(), 1);
        let fixed = GcConfig {
            worker_threads: 3,
            ..GcConfig::default()
        };
        assert_eq!(fixed.worker_count(), 3);
        assert!(GcConfig::default().worker_count() >= 1);
    }
}
