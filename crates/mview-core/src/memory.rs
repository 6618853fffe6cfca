//! Cooperative memory-pressure guard.
//!
//! The guard samples the process resident set size and compares it with a
//! configured limit. It is consulted between chunks only, so one oversized
//! chunk can still overshoot the limit.

use std::sync::Mutex;

use sysinfo::{Pid, ProcessesToUpdate, System};

/// Default share of the limit at which the guard trips.
pub const DEFAULT_THRESHOLD_PERCENT: u8 = 90;

/// Source of the current memory usage in bytes.
pub trait MemorySampler: Send + Sync {
    /// Current usage, or `None` if it cannot be sampled.
    fn resident_bytes(&self) -> Option<u64>;
}

impl<F> MemorySampler for F
where
    F: Fn() -> Option<u64> + Send + Sync,
{
    fn resident_bytes(&self) -> Option<u64> {
        self()
    }
}

/// Resident set size of the current process, read through `sysinfo`.
pub struct ProcessMemory {
    system: Mutex<System>,
    pid: Pid,
}

impl Default for ProcessMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessMemory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: Pid::from_u32(std::process::id()),
        }
    }
}

impl MemorySampler for ProcessMemory {
    fn resident_bytes(&self) -> Option<u64> {
        let mut system = self.system.lock().ok()?;
        system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        system.process(self.pid).map(sysinfo::Process::memory)
    }
}

/// One sample compared against the configured limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReading {
    pub usage: u64,
    pub limit: u64,
    pub threshold_percent: u8,
}

impl MemoryReading {
    /// Whether usage has reached `threshold_percent` of `limit`.
    #[must_use]
    pub fn exceeded(&self) -> bool {
        self.limit > 0
            && u128::from(self.usage) * 100
                >= u128::from(self.threshold_percent) * u128::from(self.limit)
    }

    /// Usage as a whole percentage of the limit.
    #[must_use]
    pub fn percent_used(&self) -> u64 {
        if self.limit == 0 {
            return 0;
        }
        let percent = u128::from(self.usage) * 100 / u128::from(self.limit);
        u64::try_from(percent).unwrap_or(u64::MAX)
    }
}

/// Decides whether a pass should stop because memory is running out.
pub struct MemoryGuard {
    limit_bytes: u64,
    threshold_percent: u8,
    sampler: Box<dyn MemorySampler>,
}

impl std::fmt::Debug for MemoryGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGuard")
            .field("limit_bytes", &self.limit_bytes)
            .field("threshold_percent", &self.threshold_percent)
            .finish_non_exhaustive()
    }
}

impl MemoryGuard {
    /// Guard against `limit_bytes` using the process RSS. A limit of 0
    /// disables the guard.
    #[must_use]
    pub fn new(limit_bytes: u64, threshold_percent: u8) -> Self {
        Self {
            limit_bytes,
            threshold_percent,
            sampler: Box::new(ProcessMemory::new()),
        }
    }

    /// A guard that never trips.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(0, DEFAULT_THRESHOLD_PERCENT)
    }

    /// Replace the usage source.
    #[must_use]
    pub fn with_sampler(mut self, sampler: impl MemorySampler + 'static) -> Self {
        self.sampler = Box::new(sampler);
        self
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.limit_bytes > 0
    }

    #[must_use]
    pub const fn limit_bytes(&self) -> u64 {
        self.limit_bytes
    }

    #[must_use]
    pub const fn threshold_percent(&self) -> u8 {
        self.threshold_percent
    }

    /// Sample usage. `None` when the guard is disabled or sampling failed.
    #[must_use]
    pub fn check(&self) -> Option<MemoryReading> {
        if !self.is_enabled() {
            return None;
        }
        let Some(usage) = self.sampler.resident_bytes() else {
            tracing::debug!("memory usage unavailable, skipping guard check");
            return None;
        };
        Some(MemoryReading {
            usage,
            limit: self.limit_bytes,
            threshold_percent: self.threshold_percent,
        })
    }

    /// True iff usage is at or above the threshold share of the limit.
    #[must_use]
    pub fn should_abort(&self) -> bool {
        self.check().is_some_and(|reading| reading.exceeded())
    }
}

/// Parse a memory limit such as `"512M"`, `"2g"`, `"64K"` or `"1048576"`.
///
/// Units are binary (`K` = 1024). Empty, negative (e.g. `"-1"`, meaning
/// unlimited) and unparsable values all resolve to 0, which disables the
/// guard.
#[must_use]
pub fn parse_memory_limit(raw: &str) -> u64 {
    let raw = raw.trim();
    let Some(last) = raw.chars().last() else {
        return 0;
    };

    let (digits, multiplier) = match last.to_ascii_lowercase() {
        'k' => (&raw[..raw.len() - 1], 1024),
        'm' => (&raw[..raw.len() - 1], 1024 * 1024),
        'g' => (&raw[..raw.len() - 1], 1024 * 1024 * 1024),
        _ => (raw, 1),
    };

    digits
        .trim()
        .parse::<u64>()
        .map_or(0, |value| value.saturating_mul(multiplier))
}
