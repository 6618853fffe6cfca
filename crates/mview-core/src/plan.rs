//! The version window a pass commits to, and its split into sub-ranges.

use serde::Serialize;

use crate::state::Version;

/// Which part of the changelog a pass covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassMode {
    /// Changes recorded after the checkpoint.
    Incremental,
    /// Every entity in the changelog, whatever the checkpoint says.
    Full,
}

impl PassMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Incremental => "incremental",
            Self::Full => "full",
        }
    }
}

/// Half-open version window `(from, to]` processed as one checkpointed unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRange {
    pub from: Version,
    pub to: Version,
}

/// Window captured at pass start. Changes recorded after the head was read
/// wait for the next pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdatePlan {
    pub from_version: Version,
    pub to_version: Version,
}

impl UpdatePlan {
    #[must_use]
    pub const fn new(from_version: Version, to_version: Version) -> Self {
        Self {
            from_version,
            to_version,
        }
    }

    /// Window for `mode`: from the checkpoint, or from 0 for a full pass.
    #[must_use]
    pub const fn for_mode(mode: PassMode, checkpoint: Version, head: Version) -> Self {
        match mode {
            PassMode::Incremental => Self::new(checkpoint, head),
            PassMode::Full => Self::new(0, head),
        }
    }

    /// Whether there is nothing between the checkpoint and the head.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.from_version >= self.to_version
    }

    /// Split the window into consecutive ranges of at most `batch_size`
    /// versions. The last range ends exactly at `to_version`.
    ///
    /// A `batch_size` of 0 is treated as 1.
    #[must_use]
    pub fn sub_ranges(&self, batch_size: u64) -> SubRanges {
        SubRanges {
            next: self.from_version,
            to: self.to_version,
            step: batch_size.max(1),
        }
    }
}

/// Iterator returned by [`UpdatePlan::sub_ranges`].
#[derive(Debug, Clone)]
pub struct SubRanges {
    next: Version,
    to: Version,
    step: u64,
}

impl Iterator for SubRanges {
    type Item = VersionRange;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.to {
            return None;
        }
        let from = self.next;
        // Never past the captured head.
        let to = from.saturating_add(self.step).min(self.to);
        self.next = to;
        Some(VersionRange { from, to })
    }
}
