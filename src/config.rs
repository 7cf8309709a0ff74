// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Forest-wide tuning knobs.
//!
//! This subsystem introduces no CLI, environment variable, or wire-format
//! surface; `ForestOptions` is the only configuration entry point,
//! analogous to a plain struct-with-`Default` config rather than a builder
//! hierarchy, since the handful of knobs here don't warrant one.

/// Number of block-sized buffers the pipeline's [`crate::compaction::block_pool::BlockPool`]
/// pre-allocates.
pub const BLOCK_POOL_SIZE: usize = 1024;

/// Number of concurrent pipeline slots.
pub const PIPELINE_SLOT_COUNT: usize = 3;

/// Number of pipeline halves a bar's block partition is split across
/// (`input_data[p][a|b]`).
pub const PIPELINE_HALVES: usize = 2;

/// Forest-wide configuration.
///
/// Parameterizes the LSM shape (`lsm_levels`, `lsm_batch_multiple`,
/// `lsm_growth_factor`) that the pipeline's beat/bar clock and block
/// partitioning derive from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ForestOptions {
    /// Number of LSM levels, `level_b ∈ [0, lsm_levels)`.
    pub lsm_levels: u8,

    /// Number of beats (operations) per bar. A bar's compaction work is
    /// fully amortised across this many beats.
    pub lsm_batch_multiple: u32,

    /// Size ratio between adjacent LSM levels. Used only to derive the
    /// block-pool partition; the pipeline itself is agnostic to
    /// level-size policy.
    pub lsm_growth_factor: u32,
}

impl Default for ForestOptions {
    fn default() -> Self {
        Self {
            lsm_levels: 7,
            lsm_batch_multiple: 64,
            lsm_growth_factor: 8,
        }
    }
}

impl ForestOptions {
    /// Creates options with the given level count, keeping the other
    /// defaults.
    ///
    /// # Panics
    ///
    /// Panics if `lsm_levels` is 0.
    #[must_use]
    pub fn new(lsm_levels: u8) -> Self {
        assert!(lsm_levels > 0, "lsm_levels must be positive");

        Self {
            lsm_levels,
            ..Default::default()
        }
    }

    /// Sets the number of beats per bar.
    ///
    /// # Panics
    ///
    /// Panics if `lsm_batch_multiple` is 0.
    #[must_use]
    pub fn lsm_batch_multiple(mut self, beats: u32) -> Self {
        assert!(beats > 0, "lsm_batch_multiple must be positive");

        self.lsm_batch_multiple = beats;
        self
    }

    /// Sets the level growth factor used to derive the block-pool
    /// partition.
    ///
    /// # Panics
    ///
    /// Panics if `factor` is less than 2.
    #[must_use]
    pub fn lsm_growth_factor(mut self, factor: u32) -> Self {
        assert!(factor >= 2, "lsm_growth_factor must be at least 2");

        self.lsm_growth_factor = factor;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::ForestOptions;

    #[test]
    fn defaults_are_internally_consistent() {
        let opts = ForestOptions::default();
        assert!(opts.lsm_levels > 0);
        assert!(opts.lsm_batch_multiple > 0);
        assert!(opts.lsm_growth_factor >= 2);
    }

    #[test]
    #[should_panic(expected = "lsm_levels must be positive")]
    fn rejects_zero_levels() {
        ForestOptions::new(0);
    }
}
