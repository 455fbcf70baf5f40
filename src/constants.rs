//! Crate-wide constants.

/// Number of bits in a key word.
pub const KEY_BITS: usize = 64;

/// Byte budget for the sample keys each rank contributes to splitter
/// election. Larger samples give better pre-balance at the cost of a
/// bigger gather on the coordinating rank.
pub const SAMPLE_BYTES: usize = 256 * 1024;

/// Factor applied to the maximum smoothing length when inflating the
/// global range and the per-rank bounds used for ghost planning. SPH
/// kernels have compact support of two smoothing lengths.
pub const GHOST_INFLATION: f64 = 2.0;

/// Width of the boundary band, in units of the maximum smoothing length,
/// from which periodic mirrors are generated.
pub const MIRROR_BAND: f64 = 2.5;

/// Default subtree-count criterion below which a branch is scheduled as a
/// single neighbourhood-work sink.
pub const DEFAULT_SINK_CRITERION: u64 = 32;
