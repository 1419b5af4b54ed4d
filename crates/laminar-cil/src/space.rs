//! Space quantization.
//!
//! Each core rounds its local byte count up to buckets of `1 << stride`
//! bytes and only publishes to the generation's shared counter when its
//! bucket count changes. The shared counter therefore lags the true usage by
//! at most one bucket per core.

/// Result of publishing one append to a generation's space accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceUpdate {
    /// Extra log buffer segments the append spills into, if its space range
    /// crossed a segment boundary.
    pub split_res: Option<i64>,
    /// True if this append moved the generation from empty to dirty.
    pub first: bool,
}

/// `(1 << stride) - 1`.
#[inline]
#[must_use]
pub fn bucket_mask(stride: u32) -> i64 {
    (1_i64 << stride) - 1
}

/// Number of buckets needed to hold `bytes`, rounding up.
#[inline]
#[must_use]
pub fn bucket_count(bytes: i64, stride: u32) -> i64 {
    (bytes + bucket_mask(stride)) >> stride
}

/// `ceil(n / d)` for non-negative `n` and positive `d`.
#[inline]
#[must_use]
pub fn ceil_div(n: i64, d: i64) -> i64 {
    (n + d - 1) / d
}

/// True if `from` and `to` fall in different segments of `segment` bytes.
#[inline]
#[must_use]
pub fn crosses_segment(from: i64, to: i64, segment: i64) -> bool {
    from / segment != to / segment
}

/// Split reservation for an unquantized append of `len` bytes on top of
/// `before` bytes.
#[must_use]
pub fn split_reservation(before: i64, len: i64, segment: i64) -> Option<i64> {
    (len > 0 && crosses_segment(before, before + len, segment)).then(|| ceil_div(len, segment))
}
