//! Configuration for the sharded committed item list.

use crate::error::CilError;

/// Largest accepted batch size. Keeps `bucket << stride` inside `i64` for any
/// realistic space counter.
pub const MAX_BATCH_SIZE: u32 = 1 << 30;

/// Size in bytes of the operation header charged for every log buffer
/// segment a commit spills into.
pub const DEFAULT_OP_HEADER_SIZE: i64 = 12;

/// How a generation stores pending items.
///
/// Chosen once at initialization. Mixing modes within a generation is never
/// valid, so every merge asserts the mode it expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CilMode {
    /// One list and one context per generation, guarded by the list lock.
    Shared,
    /// One list and one context per core, gathered at drain time.
    PerCore {
        /// Bytes accumulated locally before the shared space counter is
        /// touched. Rounded down to a power of two.
        batch_size: u32,
    },
}

impl CilMode {
    /// Maps a raw stride hint: negative selects shared mode, anything else
    /// selects per-core mode with the hint as batch size.
    #[must_use]
    pub fn from_stride_hint(hint: i64) -> Self {
        match u32::try_from(hint) {
            Ok(batch_size) => Self::PerCore { batch_size },
            Err(_) if hint < 0 => Self::Shared,
            Err(_) => Self::PerCore {
                batch_size: u32::MAX,
            },
        }
    }

    /// Returns true for per-core mode.
    #[must_use]
    pub fn is_per_core(self) -> bool {
        matches!(self, Self::PerCore { .. })
    }

    /// Quantization stride, `log2(max(batch_size, 1))`. Zero in shared mode.
    #[must_use]
    pub fn stride(self) -> u32 {
        match self {
            Self::Shared => 0,
            Self::PerCore { batch_size } => batch_size.max(1).ilog2(),
        }
    }
}

impl Default for CilMode {
    fn default() -> Self {
        Self::PerCore { batch_size: 1 }
    }
}

/// Geometry of the log the list stages items for.
///
/// Implemented by the log-write pipeline; read once at initialization.
pub trait LogHandle {
    /// Reservation of an empty transaction (log overhead only), in bytes.
    fn unit_reservation(&self) -> i64;

    /// Usable bytes in one in-core log buffer segment.
    fn iclog_space(&self) -> i64;
}

/// Plain [`LogHandle`] for callers that already know their geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogGeometry {
    /// Unit reservation in bytes.
    pub unit_res: i64,
    /// Usable bytes per log buffer segment.
    pub iclog_space: i64,
}

impl LogGeometry {
    /// Creates a new geometry.
    #[must_use]
    pub const fn new(unit_res: i64, iclog_space: i64) -> Self {
        Self {
            unit_res,
            iclog_space,
        }
    }
}

impl LogHandle for LogGeometry {
    fn unit_reservation(&self) -> i64 {
        self.unit_res
    }

    fn iclog_space(&self) -> i64 {
        self.iclog_space
    }
}

/// Configuration for a [`ScaleController`](crate::ScaleController).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CilConfig {
    /// Storage mode for both generations.
    pub mode: CilMode,
    /// Number of core slots allocated in per-core mode.
    pub num_cores: usize,
    /// Bytes charged per log buffer segment a commit spills into.
    pub op_header_size: i64,
}

impl Default for CilConfig {
    fn default() -> Self {
        Self {
            mode: CilMode::default(),
            num_cores: num_cpus::get(),
            op_header_size: DEFAULT_OP_HEADER_SIZE,
        }
    }
}

impl CilConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> CilConfigBuilder {
        CilConfigBuilder::default()
    }

    /// Default configuration with the mode taken from a raw stride hint.
    #[must_use]
    pub fn from_stride_hint(hint: i64) -> Self {
        Self {
            mode: CilMode::from_stride_hint(hint),
            ..Self::default()
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), CilError> {
        if self.num_cores == 0 {
            return Err(CilError::InvalidConfig("num_cores must be > 0".to_string()));
        }
        if let CilMode::PerCore { batch_size } = self.mode {
            if batch_size > MAX_BATCH_SIZE {
                return Err(CilError::InvalidConfig(format!(
                    "batch_size {batch_size} exceeds {MAX_BATCH_SIZE}"
                )));
            }
        }
        if self.op_header_size < 0 {
            return Err(CilError::InvalidConfig(
                "op_header_size must be >= 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for `CilConfig`.
#[derive(Debug, Default)]
pub struct CilConfigBuilder {
    mode: Option<CilMode>,
    num_cores: Option<usize>,
    op_header_size: Option<i64>,
}

impl CilConfigBuilder {
    /// Sets the storage mode.
    #[must_use]
    pub fn mode(mut self, mode: CilMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Selects shared (non-sharded) mode.
    #[must_use]
    pub fn shared(self) -> Self {
        self.mode(CilMode::Shared)
    }

    /// Selects per-core mode with the given batch size.
    #[must_use]
    pub fn per_core(self, batch_size: u32) -> Self {
        self.mode(CilMode::PerCore { batch_size })
    }

    /// Sets the number of core slots.
    #[must_use]
    pub fn num_cores(mut self, n: usize) -> Self {
        self.num_cores = Some(n);
        self
    }

    /// Sets the per-segment operation header size.
    #[must_use]
    pub fn op_header_size(mut self, bytes: i64) -> Self {
        self.op_header_size = Some(bytes);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> Result<CilConfig, CilError> {
        let config = CilConfig {
            mode: self.mode.unwrap_or_default(),
            num_cores: self.num_cores.unwrap_or_else(num_cpus::get),
            op_header_size: self.op_header_size.unwrap_or(DEFAULT_OP_HEADER_SIZE),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stride_from_batch_size() {
        assert_eq!(CilMode::PerCore { batch_size: 0 }.stride(), 0);
        assert_eq!(CilMode::PerCore { batch_size: 1 }.stride(), 0);
        assert_eq!(CilMode::PerCore { batch_size: 3 }.stride(), 1);
        assert_eq!(CilMode::PerCore { batch_size: 512 }.stride(), 9);
        assert_eq!(CilMode::Shared.stride(), 0);
    }

    #[test]
    fn test_mode_from_stride_hint() {
        assert_eq!(CilMode::from_stride_hint(-1), CilMode::Shared);
        assert_eq!(
            CilMode::from_stride_hint(0),
            CilMode::PerCore { batch_size: 0 }
        );
        assert_eq!(
            CilMode::from_stride_hint(256),
            CilMode::PerCore { batch_size: 256 }
        );
        assert!(!CilConfig::from_stride_hint(-7).mode.is_per_core());
    }

    #[test]
    fn test_builder_defaults() {
        let config = CilConfig::builder().num_cores(4).build().unwrap();
        assert_eq!(config.num_cores, 4);
        assert_eq!(config.mode, CilMode::PerCore { batch_size: 1 });
        assert_eq!(config.op_header_size, DEFAULT_OP_HEADER_SIZE);
    }

    #[test]
    fn test_builder_rejects_zero_cores() {
        let result = CilConfig::builder().num_cores(0).build();
        assert!(matches!(result, Err(CilError::InvalidConfig(_))));
    }

    #[test]
    fn test_builder_rejects_huge_batch() {
        let result = CilConfig::builder()
            .num_cores(1)
            .per_core(MAX_BATCH_SIZE + 1)
            .build();
        assert!(matches!(result, Err(CilError::InvalidConfig(_))));
    }

    #[test]
    fn test_log_geometry_handle() {
        let log = LogGeometry::new(2048, 32256);
        assert_eq!(log.unit_reservation(), 2048);
        assert_eq!(log.iclog_space(), 32256);
    }
}
