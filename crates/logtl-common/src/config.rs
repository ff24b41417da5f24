//! Configuration types for logtl
//!
//! All addresses and sizes are in 512-byte sectors unless a field name says
//! otherwise.

use crate::error::{Error, Result};
use crate::types::SECTORS_PER_PAGE;
use serde::{Deserialize, Serialize};

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Translation engine configuration
    pub engine: EngineConfig,
    /// Control plane configuration
    pub control: ControlConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Validate every section against a device of `device_sectors`
    pub fn validate(&self, device_sectors: u64) -> Result<()> {
        self.engine.validate(device_sectors)?;
        self.control.validate(&self.engine, device_sectors)
    }
}

/// Translation engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Size of the logical address window exposed to clients
    pub logical_sectors: u64,
    /// First sector of the circular write log on the cache device
    pub log_base: u64,
    /// End of the circular write log (exclusive)
    pub log_bound: u64,
    /// Admission ceiling in log sectors (data plus headers) admitted but not
    /// yet written back
    pub max_sectors: u64,
    /// Capacity of the extent node pool shared by both indices
    pub max_extents: usize,
    /// In-flight journal header pages
    pub header_pages: usize,
    /// Largest single request accepted
    pub max_io_sectors: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            logical_sectors: 4 * 1024 * 1024, // 2 GiB
            log_base: 0,
            log_bound: 1024 * 1024, // 512 MiB
            max_sectors: 64 * 1024, // 32 MiB
            max_extents: 1 << 20,
            header_pages: 256,
            max_io_sectors: 512, // 256 KiB
        }
    }
}

impl EngineConfig {
    /// Log region size
    #[must_use]
    pub const fn log_span(&self) -> u64 {
        self.log_bound.saturating_sub(self.log_base)
    }

    /// Largest frontier advance a single allocation can cause
    #[must_use]
    pub const fn max_allocation(&self) -> u64 {
        crate::types::align_up(self.max_io_sectors as u64, SECTORS_PER_PAGE) + SECTORS_PER_PAGE
    }

    /// Validate the engine configuration against the cache device size
    pub fn validate(&self, device_sectors: u64) -> Result<()> {
        if self.logical_sectors == 0 {
            return Err(Error::configuration("logical_sectors must be positive"));
        }
        // journal headers pack LBAs into 47 bits and lengths into 16
        if self.logical_sectors > 1 << 47 {
            return Err(Error::configuration(
                "logical_sectors exceeds the 47-bit header address field",
            ));
        }
        if self.log_base >= self.log_bound {
            return Err(Error::configuration(format!(
                "log region [{}, {}) is empty",
                self.log_base, self.log_bound
            )));
        }
        if self.log_bound > device_sectors {
            return Err(Error::configuration(format!(
                "log bound {} exceeds device size {} sectors",
                self.log_bound, device_sectors
            )));
        }
        if self.log_base % SECTORS_PER_PAGE != 0 || self.log_bound % SECTORS_PER_PAGE != 0 {
            return Err(Error::configuration("log region must be page aligned"));
        }
        if self.max_io_sectors == 0 {
            return Err(Error::configuration("max_io_sectors must be positive"));
        }
        if self.max_allocation() > u64::from(u16::MAX) {
            return Err(Error::configuration(format!(
                "max_io_sectors {} does not fit a journal header",
                self.max_io_sectors
            )));
        }
        // Each allocation must stay within one octant or trim would skip one.
        let octant = self.log_span() / 8;
        if octant <= self.max_allocation() {
            return Err(Error::configuration(format!(
                "log octant of {octant} sectors cannot hold a {} sector allocation",
                self.max_allocation()
            )));
        }
        if self.max_sectors == 0 {
            return Err(Error::configuration("max_sectors must be positive"));
        }
        if self.max_sectors > self.log_span() / 2 {
            return Err(Error::configuration(format!(
                "admission ceiling {} exceeds half the log region ({})",
                self.max_sectors,
                self.log_span() / 2
            )));
        }
        if self.max_extents == 0 {
            return Err(Error::configuration("max_extents must be positive"));
        }
        if self.header_pages == 0 {
            return Err(Error::configuration("header_pages must be positive"));
        }
        Ok(())
    }
}

/// Control plane configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Maximum records fetched per wait call
    pub batch: usize,
    /// First sector of the read-cache region on the cache device
    pub read_cache_base: u64,
    /// End of the read-cache region (exclusive)
    pub read_cache_bound: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            batch: 128,
            read_cache_base: 1024 * 1024,
            read_cache_bound: 2 * 1024 * 1024,
        }
    }
}

impl ControlConfig {
    /// Validate against the engine layout and the cache device size
    pub fn validate(&self, engine: &EngineConfig, device_sectors: u64) -> Result<()> {
        if self.batch == 0 {
            return Err(Error::configuration("control batch must be positive"));
        }
        if self.read_cache_base >= self.read_cache_bound {
            return Err(Error::configuration("read-cache region is empty"));
        }
        if self.read_cache_bound > device_sectors {
            return Err(Error::configuration(format!(
                "read-cache bound {} exceeds device size {} sectors",
                self.read_cache_bound, device_sectors
            )));
        }
        if self.read_cache_base < engine.log_bound && engine.log_base < self.read_cache_bound {
            return Err(Error::configuration(
                "read-cache region overlaps the write log",
            ));
        }
        if self.read_cache_base % SECTORS_PER_PAGE != 0
            || self.read_cache_bound % SECTORS_PER_PAGE != 0
        {
            return Err(Error::configuration("read-cache region must be page aligned"));
        }
        let octant = (self.read_cache_bound - self.read_cache_base) / 8;
        if octant < crate::types::align_up(u64::from(engine.max_io_sectors), SECTORS_PER_PAGE) {
            return Err(Error::configuration(
                "read-cache octant is smaller than the largest request",
            ));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE: u64 = 4 * 1024 * 1024;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate(DEVICE).unwrap();
        assert_eq!(config.engine.max_allocation(), 520);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_engine_rejects_bad_regions() {
        let mut engine = EngineConfig::default();
        assert!(engine.validate(engine.log_bound - 8).is_err());

        engine.log_base = engine.log_bound;
        assert!(engine.validate(DEVICE).is_err());

        let mut engine = EngineConfig {
            log_base: 3,
            ..EngineConfig::default()
        };
        assert!(engine.validate(DEVICE).is_err());

        // octant too small for the largest request
        engine.log_base = 0;
        engine.log_bound = 8 * 512;
        assert!(engine.validate(DEVICE).is_err());
    }

    #[test]
    fn test_engine_rejects_header_overflow() {
        let engine = EngineConfig {
            max_io_sectors: 70_000,
            log_bound: 4 * 1024 * 1024,
            ..EngineConfig::default()
        };
        assert!(engine.validate(DEVICE).is_err());

        let engine = EngineConfig {
            logical_sectors: (1 << 47) + 1,
            ..EngineConfig::default()
        };
        assert!(engine.validate(DEVICE).is_err());
    }

    #[test]
    fn test_engine_rejects_oversized_ceiling() {
        let engine = EngineConfig {
            max_sectors: EngineConfig::default().log_span(),
            ..EngineConfig::default()
        };
        assert!(matches!(
            engine.validate(DEVICE),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_control_rejects_overlap() {
        let engine = EngineConfig::default();
        let control = ControlConfig {
            read_cache_base: engine.log_bound - 8,
            ..ControlConfig::default()
        };
        assert!(control.validate(&engine, DEVICE).is_err());

        let control = ControlConfig {
            read_cache_base: engine.log_bound + 3,
            ..ControlConfig::default()
        };
        assert!(control.validate(&engine, DEVICE).is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [engine]
            max_sectors = 1024

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.max_sectors, 1024);
        assert_eq!(config.engine.log_bound, EngineConfig::default().log_bound);
        assert_eq!(config.control.batch, 128);
        assert_eq!(config.logging.level, "debug");
    }
}
