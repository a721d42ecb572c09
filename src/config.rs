//! Facilities for reading runtime configuration values
use crate::error::AnalysisError;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::trace;

/// Analyzer configuration.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Maximum number of bytes handed to the instruction decoder.
    #[serde(default = "Config::default_max_decode_bytes")]
    pub max_decode_bytes: usize,

    /// Maximum number of decoded instructions kept per listing.
    #[serde(default = "Config::default_max_decode_insts")]
    pub max_decode_insts: usize,

    /// Maximum number of rows produced by the hex-dump fallback.
    #[serde(default = "Config::default_max_fallback_rows")]
    pub max_fallback_rows: usize,

    /// Size of the window scanned for byte signatures.
    #[serde(default = "Config::default_max_signature_scan")]
    pub max_signature_scan: usize,

    /// Interpreter steps executed per cooperative tick.
    #[serde(default = "Config::default_step_batch")]
    pub step_batch: usize,

    /// Hard cap on interpreter steps per run session.
    #[serde(default = "Config::default_max_run_steps")]
    pub max_run_steps: usize,

    /// Pause between pipeline stages, in milliseconds, so that progress
    /// events remain observable by slow consumers.
    #[serde(default = "Config::default_stage_pause_ms")]
    pub stage_pause_ms: u64,
}

impl Config {
    /// Constructs `Config` from a `toml` file and environment variables
    pub fn new() -> Result<Self, AnalysisError> {
        let config: Self = Figment::new()
            .merge(Toml::file("backend.toml"))
            .merge(Env::prefixed("BACKEND__").split("__"))
            .extract()?;

        macro_rules! check_lower_bound {
            ($parent:ident.$var:ident, $limit:expr) => {
                if $parent.$var < $limit {
                    Err(AnalysisError::ConfigParameterValue {
                        parameter: stringify!($var),
                        message: format!(
                            "parameter value should be equal or larger than {}",
                            $limit
                        ),
                    })?
                }
            };
        }
        check_lower_bound!(config.step_batch, 1);
        check_lower_bound!(config.max_run_steps, 1);

        macro_rules! check_higher_bound {
            ($parent:ident.$var:ident, $limit:expr) => {
                if $parent.$var >= $limit as _ {
                    Err(AnalysisError::ConfigParameterValue {
                        parameter: stringify!($var),
                        message: format!("parameter value should be less than {}", $limit),
                    })?
                }
            };
        }
        check_higher_bound!(config.max_decode_bytes, i64::MAX);
        check_higher_bound!(config.max_signature_scan, i64::MAX);

        trace!("final config: {config:#?}");

        Ok(config)
    }

    fn default_max_decode_bytes() -> usize {
        2 * 1024 * 1024
    }

    fn default_max_decode_insts() -> usize {
        10_000
    }

    fn default_max_fallback_rows() -> usize {
        32
    }

    fn default_max_signature_scan() -> usize {
        1024 * 1024
    }

    fn default_step_batch() -> usize {
        100
    }

    fn default_max_run_steps() -> usize {
        50_000
    }

    fn default_stage_pause_ms() -> u64 {
        10
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_decode_bytes: Self::default_max_decode_bytes(),
            max_decode_insts: Self::default_max_decode_insts(),
            max_fallback_rows: Self::default_max_fallback_rows(),
            max_signature_scan: Self::default_max_signature_scan(),
            step_batch: Self::default_step_batch(),
            max_run_steps: Self::default_max_run_steps(),
            stage_pause_ms: Self::default_stage_pause_ms(),
        }
    }
}
