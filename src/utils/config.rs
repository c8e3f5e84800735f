//! Configuration loading and validation

use crate::memory::Placement;
use crate::{Config, Error, Result};
use log::warn;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Configuration file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
}

impl ConfigFormat {
    /// Detect the format from a file extension
    pub fn detect(path: &Path) -> Result<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Ok(ConfigFormat::Json),
            Some(ext) => Err(Error::InvalidConfig(format!(
                "unsupported configuration format '.{}'",
                ext
            ))),
            None => Err(Error::InvalidConfig(format!(
                "no file extension on {}",
                path.display()
            ))),
        }
    }
}

/// Read and validate a configuration file
pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let config = match ConfigFormat::detect(path)? {
        ConfigFormat::Json => serde_json::from_str::<Config>(&fs::read_to_string(path)?)?,
    };
    validate(&config)?;
    Ok(config)
}

/// Check applied to the values a rule extracts
pub enum ValidationRule {
    NonZero,
    PowerOfTwo,
    Range { min: u64, max: u64 },
    Custom(Box<dyn Fn(u64) -> Result<()> + Send + Sync>),
}

impl std::fmt::Debug for ValidationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationRule::NonZero => write!(f, "NonZero"),
            ValidationRule::PowerOfTwo => write!(f, "PowerOfTwo"),
            ValidationRule::Range { min, max } => {
                write!(f, "Range {{ min: {}, max: {} }}", min, max)
            }
            ValidationRule::Custom(_) => write!(f, "Custom(<closure>)"),
        }
    }
}

impl ValidationRule {
    fn check(&self, key: &str, value: u64) -> Result<()> {
        match self {
            ValidationRule::NonZero if value == 0 => {
                Err(Error::InvalidConfig(format!("'{}' must be non-zero", key)))
            }
            ValidationRule::PowerOfTwo if !value.is_power_of_two() => Err(Error::InvalidConfig(
                format!("'{}' = {} is not a power of two", key, value),
            )),
            ValidationRule::Range { min, max } if value < *min || value > *max => {
                Err(Error::InvalidConfig(format!(
                    "'{}' = {} must be between {} and {}",
                    key, value, min, max
                )))
            }
            ValidationRule::Custom(check) => check(value),
            _ => Ok(()),
        }
    }
}

type Extractor = Box<dyn Fn(&Config) -> Vec<u64> + Send + Sync>;

/// Named rules over values pulled out of a [`Config`]
#[derive(Default)]
pub struct ConfigValidator {
    rules: Vec<(String, Extractor, ValidationRule)>,
}

impl ConfigValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule<F>(&mut self, key: &str, extract: F, rule: ValidationRule)
    where
        F: Fn(&Config) -> Vec<u64> + Send + Sync + 'static,
    {
        self.rules.push((key.to_string(), Box::new(extract), rule));
    }

    pub fn validate(&self, config: &Config) -> Result<()> {
        for (key, extract, rule) in &self.rules {
            for value in extract(config) {
                rule.check(key, value)?;
            }
        }
        Ok(())
    }

    /// Rules every fabric configuration must satisfy
    pub fn fabric() -> Self {
        let mut validator = Self::new();
        validator.add_rule(
            "fifos[].depth",
            |config| {
                config
                    .fifos
                    .iter()
                    .filter(|sizing| sizing.tx.depth > 0)
                    .flat_map(|sizing| [sizing.tx.depth as u64, sizing.rx.depth as u64])
                    .collect()
            },
            ValidationRule::PowerOfTwo,
        );
        validator.add_rule(
            "wait_poll_interval_ms",
            |config| vec![config.wait_poll_interval_ms],
            ValidationRule::NonZero,
        );
        validator.add_rule(
            "max_nics",
            |config| vec![config.max_nics as u64],
            ValidationRule::NonZero,
        );
        validator.add_rule(
            "recv_buf_len",
            |config| vec![config.recv_buf_len as u64],
            ValidationRule::Range {
                min: 1,
                max: u32::MAX as u64,
            },
        );
        validator.add_rule(
            "recv_rt_priority",
            |config| config.recv_rt_priority.map(|p| p as u64).into_iter().collect(),
            ValidationRule::Range { min: 1, max: 99 },
        );
        validator.add_rule(
            "payload_offset",
            |config| vec![config.payload_offset as u64],
            ValidationRule::Range {
                min: 0,
                max: u16::MAX as u64,
            },
        );
        validator
    }
}

/// Validate a fabric configuration
pub fn validate(config: &Config) -> Result<()> {
    ConfigValidator::fabric().validate(config)?;

    if config.payload_offset >= config.buffer_size() {
        return Err(Error::InvalidConfig(format!(
            "payload offset {} outside a {} byte buffer",
            config.payload_offset,
            config.buffer_size()
        )));
    }

    let mut seen = HashSet::new();
    for sizing in &config.fifos {
        if !seen.insert(sizing.fifo) {
            return Err(Error::InvalidConfig(format!(
                "fifo {} sized more than once",
                sizing.fifo
            )));
        }
    }

    let fast_requested: usize = config
        .fifos
        .iter()
        .filter(|sizing| sizing.tx.depth > 0)
        .flat_map(|sizing| [sizing.tx, sizing.rx])
        .filter(|ring| ring.placement == Placement::FastMemory)
        .map(|ring| crate::memory::RingAllocator::ring_bytes(ring.depth))
        .sum();
    if fast_requested > config.fast_memory_size {
        warn!(
            "{} bytes of rings requested in fast memory, region holds {}",
            fast_requested, config.fast_memory_size
        );
    }
    Ok(())
}
