//! Engine configuration
//!
//! Everything is read from environment variables (after `dotenvy` has loaded
//! `.env`), with defaults from the `Default` impls. Malformed values are start-up
//! errors naming the offending variable.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Result};

use crate::sandbox::SandboxConfig;
use crate::scheduler::SchedulerConfig;

/// Complete configuration for an `Engine`
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub sandbox: SandboxConfig,
    pub scheduler: SchedulerConfig,
    /// Alternative language profiles (LANGUAGES_CONFIG); the embedded table otherwise
    pub languages_config: Option<PathBuf>,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let env = EnvReader::new(lookup);
        Ok(Self {
            sandbox: SandboxConfig::from_reader(&env)?,
            scheduler: SchedulerConfig::from_reader(&env)?,
            languages_config: env.string("LANGUAGES_CONFIG").map(PathBuf::from),
        })
    }
}

/// Typed access to a key/value source of configuration variables
pub(crate) struct EnvReader<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl<'a> EnvReader<'a> {
    pub(crate) fn new(lookup: &'a dyn Fn(&str) -> Option<String>) -> Self {
        Self { lookup }
    }

    /// Non-empty, trimmed value
    pub(crate) fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
    }

    pub(crate) fn parse<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        Ok(self.optional(name)?.unwrap_or(default))
    }

    pub(crate) fn optional<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.string(name)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| anyhow!("Invalid value for {}: {:?} ({})", name, raw, e))
            })
            .transpose()
    }

    pub(crate) fn flag(&self, name: &str, default: bool) -> Result<bool> {
        match self.string(name).map(|raw| raw.to_lowercase()) {
            None => Ok(default),
            Some(raw) => match raw.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(anyhow!("Invalid value for {}: {:?} (expected a boolean)", name, raw)),
            },
        }
    }

    /// Comma-separated list; `None` when unset
    pub(crate) fn list(&self, name: &str) -> Option<Vec<String>> {
        self.string(name).map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
    }
}
