//! Sectioned configuration for postguard.
//!
//! The daemon is configured through named sections of `option = value`
//! string pairs (`[main]`, `[performance]`, `[PluginAlias]`, plus one
//! section per plugin). `Config` keeps those pairs in insertion order and
//! offers typed getters; values stay strings internally so defaults can be
//! propagated uniformly. Reading the file itself is a thin TOML front-end;
//! everything past that point operates on the in-memory map.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use indexmap::IndexMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing configuration section [{0}]")]
    MissingSection(String),
    #[error("missing configuration value [{section}] :: {option}")]
    MissingOption { section: String, option: String },
    #[error("[{section}] :: {option} must be an integer, got '{value}'")]
    InvalidInt {
        section: String,
        option: String,
        value: String,
    },
    #[error("[{section}] :: {option} must be a boolean (true/false/1/0), got '{value}'")]
    InvalidBool {
        section: String,
        option: String,
        value: String,
    },
    #[error("failed to read configuration file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse configuration file '{path}': {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("configuration value [{section}] :: {option} has unsupported type {kind}")]
    UnsupportedValue {
        section: String,
        option: String,
        kind: &'static str,
    },
    #[error("configuration top level must consist of [section] tables")]
    NotSectioned,
}

/// A declared configuration option with its default. Components and plugins
/// expose a slice of these; missing options are filled in by
/// [`Config::propagate_defaults`] before anything reads them.
pub struct ConfigVar {
    pub name: &'static str,
    /// Section the option lives in; `None` means the caller's default
    /// section (a plugin's own section).
    pub section: Option<&'static str>,
    pub description: &'static str,
    pub default: &'static str,
    pub validator: Option<fn(&str) -> bool>,
}

/// Ordered sections of ordered `option = value` pairs.
#[derive(Debug, Clone, Default)]
pub struct Config {
    sections: IndexMap<String, IndexMap<String, String>>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: display.clone(),
                source,
            },
            other => other,
        })
    }

    /// Parse TOML text into sections. Tables become sections; scalar values
    /// are coerced to strings. Nested tables, arrays and datetimes are
    /// rejected: the configuration surface is flat by design.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let value: toml::Value = content.parse().map_err(|source| ConfigError::Parse {
            path: String::new(),
            source,
        })?;
        let top = value.as_table().ok_or(ConfigError::NotSectioned)?;
        let mut config = Config::new();
        for (section, body) in top {
            let table = body.as_table().ok_or(ConfigError::NotSectioned)?;
            for (option, raw) in table {
                let coerced = match raw {
                    toml::Value::String(s) => s.clone(),
                    toml::Value::Integer(i) => i.to_string(),
                    toml::Value::Float(f) => f.to_string(),
                    toml::Value::Boolean(b) => b.to_string(),
                    other => {
                        return Err(ConfigError::UnsupportedValue {
                            section: section.clone(),
                            option: option.clone(),
                            kind: other.type_str(),
                        })
                    }
                };
                config.set(section, option, &coerced);
            }
        }
        Ok(config)
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    pub fn has_option(&self, section: &str, option: &str) -> bool {
        self.sections
            .get(section)
            .map(|s| s.contains_key(option))
            .unwrap_or(false)
    }

    pub fn add_section(&mut self, section: &str) {
        self.sections.entry(section.to_string()).or_default();
    }

    pub fn set(&mut self, section: &str, option: &str, value: &str) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(option.to_string(), value.to_string());
    }

    pub fn get(&self, section: &str, option: &str) -> Result<&str, ConfigError> {
        let sec = self
            .sections
            .get(section)
            .ok_or_else(|| ConfigError::MissingSection(section.to_string()))?;
        sec.get(option)
            .map(|v| v.as_str())
            .ok_or_else(|| ConfigError::MissingOption {
                section: section.to_string(),
                option: option.to_string(),
            })
    }

    pub fn get_opt(&self, section: &str, option: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(option))
            .map(|v| v.as_str())
    }

    pub fn get_int<T>(&self, section: &str, option: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let raw = self.get(section, option)?;
        raw.trim().parse::<T>().map_err(|_| ConfigError::InvalidInt {
            section: section.to_string(),
            option: option.to_string(),
            value: raw.to_string(),
        })
    }

    pub fn get_bool(&self, section: &str, option: &str) -> Result<bool, ConfigError> {
        let raw = self.get(section, option)?;
        parse_bool(raw).ok_or_else(|| ConfigError::InvalidBool {
            section: section.to_string(),
            option: option.to_string(),
            value: raw.to_string(),
        })
    }

    /// Insert defaults from `vars` for every option missing from the
    /// configuration, creating sections as needed. Present options are left
    /// untouched, so repeated calls are no-ops.
    pub fn propagate_defaults(&mut self, vars: &[ConfigVar], default_section: &str) {
        for var in vars {
            let section = var.section.unwrap_or(default_section);
            if !self.has_option(section, var.name) {
                self.set(section, var.name, var.default);
            }
        }
    }

    /// Verify that every declared option is present and passes its
    /// validator. Problems are logged; returns whether everything checked
    /// out. Used by `lint`.
    pub fn check_vars(&self, vars: &[ConfigVar], default_section: &str) -> bool {
        let mut all_ok = true;
        for var in vars {
            let section = var.section.unwrap_or(default_section);
            match self.get_opt(section, var.name) {
                None => {
                    tracing::warn!(section, option = var.name, "missing configuration value");
                    all_ok = false;
                }
                Some(value) => {
                    if let Some(validator) = var.validator {
                        if !validator(value) {
                            tracing::warn!(
                                section,
                                option = var.name,
                                value,
                                "configuration value failed validation"
                            );
                            all_ok = false;
                        }
                    }
                }
            }
        }
        all_ok
    }

    /// Iterate options of one section, in insertion order.
    pub fn section_options(&self, section: &str) -> impl Iterator<Item = (&str, &str)> {
        self.sections
            .get(section)
            .into_iter()
            .flat_map(|s| s.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
