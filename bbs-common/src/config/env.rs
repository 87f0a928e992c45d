//! `BBS_*` environment overrides.
//!
//! The parser keeps going after a bad value so every problem is reported in
//! one pass; invalid values fall back to the supplied default.

use super::source::Sourced;
use std::env;
use thiserror::Error;

pub const ENV_PREFIX: &str = "BBS_";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvError {
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("Invalid log level for {var}: {value}")]
    InvalidLogLevel { var: String, value: String },
}

pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    pub fn new() -> Self {
        Self {
            prefix: ENV_PREFIX,
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Accepts 1/true/yes/on and 0/false/no/off/"" (case-insensitive).
    pub fn get_bool(&mut self, name: &str, default: bool) -> Sourced<bool> {
        let var_name = self.var_name(name);
        let Ok(value) = env::var(&var_name) else {
            return Sourced::default_value(default);
        };
        let parsed = match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" | "" => false,
            _ => {
                self.errors.push(EnvError::InvalidValue {
                    var: var_name.clone(),
                    expected: "boolean (true/false/1/0/yes/no)".to_string(),
                    value,
                });
                return Sourced::default_value(default);
            }
        };
        Sourced::from_env(parsed, var_name)
    }

    pub fn get_u32_range(&mut self, name: &str, default: u32, min: u32, max: u32) -> Sourced<u32> {
        let var_name = self.var_name(name);
        let Ok(value) = env::var(&var_name) else {
            return Sourced::default_value(default);
        };
        match value.trim().parse::<u32>() {
            Ok(n) if (min..=max).contains(&n) => Sourced::from_env(n, var_name),
            Ok(n) => {
                self.errors.push(EnvError::OutOfRange {
                    var: var_name,
                    value: n.to_string(),
                    min: min.to_string(),
                    max: max.to_string(),
                });
                Sourced::default_value(default)
            }
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var: var_name,
                    expected: "unsigned integer".to_string(),
                    value,
                });
                Sourced::default_value(default)
            }
        }
    }

    pub fn get_port(&mut self, name: &str, default: u16) -> Sourced<u16> {
        let sourced = self.get_u32_range(name, u32::from(default), 1, u32::from(u16::MAX));
        Sourced {
            value: u16::try_from(sourced.value).unwrap_or(default),
            source: sourced.source,
            env_var: sourced.env_var,
        }
    }

    pub fn get_log_level(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var_name = self.var_name(name);
        let Ok(value) = env::var(&var_name) else {
            return Sourced::default_value(default.to_string());
        };
        let lower = value.to_lowercase();
        if is_log_level(&lower) {
            Sourced::from_env(lower, var_name)
        } else {
            self.errors.push(EnvError::InvalidLogLevel {
                var: var_name,
                value,
            });
            Sourced::default_value(default.to_string())
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

pub fn is_log_level(value: &str) -> bool {
    matches!(value, "trace" | "debug" | "info" | "warn" | "error" | "off")
}
