//! Node configuration.
//!
//! Values come from three layers, lowest precedence first: built-in defaults,
//! a JSON file, then `TESSEL_*` environment variables. Command-line flags are
//! applied on top by the binary.

use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tessel_core::{MrpParameters, MAX_PBKDF_ITERATIONS};

use crate::helpers::parse_env_value;
use crate::{Error, Result};

pub const DEFAULT_LISTEN: &str = "0.0.0.0:5540";
pub const DEFAULT_PASSCODE: u32 = 20202021;
pub const DEFAULT_DISCRIMINATOR: u16 = 3840;
pub const DEFAULT_PBKDF_ITERATIONS: u32 = 1000;
pub const DEFAULT_PBKDF_SALT_LENGTH: usize = 32;
pub const DEFAULT_VENDOR_ID: u16 = 0xfff1;

pub const MAX_PASSCODE: u32 = 99_999_998;
pub const MAX_DISCRIMINATOR: u16 = 0x0fff;
const MIN_PBKDF_SALT_LENGTH: usize = 16;
const MAX_PBKDF_SALT_LENGTH: usize = 32;

/// Passcodes the commissioning rules forbid because they are trivially guessable.
const INVALID_PASSCODES: [u32; 12] = [
    0, 11111111, 22222222, 33333333, 44444444, 55555555, 66666666, 77777777, 88888888, 99999999,
    12345678, 87654321,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub listen: SocketAddr,
    pub passcode: u32,
    pub discriminator: u16,
    pub pbkdf_iterations: u32,
    pub pbkdf_salt_length: usize,
    pub vendor_id: u16,
    pub mrp: MrpParameters,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 5540)),
            passcode: DEFAULT_PASSCODE,
            discriminator: DEFAULT_DISCRIMINATOR,
            pbkdf_iterations: DEFAULT_PBKDF_ITERATIONS,
            pbkdf_salt_length: DEFAULT_PBKDF_SALT_LENGTH,
            vendor_id: DEFAULT_VENDOR_ID,
            mrp: MrpParameters::default(),
        }
    }
}

impl NodeConfig {
    /// Load a JSON config file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("reading {}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::config(format!("invalid config: {e}")))
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Overlay `TESSEL_LISTEN`, `TESSEL_PASSCODE`, `TESSEL_DISCRIMINATOR` and
    /// `TESSEL_PBKDF_ITERATIONS` read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(listen) = parse_env_value("TESSEL_LISTEN", lookup("TESSEL_LISTEN"))? {
            self.listen = listen;
        }
        if let Some(passcode) = parse_env_value("TESSEL_PASSCODE", lookup("TESSEL_PASSCODE"))? {
            self.passcode = passcode;
        }
        if let Some(discriminator) =
            parse_env_value("TESSEL_DISCRIMINATOR", lookup("TESSEL_DISCRIMINATOR"))?
        {
            self.discriminator = discriminator;
        }
        if let Some(iterations) =
            parse_env_value("TESSEL_PBKDF_ITERATIONS", lookup("TESSEL_PBKDF_ITERATIONS"))?
        {
            self.pbkdf_iterations = iterations;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        validate_passcode(self.passcode)?;
        if self.discriminator > MAX_DISCRIMINATOR {
            return Err(Error::config(format!(
                "discriminator {} exceeds 12 bits",
                self.discriminator
            )));
        }
        if !(1..=MAX_PBKDF_ITERATIONS).contains(&self.pbkdf_iterations) {
            return Err(Error::config(format!(
                "pbkdf_iterations must be between 1 and {MAX_PBKDF_ITERATIONS}"
            )));
        }
        if !(MIN_PBKDF_SALT_LENGTH..=MAX_PBKDF_SALT_LENGTH).contains(&self.pbkdf_salt_length) {
            return Err(Error::config(format!(
                "pbkdf_salt_length must be between {MIN_PBKDF_SALT_LENGTH} and {MAX_PBKDF_SALT_LENGTH}"
            )));
        }
        if self.mrp.active_retransmission_timeout_ms == 0 {
            return Err(Error::config("mrp.active_retransmission_timeout_ms must be non-zero"));
        }
        Ok(())
    }
}

pub fn validate_passcode(passcode: u32) -> Result<()> {
    if passcode > MAX_PASSCODE {
        return Err(Error::config(format!(
            "passcode {passcode} exceeds {MAX_PASSCODE}"
        )));
    }
    if INVALID_PASSCODES.contains(&passcode) {
        return Err(Error::config(format!("passcode {passcode:08} is not allowed")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = NodeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.listen.to_string(), DEFAULT_LISTEN);
        assert_eq!(config.mrp.retransmission_retries, 2);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = NodeConfig::from_json(r#"{"passcode": 34567890, "mrp": {"active_retransmission_timeout_ms": 50}}"#)
            .unwrap();
        assert_eq!(config.passcode, 34567890);
        assert_eq!(config.discriminator, DEFAULT_DISCRIMINATOR);
        assert_eq!(config.mrp.active_retransmission_timeout_ms, 50);
        assert_eq!(config.mrp.idle_retransmission_timeout_ms, 5000);
    }

    #[test]
    fn test_env_overlay() {
        let env: HashMap<&str, &str> = [
            ("TESSEL_LISTEN", "127.0.0.1:6000"),
            ("TESSEL_PASSCODE", "24681357"),
            ("TESSEL_PBKDF_ITERATIONS", "2000"),
        ]
        .into_iter()
        .collect();

        let mut config = NodeConfig::default();
        config
            .apply_env(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.listen.port(), 6000);
        assert_eq!(config.passcode, 24681357);
        assert_eq!(config.pbkdf_iterations, 2000);
        assert_eq!(config.discriminator, DEFAULT_DISCRIMINATOR);
    }

    #[test]
    fn test_env_overlay_rejects_garbage() {
        let mut config = NodeConfig::default();
        let err = config
            .apply_env(|name| (name == "TESSEL_PASSCODE").then(|| "twelve".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_invalid_passcodes() {
        for passcode in [0, 11111111, 12345678, 87654321, 99999999, 100_000_000] {
            assert!(validate_passcode(passcode).is_err(), "{passcode} accepted");
        }
        validate_passcode(20202021).unwrap();
        validate_passcode(1).unwrap();
    }

    #[test]
    fn test_validate_rejects_iterations_out_of_range() {
        for iterations in [0, MAX_PBKDF_ITERATIONS + 1] {
            let config = NodeConfig {
                pbkdf_iterations: iterations,
                ..NodeConfig::default()
            };
            assert!(config.validate().is_err(), "{iterations}");
        }
    }
}
