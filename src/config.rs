//! Layered configuration for the core.
//!
//! A handful of knobs and one persisted artifact (the `SpecifiedFunctions`
//! set) live in a small TOML file, loaded with `serde` rather than hand
//! parsed. A missing file is the common case (a fresh checkout) and is not
//! an error; a malformed one is, since silently ignoring a typo'd config is
//! worse than failing loudly.

use crate::address::Address;
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DebuggerConfig {
    /// Adapter wait-polling granularity, in milliseconds. Clamped to >= 1.
    pub poll_interval_ms: u64,
    /// Whether the event classifier should distinguish syscall-stops from
    /// ordinary signal-stops (classifier rule 4).
    pub trap_on_syscall: bool,
    /// T_high: call-site count at/above which the walker's high-reference
    /// pass picks up a seed.
    pub high_reference_threshold: u32,
    /// T_low: call-site count at/above which the low-reference pass picks
    /// up a seed.
    pub low_reference_threshold: u32,
    /// Where the `SpecifiedFunctions` set is loaded from / saved to.
    pub specified_functions_path: Option<PathBuf>,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        DebuggerConfig {
            poll_interval_ms: 10,
            trap_on_syscall: false,
            high_reference_threshold: 2,
            low_reference_threshold: 1,
            specified_functions_path: None,
        }
    }
}

impl DebuggerConfig {
    /// Loads configuration from `path`. A missing file yields the default
    /// configuration (logged at `debug!`); a file that exists but fails to
    /// parse is a hard error.
    pub fn load(path: &Path) -> Result<DebuggerConfig> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("no config file at {}, using defaults", path.display());
                return Ok(DebuggerConfig::default());
            }
            Err(err) => {
                return Err(CoreError::InvalidConfig(format!(
                    "reading {}: {}",
                    path.display(),
                    err
                )))
            }
        };
        let mut config: DebuggerConfig = toml::from_str(&raw)
            .map_err(|err| CoreError::InvalidConfig(format!("{}: {}", path.display(), err)))?;
        if config.poll_interval_ms == 0 {
            config.poll_interval_ms = 1;
        }
        Ok(config)
    }
}

/// A user-curated set of addresses forcibly treated as function starts.
/// Persists across analyses and across process runs as a sorted list of
/// hex addresses, one per line.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct SpecifiedFunctions {
    addresses: BTreeSet<Address>,
}

impl SpecifiedFunctions {
    pub fn new() -> SpecifiedFunctions {
        SpecifiedFunctions::default()
    }

    pub fn insert(&mut self, address: Address) {
        self.addresses.insert(address);
    }

    pub fn remove(&mut self, address: Address) {
        self.addresses.remove(&address);
    }

    pub fn contains(&self, address: Address) -> bool {
        self.addresses.contains(&address)
    }

    pub fn iter(&self) -> impl Iterator<Item = Address> + '_ {
        self.addresses.iter().copied()
    }

    /// Addresses that fall inside `[start, end)`, in ascending order.
    pub fn in_range(&self, start: Address, end: Address) -> Vec<Address> {
        self.addresses
            .iter()
            .copied()
            .filter(|addr| *addr >= start && *addr < end)
            .collect()
    }

    pub fn load(path: &Path) -> Result<SpecifiedFunctions> {
        let mut set = SpecifiedFunctions::new();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(set),
            Err(err) => {
                return Err(CoreError::InvalidConfig(format!(
                    "reading {}: {}",
                    path.display(),
                    err
                )))
            }
        };
        for (lineno, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let digits = line.strip_prefix("0x").unwrap_or(line);
            let value = u64::from_str_radix(digits, 16).map_err(|_| {
                CoreError::InvalidConfig(format!(
                    "{}:{}: not a hex address: {:?}",
                    path.display(),
                    lineno + 1,
                    line
                ))
            })?;
            set.insert(Address::new(value));
        }
        Ok(set)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut body = String::new();
        for addr in self.iter() {
            body.push_str(&format!("{}\n", addr));
        }
        std::fs::write(path, body)
            .map_err(|err| CoreError::InvalidConfig(format!("writing {}: {}", path.display(), err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_yields_defaults() {
        let config = DebuggerConfig::load(Path::new("/nonexistent/edb-core-test.toml")).unwrap();
        assert_eq!(config, DebuggerConfig::default());
    }

    #[test]
    fn zero_poll_interval_is_clamped() {
        let dir = std::env::temp_dir().join("edb_core_test_zero_poll");
        std::fs::write(&dir, "poll_interval_ms = 0\n").unwrap();
        let config = DebuggerConfig::load(&dir).unwrap();
        assert_eq!(config.poll_interval_ms, 1);
        let _ = std::fs::remove_file(&dir);
    }

    #[test]
    fn malformed_config_is_a_hard_error() {
        let dir = std::env::temp_dir().join("edb_core_test_malformed");
        std::fs::write(&dir, "this is not toml {{{").unwrap();
        let result = DebuggerConfig::load(&dir);
        assert!(result.is_err());
        let _ = std::fs::remove_file(&dir);
    }

    #[test]
    fn specified_functions_round_trip_through_disk() {
        let path = std::env::temp_dir().join("edb_core_test_specified_functions.txt");
        let mut set = SpecifiedFunctions::new();
        set.insert(Address::new(0x1000));
        set.insert(Address::new(0xdeadbeef));
        set.save(&path).unwrap();

        let loaded = SpecifiedFunctions::load(&path).unwrap();
        assert_eq!(loaded, set);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn in_range_filters_by_half_open_interval() {
        let mut set = SpecifiedFunctions::new();
        set.insert(Address::new(0x1000));
        set.insert(Address::new(0x1fff));
        set.insert(Address::new(0x2000));
        let in_range = set.in_range(Address::new(0x1000), Address::new(0x2000));
        assert_eq!(in_range, vec![Address::new(0x1000), Address::new(0x1fff)]);
    }
}
