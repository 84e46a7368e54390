use anyhow::{Context, Result};
use nrfmprog_lib::{DeviceFamily, TargetId};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Default values shared by the CLI and the config file
pub struct Defaults;

impl Defaults {
    pub const FAMILY: &'static str = "NRF51";
    pub const QUIET: bool = false;
}

/// A probe serial number. J-Link serials are usually written as numbers,
/// CMSIS-DAP serials are alphanumeric, so both JSON forms are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SerialNumber {
    Number(u64),
    Text(String),
}

impl From<&SerialNumber> for TargetId {
    fn from(serial: &SerialNumber) -> Self {
        match serial {
            SerialNumber::Number(n) => TargetId::from(*n),
            SerialNumber::Text(s) => TargetId::from(s.as_str()),
        }
    }
}

/// `program` command configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramCommandConfig {
    pub file: Option<String>,
    #[serde(default)]
    pub snrs: Vec<SerialNumber>,
    #[serde(default)]
    pub eraseall: bool,
    #[serde(default)]
    pub sectorserase: bool,
    #[serde(default)]
    pub sectorsanduicrerase: bool,
    #[serde(default)]
    pub verify: bool,
    #[serde(default)]
    pub systemreset: bool,
}

impl ProgramCommandConfig {
    pub fn target_ids(&self) -> Vec<TargetId> {
        self.snrs.iter().map(TargetId::from).collect()
    }
}

/// Root of the JSON configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NrfmprogConfig {
    #[serde(default = "default_family")]
    pub family: String,
    #[serde(default)]
    pub quiet: bool,

    pub program: Option<ProgramCommandConfig>,
}

fn default_family() -> String {
    Defaults::FAMILY.to_string()
}

impl NrfmprogConfig {
    /// Loads a configuration from a JSON file
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path))?;
        let config: NrfmprogConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path))?;
        Ok(config)
    }

    /// A configuration with every value at its default
    pub fn with_defaults() -> Self {
        Self {
            family: Defaults::FAMILY.to_string(),
            quiet: Defaults::QUIET,
            program: None,
        }
    }

    pub fn parse_family(&self) -> Result<DeviceFamily, String> {
        DeviceFamily::from_str(&self.family).map_err(|_| {
            format!(
                "Invalid family '{}'. Must be one of: NRF51, NRF52",
                self.family
            )
        })
    }

    pub fn validate(&self) -> Result<(), String> {
        self.parse_family()?;

        if let Some(ref program) = self.program {
            let erase_flags = [
                program.eraseall,
                program.sectorserase,
                program.sectorsanduicrerase,
            ]
            .iter()
            .filter(|&&x| x)
            .count();
            if erase_flags > 1 {
                return Err(
                    "Only one of eraseall, sectorserase or sectorsanduicrerase may be set"
                        .to_string(),
                );
            }

            if let Some(ref file) = program.file
                && file.is_empty()
            {
                return Err("program.file must not be empty".to_string());
            }

            for serial in &program.snrs {
                if let SerialNumber::Text(text) = serial
                    && text.trim().is_empty()
                {
                    return Err("program.snrs must not contain empty serial numbers".to_string());
                }
            }
        }

        Ok(())
    }
}
