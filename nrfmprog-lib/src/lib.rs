pub mod erase_plan;
pub mod error;
pub mod image;
pub mod orchestrator;
pub mod probe;
pub mod progress;
pub mod session;
pub mod transport;

pub use crate::error::{Error, Phase, Result, TargetError};
pub use crate::image::{FirmwareImage, MemorySegment};
pub use crate::orchestrator::{OperationOutcome, Orchestrator, resolve_targets};
pub use crate::probe::ProbeRsTransport;
pub use crate::session::{DeviceSession, LifecycleState, SessionReport};
pub use crate::transport::{ProbeHandle, ProbeTransport};

use std::fmt;
use std::path::{Path, PathBuf};
use strum::{Display, EnumString};

/// nRF5 device family of the targets being programmed.
#[derive(EnumString, Display, Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[strum(ascii_case_insensitive)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum DeviceFamily {
    #[default]
    #[strum(serialize = "NRF51")]
    #[cfg_attr(feature = "cli", value(name = "NRF51"))]
    Nrf51,
    #[strum(serialize = "NRF52")]
    #[cfg_attr(feature = "cli", value(name = "NRF52"))]
    Nrf52,
}

impl DeviceFamily {
    /// Flash erase granularity in bytes.
    pub const fn page_size(self) -> u32 {
        match self {
            DeviceFamily::Nrf51 => 0x400,
            DeviceFamily::Nrf52 => 0x1000,
        }
    }

    /// Target name understood by probe-rs when attaching.
    pub const fn target_name(self) -> &'static str {
        match self {
            DeviceFamily::Nrf51 => "nRF51822_xxAA",
            DeviceFamily::Nrf52 => "nRF52832_xxAA",
        }
    }
}

/// Serial number of the debug probe a target sits behind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(serial: impl Into<String>) -> Self {
        Self(serial.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(serial: &str) -> Self {
        Self::new(serial)
    }
}

impl From<String> for TargetId {
    fn from(serial: String) -> Self {
        Self(serial)
    }
}

impl From<u64> for TargetId {
    fn from(serial: u64) -> Self {
        Self(serial.to_string())
    }
}

/// What gets erased before the image is written.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum EraseMode {
    /// Write on top of whatever is in flash.
    #[default]
    None,
    /// Recover the device: all user flash, UICR and protection.
    All,
    /// Only the pages the image has data in.
    Sectors,
    /// The pages the image has data in, plus UICR unconditionally.
    SectorsAndUicr,
}

impl EraseMode {
    pub fn erases_sectors(self) -> bool {
        matches!(self, EraseMode::Sectors | EraseMode::SectorsAndUicr)
    }
}

/// Raw option flags as they arrive from a front end.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProgramOptions {
    pub erase_all: bool,
    pub sectors_erase: bool,
    pub sectors_and_uicr_erase: bool,
    pub verify: bool,
    pub system_reset: bool,
}

impl ProgramOptions {
    /// Collapses the erase flags, rejecting more than one.
    pub fn erase_mode(&self) -> Result<EraseMode> {
        let set: Vec<&'static str> = [
            (self.erase_all, "eraseall"),
            (self.sectors_erase, "sectorserase"),
            (self.sectors_and_uicr_erase, "sectorsanduicrerase"),
        ]
        .iter()
        .filter(|(enabled, _)| *enabled)
        .map(|(_, name)| *name)
        .collect();

        if set.len() > 1 {
            return Err(Error::EraseModeConflict(set));
        }

        Ok(if self.erase_all {
            EraseMode::All
        } else if self.sectors_erase {
            EraseMode::Sectors
        } else if self.sectors_and_uicr_erase {
            EraseMode::SectorsAndUicr
        } else {
            EraseMode::None
        })
    }
}

/// A validated request to program one image onto a set of targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgrammingRequest {
    image_path: PathBuf,
    family: DeviceFamily,
    targets: Vec<TargetId>,
    erase_mode: EraseMode,
    verify: bool,
    system_reset: bool,
}

impl ProgrammingRequest {
    /// Builds a request; fails with [`Error::EraseModeConflict`] when more than
    /// one erase mode is enabled.
    pub fn new(
        image_path: impl Into<PathBuf>,
        family: Option<DeviceFamily>,
        targets: Vec<TargetId>,
        options: ProgramOptions,
    ) -> Result<Self> {
        let erase_mode = options.erase_mode()?;
        Ok(Self {
            image_path: image_path.into(),
            family: family.unwrap_or_default(),
            targets,
            erase_mode,
            verify: options.verify,
            system_reset: options.system_reset,
        })
    }

    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    pub fn family(&self) -> DeviceFamily {
        self.family
    }

    /// Explicit targets; empty means every attached probe.
    pub fn targets(&self) -> &[TargetId] {
        &self.targets
    }

    pub fn erase_mode(&self) -> EraseMode {
        self.erase_mode
    }

    pub fn verify(&self) -> bool {
        self.verify
    }

    pub fn system_reset(&self) -> bool {
        self.system_reset
    }
}
