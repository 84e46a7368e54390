use anyhow::{Result, anyhow, bail};
use clap::{ArgAction, ArgGroup, Parser, Subcommand};
use nrfmprog_lib::{DeviceFamily, ProgramOptions, TargetId};
use std::path::PathBuf;

use crate::config::NrfmprogConfig;

/// Everything needed to build a programming request, after applying the
/// config file underneath the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedConfig {
    pub file: PathBuf,
    pub family: DeviceFamily,
    pub snrs: Vec<TargetId>,
    pub options: ProgramOptions,
    pub quiet: bool,
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Program multiple nRF5 devices concurrently",
    long_about = None
)]
pub struct Cli {
    /// JSON configuration file path
    #[arg(long = "config", global = true)]
    pub config: Option<String>,

    /// Suppress progress bar output (default: false)
    #[arg(short = 'q', long = "quiet", global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Program a firmware image onto one or more targets
    #[command(name = "program")]
    Program(Program),
}

#[derive(Parser, Debug, Clone, Default)]
#[command(about = "Program a firmware image onto one or more targets")]
#[command(group(
    ArgGroup::new("erase")
        .args(["eraseall", "sectorserase", "sectorsanduicrerase"])
        .multiple(false)
))]
pub struct Program {
    /// Intel HEX or ELF file to program
    #[arg(short = 'f', long = "file")]
    pub file: Option<String>,

    /// Device family of the targets (default: NRF51)
    #[arg(long = "family", value_enum)]
    pub family: Option<DeviceFamily>,

    /// Serial numbers of the debug probes to program; all attached probes when omitted
    #[arg(short = 's', long = "snrs", num_args = 1.., action = ArgAction::Append)]
    pub snrs: Vec<String>,

    /// Erase all user flash and UICR and disable read-back protection first
    #[arg(short = 'e', long = "eraseall")]
    pub eraseall: bool,

    /// Erase the pages the file has data in before programming them
    #[arg(long = "sectorserase")]
    pub sectorserase: bool,

    /// Like --sectorserase, and also erase UICR unconditionally
    #[arg(short = 'u', long = "sectorsanduicrerase")]
    pub sectorsanduicrerase: bool,

    /// Read flash back and compare it with the file
    #[arg(short = 'v', long = "verify")]
    pub verify: bool,

    /// Issue a system reset once programming is done
    #[arg(short = 'r', long = "systemreset")]
    pub systemreset: bool,
}

impl Program {
    fn any_erase(&self) -> bool {
        self.eraseall || self.sectorserase || self.sectorsanduicrerase
    }
}

/// Merge CLI arguments with configuration file, CLI args take precedence
///
/// An erase flag on the command line replaces the config file's erase flags
/// entirely, so the two sources never combine into a conflict.
pub fn merge_config(args: &Cli, config: Option<NrfmprogConfig>) -> Result<MergedConfig> {
    let base_config = config.unwrap_or_else(NrfmprogConfig::with_defaults);
    let base_program = base_config.program.clone().unwrap_or_default();

    let cli_program = match (&args.command, &base_config.program) {
        (Some(Commands::Program(program)), _) => program.clone(),
        (None, Some(_)) => Program::default(),
        (None, None) => {
            bail!("No command specified. Use a subcommand or provide a config file with a command.")
        }
    };

    let file = cli_program
        .file
        .clone()
        .or_else(|| base_program.file.clone())
        .ok_or_else(|| anyhow!("File must be specified either via --file or in config file"))?;

    let family = match cli_program.family {
        Some(family) => family,
        None => base_config
            .parse_family()
            .map_err(|e| anyhow!("Invalid family in config: {}", e))?,
    };

    let snrs = if cli_program.snrs.is_empty() {
        base_program.target_ids()
    } else {
        cli_program.snrs.iter().map(|s| TargetId::from(s.as_str())).collect()
    };

    let (erase_all, sectors_erase, sectors_and_uicr_erase) = if cli_program.any_erase() {
        (
            cli_program.eraseall,
            cli_program.sectorserase,
            cli_program.sectorsanduicrerase,
        )
    } else {
        (
            base_program.eraseall,
            base_program.sectorserase,
            base_program.sectorsanduicrerase,
        )
    };

    Ok(MergedConfig {
        file: PathBuf::from(file),
        family,
        snrs,
        options: ProgramOptions {
            erase_all,
            sectors_erase,
            sectors_and_uicr_erase,
            verify: cli_program.verify || base_program.verify,
            system_reset: cli_program.systemreset || base_program.systemreset,
        },
        quiet: args.quiet || base_config.quiet,
    })
}
