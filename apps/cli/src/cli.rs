//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Parse a string as a hex or decimal u64
fn parse_number(s: &str) -> Result<u64, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))
    } else {
        s.parse::<u64>().map_err(|e| format!("Invalid number: {}", e))
    }
}

#[derive(Parser, Debug)]
#[command(name = "bootlink")]
#[command(author, version, about = "Boot ROM / download-agent flashing tool", long_about = None)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Session configuration file (TOML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Serial port; without one the first supported USB device is used
    #[arg(short, long, global = true)]
    pub port: Option<String>,

    /// Initial baud rate for serial ports
    #[arg(long, global = true)]
    pub baud: Option<u32>,

    /// Loader repository directory (contains loaders.toml)
    #[arg(long, global = true)]
    pub loaders: Option<PathBuf>,

    /// Exploit manifest (TOML)
    #[arg(long, global = true)]
    pub exploits: Option<PathBuf>,

    /// Vendor authorization digest file
    #[arg(long, global = true, requires = "auth_signature")]
    pub auth_digest: Option<PathBuf>,

    /// Vendor authorization signature file
    #[arg(long, global = true, requires = "auth_digest")]
    pub auth_signature: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Handshake and print the chip identity
    Probe,

    /// Print the partition table
    PrintTable,

    /// Read a partition to a file
    Read {
        partition: String,

        output: PathBuf,

        /// Restrict the lookup to one LUN
        #[arg(long)]
        lun: Option<u32>,

        /// Read at most this many bytes
        #[arg(long, value_parser = parse_number)]
        length: Option<u64>,
    },

    /// Write a raw or sparse image to a partition
    Write {
        partition: String,

        input: PathBuf,

        #[arg(long)]
        lun: Option<u32>,
    },

    /// Erase a partition
    Erase {
        partition: String,

        #[arg(long)]
        lun: Option<u32>,
    },

    /// Write every image listed in a firmware manifest, then apply its patches
    Flash {
        manifest: PathBuf,

        /// Use the manifest's layout instead of the device table
        #[arg(long)]
        manifest_layout: bool,
    },

    /// Reboot the device
    Reset,

    /// Write the default session configuration to a file
    InitConfig { output: PathBuf },
}

impl Commands {
    /// Whether the command needs a running agent.
    pub fn needs_agent(&self) -> bool {
        !matches!(self, Commands::Probe | Commands::Reset | Commands::InitConfig { .. })
    }
}
