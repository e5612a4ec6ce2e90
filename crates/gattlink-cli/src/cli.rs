//! Command-line interface definitions and parsing

use clap::{ArgGroup, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "gattlink", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path (defaults to ./gattlink.toml)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Device address, e.g. AA:BB:CC:DD:EE:FF
    #[arg(short, long)]
    pub address: Option<String>,

    /// Display name for the device
    #[arg(short, long)]
    pub name: Option<String>,

    /// Payload profile (see `gattlink profiles`)
    #[arg(short, long)]
    pub profile: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Connect and print state changes and events until Ctrl+C
    Monitor,
    /// Read a characteristic (the command characteristic by default)
    Read {
        /// Characteristic UUID
        #[arg(long)]
        characteristic: Option<String>,
    },
    /// Write a comma separated payload and wait for it to be verified
    Write {
        /// Payload fields, e.g. 50,80,255,0,128
        payload: String,
    },
    /// Write the all-zero payload
    Off,
    /// Read a descriptor value
    ReadDescriptor {
        /// Characteristic UUID
        characteristic: String,
        /// Descriptor UUID
        descriptor: String,
    },
    /// Write a descriptor value given as text or hex
    #[command(group(ArgGroup::new("value").required(true).args(["text", "hex"])))]
    WriteDescriptor {
        /// Characteristic UUID
        characteristic: String,
        /// Descriptor UUID
        descriptor: String,
        /// Value sent as UTF-8 text
        #[arg(long)]
        text: Option<String>,
        /// Value given as hex digits, whitespace ignored
        #[arg(long)]
        hex: Option<String>,
    },
    /// Enable notifications and print updates until Ctrl+C
    Notify {
        /// Characteristic UUID (the command characteristic by default)
        #[arg(long)]
        characteristic: Option<String>,
    },
    /// List built-in payload profiles
    Profiles,
    /// Print the effective configuration as TOML
    ShowConfig,
}
