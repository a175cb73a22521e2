//! Command line argument parsing
//!
//! Nucleon - High Performance Matrix Federation Server
//! Author: Nucleon Development Team
//! Date: 2025-09-02
//! Version: 0.3.0-alpha

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "nucleon",
    about = "Nucleon - High Performance Matrix Federation Server",
    version
)]
pub struct Args {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the federation server
    Start {
        /// Override the listen address from the configuration
        #[arg(long)]
        address: Option<String>,

        /// Override the listen port from the configuration
        #[arg(long)]
        port: Option<u16>,
    },

    /// Validate the configuration file and exit
    CheckConfig,
}

pub fn parse() -> Args {
    Args::parse()
}
