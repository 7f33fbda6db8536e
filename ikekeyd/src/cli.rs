use std::path::PathBuf;

use clap::Parser;

/// The cli of ikekeyd
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Cli {
    /// Path to the JSON engine configuration
    pub config: PathBuf,

    /// Initiate this connection right after startup
    #[clap(short, long)]
    pub initiate: Option<String>,

    /// Increase log verbosity
    #[clap(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
