use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "bus", about = "L7 multiplexing bus node")]
pub struct Cli {
    /// Path to the node's INI-style config file.
    #[arg(short, long, value_name = "FILE")]
    pub file: Option<PathBuf>,
}
