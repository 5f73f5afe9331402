// Command line interface module
// Handles parsing of command line arguments and echoing them to new instances

use clap::Parser;
use std::path::{Path, PathBuf};

/// kiwi-widget - An always-on-top animated GIF widget for Wayland
#[derive(Parser, Debug, Clone, Default, PartialEq, Eq)]
#[command(name = "kiwi-widget")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Folder for the saved window state and downloaded GIFs
    /// (defaults to "Kiwi Widget" in the documents folder)
    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,
}

impl Args {
    /// Arguments for a relaunched or autostarted instance. The data folder is
    /// passed in resolved form so the new process does not depend on our
    /// working directory.
    pub fn echo(&self, resolved_data_dir: &Path) -> Vec<String> {
        match self.data_dir {
            Some(_) => vec![
                "--data-dir".to_string(),
                resolved_data_dir.display().to_string(),
            ],
            None => Vec::new(),
        }
    }
}

/// Parse command line arguments
pub fn parse_args() -> Args {
    Args::parse()
}
