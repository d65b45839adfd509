//! Stowage CLI
//!
//! Command-line tools for Stowage.
//!
//! # Commands
//!
//! - `demo` - Replay the tutorial flow against an in-memory backend
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Stowage command-line tools.
#[derive(Parser)]
#[command(name = "stowage")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Save, sign up and query against an in-memory backend over the wire
    Demo {
        /// Number of requests the backend fails before recovering
        #[arg(long, default_value = "0")]
        fail_first: u32,

        /// Attempts per operation before it fails
        #[arg(long, default_value = "5")]
        max_attempts: u32,

        /// Operations allowed in flight at once
        #[arg(long, default_value = "4")]
        concurrency: usize,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Demo {
            fail_first,
            max_attempts,
            concurrency,
            format,
        } => {
            let options = commands::demo::DemoOptions {
                fail_first,
                max_attempts,
                concurrency,
            };
            commands::demo::run(&options, &format)?;
        }
        Commands::Version => {
            println!("Stowage CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Stowage Core v{}", stowage_core::VERSION);
            println!("Stowage Sync v{}", stowage_sync::VERSION);
        }
    }

    Ok(())
}
