// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use ambrosia_cli::commands::{inspect, verify};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ambrosia-cli")]
#[command(about = "Offline inspection of Ambrosia logs and checkpoints", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the checkpoints and logs of one `<service>_<version>` directory.
    Inspect {
        dir: PathBuf,

        /// Service name, when the directory name does not give it away.
        #[arg(long)]
        service: Option<String>,

        /// Also print every record header.
        #[arg(long, short)]
        records: bool,

        #[arg(long)]
        json: bool,
    },
    /// Scan a log file and report the first torn record
    Verify { log: PathBuf },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect {
            dir,
            service,
            records,
            json,
        } => inspect::run(&dir, service, records, json),
        Commands::Verify { log } => verify::run(&log),
    }
}
