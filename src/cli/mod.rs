//! CLI commands module.

mod config_cmd;
mod init;
mod run;
mod terminal;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

pub use config_cmd::cmd_config;
pub use init::cmd_init;
pub use run::{cmd_run, RunOptions};
pub use terminal::TerminalIo;

#[derive(Parser)]
#[command(
    name = "sandbox-bridge",
    version,
    about = "sandbox-bridge: run untrusted programs with synchronous stdin and fetch"
)]
struct Cli {
    /// Config file (defaults to ~/.sandbox-bridge/config.json).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file.
    Init,

    /// Run a program in a fresh sandbox, wired to this terminal.
    Run {
        /// Program JSON file.
        program: PathBuf,

        /// After the real run finishes, replay it against the recorded I/O.
        #[arg(long)]
        replay: bool,

        /// Save the recorded stdin and fetch traffic to this file.
        #[arg(long, value_name = "FILE")]
        save_playback: Option<PathBuf>,

        /// Skip the real run and replay a previously saved recording.
        #[arg(long, value_name = "FILE", conflicts_with = "replay")]
        playback: Option<PathBuf>,
    },

    /// Print the effective configuration.
    Config,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => cmd_init(cli.config).await,
        Commands::Run {
            program,
            replay,
            save_playback,
            playback,
        } => {
            cmd_run(RunOptions {
                program,
                config: cli.config,
                replay,
                save_playback,
                playback,
            })
            .await
        }
        Commands::Config => cmd_config(cli.config).await,
    }
}
