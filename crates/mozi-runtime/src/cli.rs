use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "mozi", version, about = "Mozi multi-channel agent runtime")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage the runtime host process.
    Runtime {
        #[command(subcommand)]
        action: RuntimeAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum RuntimeAction {
    /// Start the runtime (foreground by default, `-d` to daemonize).
    Start {
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,
        /// Detach and run in the background.
        #[arg(short = 'd', long)]
        daemon: bool,
        /// Stay attached even when MOZI_DAEMON is set.
        #[arg(short = 'f', long)]
        foreground: bool,
    },
    /// Stop a running runtime via its PID file.
    Stop {
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,
    },
    /// Stop then start.
    Restart {
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,
        #[arg(short = 'd', long)]
        daemon: bool,
    },
    /// Report whether the runtime is running.
    Status {
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,
    },
    /// Install a systemd user unit for the runtime.
    Install {
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,
    },
    /// Remove the systemd user unit.
    Uninstall {
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,
    },
    /// Show the runtime log.
    Logs {
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,
        /// Lines from the end of the log.
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
        /// Keep printing as the log grows.
        #[arg(short = 'f', long)]
        follow: bool,
    },
}
