use std::process::ExitCode;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod broker;
mod cli;
mod daemon;
mod driver;
mod host;
mod paths;

use cli::{Cli, Command, RuntimeAction};
use paths::RuntimePaths;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let Command::Runtime { action } = cli.command;

    let result = match action {
        RuntimeAction::Start {
            config,
            daemon,
            foreground,
        } => start(paths::resolve(config.as_deref()), daemon, foreground),
        RuntimeAction::Stop { config } => stop(paths::resolve(config.as_deref())),
        RuntimeAction::Restart { config, daemon } => {
            let paths = paths::resolve(config.as_deref());
            stop(paths.clone()).and_then(|_| start(paths, daemon, false))
        }
        RuntimeAction::Status { config } => status(paths::resolve(config.as_deref())),
        RuntimeAction::Install { config } => daemon::install(&paths::resolve(config.as_deref())),
        RuntimeAction::Uninstall { config: _ } => daemon::uninstall(),
        RuntimeAction::Logs {
            config,
            lines,
            follow,
        } => daemon::show_logs(&paths::resolve(config.as_deref()), lines, follow),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            // Lost config writes exit 2 so scripts can retry with a fresh hash.
            let code = e
                .downcast_ref::<mozi_core::config::ConfigError>()
                .map(|c| c.exit_code())
                .unwrap_or(1);
            ExitCode::from(code as u8)
        }
    }
}

fn start(paths: RuntimePaths, daemonize: bool, foreground: bool) -> anyhow::Result<()> {
    // MOZI_DAEMON marks a child already spawned by `-d`; it must not
    // re-daemonize. `-f` always wins.
    let already_detached = std::env::var("MOZI_DAEMON").is_ok();
    if daemonize && !foreground && !already_detached {
        let pid = daemon::spawn_daemon(&paths)?;
        println!("runtime starting in the background (pid {pid})");
        return Ok(());
    }

    init_tracing(&paths)?;
    daemon::write_pid_file(&paths)?;

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(async {
        loop {
            match host::run_host(&paths).await {
                Ok(true) => {
                    info!("restarting host");
                    continue;
                }
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
        }
    });

    daemon::remove_pid_file(&paths);
    result
}

fn stop(paths: RuntimePaths) -> anyhow::Result<()> {
    if daemon::stop(&paths)? {
        println!("runtime stopped");
    } else {
        println!("runtime is not running");
    }
    Ok(())
}

fn status(paths: RuntimePaths) -> anyhow::Result<()> {
    match daemon::status(&paths) {
        Some(pid) => {
            println!("runtime is running (pid {pid})");
            Ok(())
        }
        None => {
            println!("runtime is not running");
            // Status mirrors service conventions: not-running is a failure.
            anyhow::bail!("not running")
        }
    }
}

fn init_tracing(paths: &RuntimePaths) -> anyhow::Result<()> {
    std::fs::create_dir_all(&paths.logs_dir)?;
    let appender = tracing_appender::rolling::never(&paths.logs_dir, "runtime.log");
    let (file_writer, guard) = tracing_appender::non_blocking(appender);
    // Keep the writer alive for the process lifetime.
    Box::leak(Box::new(guard));

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mozi=info,mozi_runtime=info,tower_http=warn".into()),
        )
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .with(fmt::layer())
        .init();
    Ok(())
}
