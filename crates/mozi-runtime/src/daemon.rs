//! Process management: PID file, daemonization, stop/status, log viewing,
//! and the systemd user unit.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};

use crate::paths::RuntimePaths;

pub fn write_pid_file(paths: &RuntimePaths) -> Result<()> {
    fs::create_dir_all(&paths.data_dir)?;
    fs::write(&paths.pid_file, std::process::id().to_string())
        .with_context(|| format!("writing {}", paths.pid_file.display()))?;
    Ok(())
}

pub fn remove_pid_file(paths: &RuntimePaths) {
    let _ = fs::remove_file(&paths.pid_file);
}

pub fn read_pid(paths: &RuntimePaths) -> Option<u32> {
    fs::read_to_string(&paths.pid_file)
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Signal 0 probe — works for any process we own.
pub fn is_alive(pid: u32) -> bool {
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Re-exec ourselves detached, logging to the runtime log file.
pub fn spawn_daemon(paths: &RuntimePaths) -> Result<u32> {
    if let Some(pid) = read_pid(paths) {
        if is_alive(pid) {
            bail!("runtime already running with pid {pid}");
        }
    }
    fs::create_dir_all(&paths.logs_dir)?;
    let log = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.log_file)?;
    let exe = std::env::current_exe().context("resolving current executable")?;

    let child = Command::new(exe)
        .args([
            "runtime",
            "start",
            "--foreground",
            "-c",
            &paths.config_file.to_string_lossy(),
        ])
        .env("MOZI_DAEMON", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log))
        .spawn()
        .context("spawning daemon process")?;
    Ok(child.id())
}

/// SIGTERM the recorded PID and wait for it to exit.
pub fn stop(paths: &RuntimePaths) -> Result<bool> {
    let Some(pid) = read_pid(paths) else {
        return Ok(false);
    };
    if !is_alive(pid) {
        remove_pid_file(paths);
        return Ok(false);
    }

    Command::new("kill")
        .arg(pid.to_string())
        .status()
        .context("sending SIGTERM")?;

    for _ in 0..50 {
        if !is_alive(pid) {
            remove_pid_file(paths);
            return Ok(true);
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
    bail!("runtime (pid {pid}) did not exit within 5s");
}

pub fn status(paths: &RuntimePaths) -> Option<u32> {
    read_pid(paths).filter(|pid| is_alive(*pid))
}

/// Print the last `lines` of the log; with `follow`, keep tailing.
pub fn show_logs(paths: &RuntimePaths, lines: usize, follow: bool) -> Result<()> {
    let content = fs::read_to_string(&paths.log_file).unwrap_or_default();
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    for line in &all[start..] {
        println!("{line}");
    }
    if !follow {
        return Ok(());
    }

    let mut file = fs::File::open(&paths.log_file)
        .with_context(|| format!("opening {}", paths.log_file.display()))?;
    let mut offset = file.seek(SeekFrom::End(0))?;
    loop {
        std::thread::sleep(std::time::Duration::from_millis(500));
        let len = file.metadata()?.len();
        if len < offset {
            // Truncated/rotated; start over from the top.
            offset = 0;
        }
        if len > offset {
            file.seek(SeekFrom::Start(offset))?;
            let mut buf = String::new();
            file.read_to_string(&mut buf)?;
            print!("{buf}");
            offset = len;
        }
    }
}

const UNIT_NAME: &str = "mozi.service";

fn unit_path() -> std::path::PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home)
        .join(".config/systemd/user")
        .join(UNIT_NAME)
}

pub fn install(paths: &RuntimePaths) -> Result<()> {
    let exe = std::env::current_exe()?;
    let unit = format!(
        "[Unit]\nDescription=Mozi agent runtime\nAfter=network-online.target\n\n\
         [Service]\nExecStart={} runtime start --foreground -c {}\nRestart=on-failure\n\n\
         [Install]\nWantedBy=default.target\n",
        exe.display(),
        paths.config_file.display()
    );
    let path = unit_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, unit)?;
    println!("Installed {}", path.display());
    println!("Enable with: systemctl --user enable --now {UNIT_NAME}");
    Ok(())
}

pub fn uninstall() -> Result<()> {
    let path = unit_path();
    if path.exists() {
        fs::remove_file(&path)?;
        println!("Removed {}", path.display());
    } else {
        println!("No unit installed at {}", path.display());
    }
    Ok(())
}
