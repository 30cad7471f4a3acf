//! Subprocess prompt driver.
//!
//! The LLM client proper is a separate crate behind the [`PromptDriver`]
//! seam; what ships here is the exec-style driver that pipes the composed
//! prompt into a configured command (`agents.defaults.exec`) and streams
//! its stdout back as turn events. Cancellation kills the child.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mozi_core::config::EffectiveConfig;
use mozi_dispatch::{DriverError, PromptDriver, TurnEvent, TurnRequest};

#[derive(Debug, Clone)]
struct ExecSpec {
    command: String,
    args: Vec<String>,
}

pub struct ExecDriver {
    exec: Option<ExecSpec>,
}

impl ExecDriver {
    /// Read `agents.defaults.exec.{command, args}` from the config.
    pub fn from_config(config: Option<&EffectiveConfig>) -> Self {
        let exec = config
            .and_then(|c| c.agents.defaults.exec.as_ref())
            .and_then(|value| {
                let command = value.get("command")?.as_str()?.to_string();
                let args = value
                    .get("args")
                    .and_then(|a| a.as_array())
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                Some(ExecSpec { command, args })
            });
        Self { exec }
    }
}

#[async_trait]
impl PromptDriver for ExecDriver {
    async fn run_turn(
        &self,
        request: TurnRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<TurnEvent>, DriverError> {
        let Some(exec) = self.exec.clone() else {
            return Err(DriverError::Model(
                "no prompt driver configured; set agents.defaults.exec.command".to_string(),
            ));
        };

        let mut child = tokio::process::Command::new(&exec.command)
            .args(&exec.args)
            .arg("--model")
            .arg(&request.model)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DriverError::Transport(format!("spawn {}: {e}", exec.command)))?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            DriverError::Transport("child stdin unavailable".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            DriverError::Transport("child stdout unavailable".to_string())
        })?;

        let prompt = request.prompt.clone();
        let trace_id = request.trace_id.clone();
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                warn!(trace_id, error = %e, "prompt write failed");
            }
            drop(stdin);

            let mut lines = BufReader::new(stdout).lines();
            let mut full = String::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(trace_id, "turn cancelled; killing child");
                        let _ = child.start_kill();
                        return;
                    }
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                if !full.is_empty() {
                                    full.push('\n');
                                }
                                full.push_str(&line);
                                let mut delta = line;
                                delta.push('\n');
                                if tx.send(TurnEvent::TextDelta(delta)).await.is_err() {
                                    let _ = child.start_kill();
                                    return;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                let _ = tx
                                    .send(TurnEvent::Error(DriverError::Transport(e.to_string())))
                                    .await;
                                return;
                            }
                        }
                    }
                }
            }

            match child.wait().await {
                Ok(status) if status.success() => {
                    let _ = tx.send(TurnEvent::Final(full)).await;
                }
                Ok(status) => {
                    let _ = tx
                        .send(TurnEvent::Error(DriverError::Model(format!(
                            "driver command exited with {status}"
                        ))))
                        .await;
                }
                Err(e) => {
                    let _ = tx
                        .send(TurnEvent::Error(DriverError::Transport(e.to_string())))
                        .await;
                }
            }
        });

        Ok(rx)
    }
}
