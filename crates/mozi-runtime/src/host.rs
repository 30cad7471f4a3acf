//! Host assembly and main loop: construct the stores, kernel, channels,
//! handler, and scheduler; pump inbound events until shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mozi_agent::{AuthBroker, HostContext, MessageHandler, RuntimeControl};
use mozi_channels::{ChannelAdapter, ChannelEvent, ChannelRegistry, ChannelStatus, TypingShare};
use mozi_core::config::{ConfigStore, EffectiveConfig};
use mozi_core::routes::RouteLedger;
use mozi_core::types::OutboundMessage;
use mozi_dispatch::{DispatchKernel, KernelConfig};
use mozi_desktop::DesktopTransport;
use mozi_scheduler::{ReminderStore, SchedulerDelivery, SchedulerEngine};
use mozi_sessions::SessionStore;

use crate::broker::EnvFileBroker;
use crate::driver::ExecDriver;
use crate::paths::RuntimePaths;

pub struct Host {
    config: Arc<ConfigStore>,
    sessions: Arc<SessionStore>,
    kernel: DispatchKernel,
    registry: Arc<ChannelRegistry>,
    typing: TypingShare,
    routes: Arc<RouteLedger>,
    reminders: Arc<ReminderStore>,
    auth: Option<Arc<dyn AuthBroker>>,
    control: Arc<ControlHandle>,
}

impl HostContext for Host {
    fn config(&self) -> Option<EffectiveConfig> {
        self.config.snapshot().ok().and_then(|s| s.typed())
    }
    fn sessions(&self) -> &SessionStore {
        &self.sessions
    }
    fn kernel(&self) -> &DispatchKernel {
        &self.kernel
    }
    fn channel(&self, id: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.registry.get(id)
    }
    fn typing(&self) -> &TypingShare {
        &self.typing
    }
    fn routes(&self) -> &RouteLedger {
        &self.routes
    }
    fn reminders(&self) -> Option<&ReminderStore> {
        Some(&self.reminders)
    }
    fn stt(&self) -> Option<Arc<dyn mozi_media::SttEngine>> {
        // STT/TTS providers are plug-ins; none ship with the core host.
        None
    }
    fn auth(&self) -> Option<Arc<dyn AuthBroker>> {
        self.auth.clone()
    }
    fn memory(&self) -> Option<Arc<dyn mozi_agent::MemoryBroker>> {
        None
    }
    fn classifier(&self) -> Option<Arc<dyn mozi_agent::TopicShiftClassifier>> {
        None
    }
    fn runtime_control(&self) -> Option<Arc<dyn RuntimeControl>> {
        Some(Arc::clone(&self.control) as Arc<dyn RuntimeControl>)
    }
}

/// `/restart` support: flips the flag and tears the run loop down; the
/// outer start loop decides whether to go again.
pub struct ControlHandle {
    cancel: CancellationToken,
    restart: AtomicBool,
}

#[async_trait]
impl RuntimeControl for ControlHandle {
    async fn restart(&self) -> Result<(), String> {
        info!("runtime restart requested");
        self.restart.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        Ok(())
    }
}

/// Run the host once. Returns `true` when a restart was requested.
pub async fn run_host(paths: &RuntimePaths) -> Result<bool> {
    let config_store = Arc::new(ConfigStore::new(&paths.config_file));
    let snapshot = config_store.snapshot()?;
    if !snapshot.load_success {
        for problem in &snapshot.load_errors {
            error!(%problem, "config problem");
        }
        anyhow::bail!("configuration at {} is invalid", paths.config_file.display());
    }
    let config = snapshot.typed();
    if config.is_none() {
        warn!("running with an empty configuration document");
    }

    std::fs::create_dir_all(&paths.data_dir)?;
    let sessions = Arc::new(
        SessionStore::new(
            rusqlite::Connection::open(&paths.db_file)
                .with_context(|| format!("opening {}", paths.db_file.display()))?,
        )
        .context("initialising session store")?,
    );
    sessions.load().context("loading sessions")?;
    let reminders = Arc::new(
        ReminderStore::new(rusqlite::Connection::open(&paths.db_file)?)
            .context("initialising reminder store")?,
    );

    let turn_timeout = config
        .as_ref()
        .and_then(|c| c.runtime.queue.turn_timeout.as_deref())
        .and_then(|s| mozi_core::duration::parse_duration(s).ok())
        .unwrap_or(mozi_dispatch::DEFAULT_TURN_TIMEOUT);
    let driver = Arc::new(ExecDriver::from_config(config.as_ref()));
    let kernel = DispatchKernel::new(
        driver,
        Arc::clone(&sessions),
        KernelConfig { turn_timeout },
    );

    let (mut registry, mut channel_events) = ChannelRegistry::new(256);
    let desktop_config = config
        .as_ref()
        .map(|c| c.channels.local_desktop.clone())
        .unwrap_or_default();
    if desktop_config.enabled {
        let sink = registry.sink(mozi_desktop::CHANNEL_ID);
        let tts_voice = config.as_ref().and_then(|c| c.voice.tts.voice.clone());
        let desktop = Arc::new(DesktopTransport::new(
            desktop_config, sink, None, None, tts_voice,
        ));
        registry.register(desktop);
    } else {
        info!("local desktop transport disabled");
    }
    let registry = Arc::new(registry);

    let cancel = CancellationToken::new();
    let control = Arc::new(ControlHandle {
        cancel: cancel.clone(),
        restart: AtomicBool::new(false),
    });

    let auth_enabled = config
        .as_ref()
        .map(|c| c.runtime.auth.enabled)
        .unwrap_or(true);
    let auth: Option<Arc<dyn AuthBroker>> = if auth_enabled {
        let key = mozi_core::secrets::load_or_create_key(&paths.key_file)
            .context("loading secret key")?;
        Some(Arc::new(EnvFileBroker::new(paths.env_file.clone(), key)))
    } else {
        None
    };

    let routes = Arc::new(RouteLedger::new());
    let host = Arc::new(Host {
        config: Arc::clone(&config_store),
        sessions,
        kernel,
        registry: Arc::clone(&registry),
        typing: TypingShare::new(),
        routes: Arc::clone(&routes),
        reminders: Arc::clone(&reminders),
        auth,
        control: Arc::clone(&control),
    });
    let handler = Arc::new(MessageHandler::new(Arc::clone(&host)));

    // Scheduler: clock-driven deliveries re-enter the same pipeline.
    let (delivery_tx, mut deliveries) = mpsc::channel::<SchedulerDelivery>(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = SchedulerEngine::new(
        Arc::clone(&config_store),
        Arc::clone(&reminders),
        routes,
        delivery_tx,
    );
    let scheduler_task = tokio::spawn(engine.run(shutdown_rx));

    registry.connect_all(&cancel);
    info!("mozi runtime host started");

    loop {
        tokio::select! {
            event = channel_events.recv() => {
                match event {
                    Some(ChannelEvent::Message(msg)) => {
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move { handler.handle(msg).await });
                    }
                    Some(ChannelEvent::Status { channel, status }) => {
                        if let ChannelStatus::Error(reason) = &status {
                            warn!(channel = %channel, %reason, "channel error status");
                        } else {
                            info!(channel = %channel, ?status, "channel status");
                        }
                    }
                    Some(ChannelEvent::Error { channel, message }) => {
                        warn!(channel = %channel, %message, "channel error");
                    }
                    None => break,
                }
            }
            delivery = deliveries.recv() => {
                match delivery {
                    Some(SchedulerDelivery::Inbound(msg)) => {
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move { handler.handle(msg).await });
                    }
                    Some(SchedulerDelivery::Direct { channel, peer_id, text }) => {
                        if let Some(adapter) = registry.get(&channel) {
                            if let Err(e) = adapter
                                .send(&peer_id, &OutboundMessage::text(text))
                                .await
                            {
                                warn!(channel = %channel, error = %e, "direct delivery failed");
                            }
                        } else {
                            warn!(channel = %channel, "direct delivery: channel not registered");
                        }
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
            _ = cancel.cancelled() => {
                info!("shutdown signalled");
                break;
            }
        }
    }

    cancel.cancel();
    let _ = shutdown_tx.send(true);
    registry.disconnect_all().await;
    let _ = scheduler_task.await;
    info!("mozi runtime host stopped");

    Ok(control.restart.load(Ordering::SeqCst))
}
