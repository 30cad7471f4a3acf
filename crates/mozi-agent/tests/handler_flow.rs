//! End-to-end handler tests over a fake host: scripted driver, recording
//! channel adapter, in-memory stores.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use mozi_agent::{HostContext, MessageHandler};
use mozi_channels::{ChannelAdapter, ChannelError, ChannelStatus, TypingShare};
use mozi_core::config::{ConfigStore, EffectiveConfig};
use mozi_core::routes::RouteLedger;
use mozi_core::types::{InboundMessage, OutboundMessage, PeerKind, Phase};
use mozi_dispatch::{
    DispatchKernel, DriverError, KernelConfig, PromptDriver, TurnEvent, TurnRequest,
};
use mozi_sessions::{SessionKey, SessionStore};

#[derive(Debug, Clone, PartialEq)]
enum Recorded {
    Send(String),
    Edit(String),
    Phase(Phase),
}

struct RecordingAdapter {
    log: Mutex<Vec<Recorded>>,
    edits: bool,
}

#[async_trait]
impl ChannelAdapter for RecordingAdapter {
    fn id(&self) -> &str {
        "telegram"
    }
    fn display_name(&self) -> &str {
        "Recording"
    }
    async fn connect(&self) -> Result<(), ChannelError> {
        Ok(())
    }
    async fn disconnect(&self) -> Result<(), ChannelError> {
        Ok(())
    }
    fn status(&self) -> ChannelStatus {
        ChannelStatus::Connected
    }
    async fn send(&self, _peer: &str, msg: &OutboundMessage) -> Result<String, ChannelError> {
        self.log.lock().unwrap().push(Recorded::Send(msg.text.clone()));
        Ok(format!("m{}", self.log.lock().unwrap().len()))
    }
    async fn edit_message(
        &self,
        _id: &str,
        _peer: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        self.log.lock().unwrap().push(Recorded::Edit(text.to_string()));
        Ok(())
    }
    fn supports_edits(&self) -> bool {
        self.edits
    }
    async fn emit_phase(
        &self,
        _peer: &str,
        phase: Phase,
        _payload: Option<serde_json::Value>,
    ) -> Result<(), ChannelError> {
        self.log.lock().unwrap().push(Recorded::Phase(phase));
        Ok(())
    }
}

/// Driver that streams a reply built from the prompt, or fails on demand.
struct EchoDriver;

#[async_trait]
impl PromptDriver for EchoDriver {
    async fn run_turn(
        &self,
        request: TurnRequest,
        _cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<TurnEvent>, DriverError> {
        if request.prompt.contains("fail-auth") {
            return Err(DriverError::AuthMissing {
                key: "OPENAI_API_KEY".into(),
            });
        }
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let _ = tx
                .send(TurnEvent::TextDelta("<think>weighing options</think>".into()))
                .await;
            let _ = tx.send(TurnEvent::TextDelta("partial".into())).await;
            let _ = tx
                .send(TurnEvent::Final(format!("echo: {}", request.prompt)))
                .await;
        });
        Ok(rx)
    }
}

struct TestHost {
    config: ConfigStore,
    sessions: Arc<SessionStore>,
    kernel: DispatchKernel,
    adapter: Arc<RecordingAdapter>,
    typing: TypingShare,
    routes: RouteLedger,
}

impl TestHost {
    fn new(dir: &tempfile::TempDir, edits: bool) -> Arc<Self> {
        let config = ConfigStore::new(dir.path().join("config.jsonc"));
        config
            .patch(
                serde_json::json!({
                    "agents": { "mozi": { "main": true, "model": "anthropic/claude-sonnet-4-5" } },
                    "models": {
                        "anthropic": {
                            "models": [ { "id": "claude-sonnet-4-5", "input": ["text", "image"] } ]
                        }
                    }
                }),
                None,
            )
            .unwrap();
        let sessions =
            Arc::new(SessionStore::new(rusqlite::Connection::open_in_memory().unwrap()).unwrap());
        let kernel = DispatchKernel::new(
            Arc::new(EchoDriver),
            Arc::clone(&sessions),
            KernelConfig::default(),
        );
        Arc::new(Self {
            config,
            sessions,
            kernel,
            adapter: Arc::new(RecordingAdapter {
                log: Mutex::new(Vec::new()),
                edits,
            }),
            typing: TypingShare::new(),
            routes: RouteLedger::new(),
        })
    }

    fn log(&self) -> Vec<Recorded> {
        self.adapter.log.lock().unwrap().clone()
    }
}

impl HostContext for TestHost {
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
        (id == "telegram").then(|| Arc::clone(&self.adapter) as Arc<dyn ChannelAdapter>)
    }
    fn typing(&self) -> &TypingShare {
        &self.typing
    }
    fn routes(&self) -> &RouteLedger {
        &self.routes
    }
    fn reminders(&self) -> Option<&mozi_scheduler::ReminderStore> {
        None
    }
    fn stt(&self) -> Option<Arc<dyn mozi_media::SttEngine>> {
        None
    }
    fn auth(&self) -> Option<Arc<dyn mozi_agent::AuthBroker>> {
        None
    }
    fn memory(&self) -> Option<Arc<dyn mozi_agent::MemoryBroker>> {
        None
    }
    fn classifier(&self) -> Option<Arc<dyn mozi_agent::TopicShiftClassifier>> {
        None
    }
    fn runtime_control(&self) -> Option<Arc<dyn mozi_agent::RuntimeControl>> {
        None
    }
}

fn inbound(text: &str) -> InboundMessage {
    InboundMessage {
        id: "trace-1".into(),
        channel: "telegram".into(),
        peer_id: "42".into(),
        peer_kind: PeerKind::Dm,
        sender_id: "alice".into(),
        sender_name: Some("Alice".into()),
        account_id: None,
        thread_id: None,
        text: text.into(),
        media: Vec::new(),
        reply_to: None,
        timestamp: Utc::now(),
        provider_raw: None,
    }
}

#[tokio::test]
async fn prompt_turn_emits_phases_and_final_reply() {
    let dir = tempfile::tempdir().unwrap();
    let host = TestHost::new(&dir, false);
    let handler = MessageHandler::new(Arc::clone(&host));

    handler.handle(inbound("hello there")).await;

    let log = host.log();
    let phases: Vec<&Recorded> = log
        .iter()
        .filter(|r| matches!(r, Recorded::Phase(_)))
        .collect();
    assert_eq!(
        phases,
        vec![
            &Recorded::Phase(Phase::Thinking),
            &Recorded::Phase(Phase::Speaking),
            &Recorded::Phase(Phase::Idle),
        ]
    );
    // Final wins over streamed, and think blocks never leak.
    let sends: Vec<&Recorded> = log
        .iter()
        .filter(|r| matches!(r, Recorded::Send(_)))
        .collect();
    assert_eq!(sends, vec![&Recorded::Send("echo: hello there".into())]);

    // The prompt branch memoized the route for heartbeat reuse.
    let route = host.routes.get("mozi").unwrap();
    assert_eq!(route.channel, "telegram");
    assert_eq!(route.peer_id, "42");

    // Context was written through.
    let key = SessionKey::parse("agent:mozi:telegram:dm:42");
    let session = host.sessions.get(&key).unwrap().unwrap();
    assert_eq!(session.context.len(), 2);
}

#[tokio::test]
async fn streaming_edits_run_on_edit_capable_channels() {
    let dir = tempfile::tempdir().unwrap();
    let host = TestHost::new(&dir, true);
    let handler = MessageHandler::new(Arc::clone(&host));

    // Long prompt so the streamed visible text crosses the edit stride.
    let long = "x".repeat(400);
    handler.handle(inbound(&long)).await;

    let log = host.log();
    let final_text = format!("echo: {long}");
    // Terminal delivery lands as an edit of the running reply (or a send
    // when the stride was never crossed).
    assert!(log.iter().any(
        |r| matches!(r, Recorded::Edit(t) | Recorded::Send(t) if t == &final_text)
    ));
}

#[tokio::test]
async fn auth_missing_surfaces_remediation_hint() {
    let dir = tempfile::tempdir().unwrap();
    let host = TestHost::new(&dir, false);
    let handler = MessageHandler::new(Arc::clone(&host));

    handler.handle(inbound("please fail-auth now")).await;

    let log = host.log();
    assert!(log.iter().any(|r| matches!(
        r,
        Recorded::Send(t) if t.starts_with("Missing authentication secret OPENAI_API_KEY")
    )));
    // Exactly one user-visible error message for the turn.
    let sends = log
        .iter()
        .filter(|r| matches!(r, Recorded::Send(_)))
        .count();
    assert_eq!(sends, 1);
}

#[tokio::test]
async fn unknown_command_is_silently_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let host = TestHost::new(&dir, false);
    let handler = MessageHandler::new(Arc::clone(&host));

    handler.handle(inbound("/definitely-not-a-command")).await;

    assert!(host.log().is_empty());
}

#[tokio::test]
async fn help_and_stop_commands_reply() {
    let dir = tempfile::tempdir().unwrap();
    let host = TestHost::new(&dir, false);
    let handler = MessageHandler::new(Arc::clone(&host));

    handler.handle(inbound("/help")).await;
    handler.handle(inbound("/stop")).await;

    let log = host.log();
    assert!(log.iter().any(|r| matches!(r, Recorded::Send(t) if t.contains("Mozi commands"))));
    assert!(log
        .iter()
        .any(|r| matches!(r, Recorded::Send(t) if t.contains("Nothing is running"))));
}

#[tokio::test]
async fn localized_intent_routes_to_heartbeat_command() {
    let dir = tempfile::tempdir().unwrap();
    let host = TestHost::new(&dir, false);
    let handler = MessageHandler::new(Arc::clone(&host));

    handler.handle(inbound("取消心跳")).await;

    // Without a configured workspace the command still answers — the
    // point is that the intent did not reach the prompt pipeline.
    let log = host.log();
    assert_eq!(log.len(), 1);
    assert!(matches!(&log[0], Recorded::Send(t) if t.contains("workspace")));
}

#[tokio::test]
async fn switch_command_corrects_typos_and_sets_override() {
    let dir = tempfile::tempdir().unwrap();
    let host = TestHost::new(&dir, false);
    let handler = MessageHandler::new(Arc::clone(&host));

    handler.handle(inbound("/switch claude-sonet-4-5")).await;

    let log = host.log();
    assert!(log.iter().any(|r| matches!(
        r,
        Recorded::Send(t) if t.contains("anthropic/claude-sonnet-4-5") && t.contains("corrected")
    )));

    let key = SessionKey::parse("agent:mozi:telegram:dm:42");
    let session = host.sessions.get(&key).unwrap().unwrap();
    assert_eq!(
        session.model_override(),
        Some("anthropic/claude-sonnet-4-5")
    );
}
