//! Pipeline orchestrator
//!
//! Owns the turn state machine and the per-turn cancellation token, wires
//! the stages together, and enforces the pipeline invariants:
//! - at most one (chat stream, TTS session) pair exists at a time,
//! - no audio for a cancelled turn reaches the speaker after the cancel is
//!   acknowledged,
//! - assistant messages reach history only through the `Completed`
//!   transition, and the memory store is updated exactly once per completed
//!   turn, after history.
//!
//! The supervisor task reacts to stage events on a command channel; each
//! turn runs in its own task owning the chat stream and TTS session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use voiceloop_audio::AecProcessor;
use voiceloop_config::{RoleConfig, RoleLibrary, Settings};
use voiceloop_core::{
    AsrProvider, AsrSession, AudioFrame, AudioSink, AudioSource, CancelReason, CancellationToken,
    ChatEvent, ChatMessage, ChatProvider, ChatStream, ConversationHistory, ConversationMessage,
    Error, GenerationParams, MemoryStore, ReferenceFrame, Result, Transcript, TtsProvider,
    TtsSession, TurnId, TurnOutcome, TurnReport, TurnState, Utterance,
};
use voiceloop_text::{SanitizerConfig, TextSanitizer};

use crate::barge_in::{BargeInConfig, BargeInController};
use crate::events::{PipelineEvent, StateCell};

/// Deadline applied to every memory-store call
const MEMORY_DEADLINE: Duration = Duration::from_millis(500);
/// Supervisor housekeeping cadence
const TICK: Duration = Duration::from_millis(250);
/// Graceful stop budget
const STOP_BUDGET: Duration = Duration::from_secs(2);

/// Orchestrator commands. Stage tasks and the barge-in controller write
/// here; only the supervisor reads.
pub(crate) enum Command {
    SubmitText(String),
    Transcript(Transcript),
    CancelTurn(CancelReason),
    TurnFinished {
        turn: TurnId,
        outcome: TurnOutcome,
        assistant_text: String,
        user_text: String,
    },
    Stop,
}

/// Pipeline tunables, usually derived from [`Settings`]
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub user_id: String,
    pub role: RoleConfig,
    pub params: GenerationParams,
    pub history_limit: usize,
    pub memory_enabled: bool,
    pub memory_limit: usize,
    pub barge_in: BargeInConfig,
    /// Capture carries `{mic, reference}` channels from an aggregate device
    pub aggregate_capture: bool,
    pub asr_final_timeout: Duration,
    pub llm_first_token_timeout: Duration,
    pub tts_first_frame_timeout: Duration,
    pub sanitizer: SanitizerConfig,
}

impl PipelineConfig {
    pub fn from_settings(settings: &Settings, role: RoleConfig) -> Self {
        Self {
            user_id: settings.user_id.clone(),
            role,
            params: settings.llm.generation_params(),
            history_limit: settings.pipeline.history_limit,
            memory_enabled: settings.memory.enabled,
            memory_limit: settings.memory.limit,
            barge_in: BargeInConfig {
                min_chars: settings.pipeline.barge_in_min_chars,
                grace: Duration::from_millis(settings.pipeline.barge_in_grace_ms),
                software_aec_active: settings.audio.aec.enabled && !settings.audio.aggregate_device,
            },
            aggregate_capture: settings.audio.aggregate_device,
            asr_final_timeout: Duration::from_millis(settings.pipeline.asr_final_timeout_ms),
            llm_first_token_timeout: Duration::from_millis(
                settings.pipeline.llm_first_token_timeout_ms,
            ),
            tts_first_frame_timeout: Duration::from_millis(
                settings.pipeline.tts_first_frame_timeout_ms,
            ),
            sanitizer: SanitizerConfig::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let role = RoleLibrary::builtin()
            .get("default")
            .expect("builtin role")
            .clone();
        Self::from_settings(&Settings::default(), role)
    }
}

/// Collaborators injected at construction
pub struct PipelineDeps {
    pub chat: Arc<dyn ChatProvider>,
    pub tts: Arc<dyn TtsProvider>,
    pub memory: Arc<dyn MemoryStore>,
    pub playback: Arc<dyn AudioSink>,
    /// Voice mode only
    pub asr: Option<Arc<dyn AsrProvider>>,
    /// Voice mode only
    pub capture: Option<Box<dyn AudioSource>>,
    /// Software or aggregate echo cancellation; `None` passes capture through
    pub aec: Option<AecProcessor>,
}

struct Boot {
    config: PipelineConfig,
    deps: PipelineDeps,
    cmd_rx: mpsc::Receiver<Command>,
    status_tx: watch::Sender<Option<TurnReport>>,
}

/// The assembled pipeline
pub struct Pipeline {
    cmd_tx: mpsc::Sender<Command>,
    events: broadcast::Sender<PipelineEvent>,
    state: Arc<StateCell>,
    status_rx: watch::Receiver<Option<TurnReport>>,
    history: Arc<Mutex<ConversationHistory>>,
    shutdown: CancellationToken,
    boot: Mutex<Option<Boot>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, deps: PipelineDeps) -> Self {
        let (events, _) = broadcast::channel(256);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (status_tx, status_rx) = watch::channel(None);
        let state = Arc::new(StateCell::new(events.clone()));
        let history = Arc::new(Mutex::new(ConversationHistory::new(config.history_limit)));

        Self {
            cmd_tx,
            events,
            state,
            status_rx,
            history,
            shutdown: CancellationToken::new(),
            boot: Mutex::new(Some(Boot {
                config,
                deps,
                cmd_rx,
                status_tx,
            })),
            supervisor: Mutex::new(None),
        }
    }

    /// Bring up all stages: open the recognition session, start capture and
    /// the supervisory task
    pub async fn start(&self) -> Result<()> {
        let boot = self
            .boot
            .lock()
            .take()
            .ok_or_else(|| Error::Config("pipeline already started".into()))?;
        let Boot {
            config,
            mut deps,
            cmd_rx,
            status_tx,
        } = boot;

        let asr: Option<Arc<dyn AsrSession>> = match deps.asr.clone() {
            Some(provider) => Some(provider.open().await?),
            None => None,
        };

        if let Some(capture) = deps.capture.as_mut() {
            if let Some(asr_session) = asr.clone() {
                capture.start()?;
                let frames = capture
                    .frames()
                    .ok_or_else(|| Error::CaptureFailed("frame channel already taken".into()))?;
                let references = if deps.aec.is_some() && !config.aggregate_capture {
                    Some(deps.playback.reference_frames())
                } else {
                    None
                };
                tokio::spawn(run_capture_feed(
                    frames,
                    deps.aec.take(),
                    references,
                    asr_session,
                    config.aggregate_capture,
                    self.shutdown.clone(),
                ));
            }
        }

        if let Some(asr_session) = asr.clone() {
            tokio::spawn(run_asr_events(
                asr_session.transcripts(),
                self.cmd_tx.clone(),
                self.shutdown.clone(),
            ));
            let controller = BargeInController::new(
                config.barge_in.clone(),
                Arc::clone(&self.state),
                Arc::clone(&deps.playback),
                self.cmd_tx.clone(),
            );
            tokio::spawn(controller.run(asr_session.transcripts(), self.shutdown.clone()));
        }

        let memory = config.memory_enabled.then(|| Arc::clone(&deps.memory));
        let supervisor = Supervisor {
            config,
            chat: deps.chat,
            tts: deps.tts,
            memory,
            playback: deps.playback,
            asr,
            capture: deps.capture,
            state: Arc::clone(&self.state),
            events: self.events.clone(),
            history: Arc::clone(&self.history),
            cmd_rx,
            cmd_tx: self.cmd_tx.clone(),
            status_tx,
            next_turn: TurnId::new(1),
            current: None,
            pending_text: None,
            cancel_reason: None,
            last_asr_activity: None,
            asr_flush_requested: false,
            shutdown: self.shutdown.clone(),
        };
        *self.supervisor.lock() = Some(tokio::spawn(supervisor.run()));

        tracing::info!("pipeline started");
        Ok(())
    }

    /// Start a turn from typed input. While the assistant is replying this
    /// is treated exactly as a barge-in.
    pub async fn submit_text(&self, text: impl Into<String>) -> Result<()> {
        self.cmd_tx
            .send(Command::SubmitText(text.into()))
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Cancel the in-flight turn, if any
    pub async fn cancel_current_turn(&self) -> Result<()> {
        self.cmd_tx
            .send(Command::CancelTurn(CancelReason::Explicit))
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Graceful shutdown: cancels the active turn, closes sessions, drains
    /// playback. Returns within two seconds.
    pub async fn stop(&self) -> Result<()> {
        if self.boot.lock().is_some() {
            // never started
            return Ok(());
        }
        let _ = self.cmd_tx.send(Command::Stop).await;
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(STOP_BUDGET, handle).await.is_err() {
                tracing::warn!("supervisor missed the stop budget, forcing shutdown");
                self.shutdown.cancel();
            }
        }
        tracing::info!("pipeline stopped");
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Read-only status channel carrying the latest finished turn
    pub fn status(&self) -> watch::Receiver<Option<TurnReport>> {
        self.status_rx.clone()
    }

    pub fn state(&self) -> TurnState {
        self.state.get()
    }

    /// Snapshot of the conversation history
    pub fn history(&self) -> Vec<ConversationMessage> {
        self.history.lock().messages().cloned().collect()
    }
}

struct ActiveTurn {
    turn: TurnId,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Supervisor {
    config: PipelineConfig,
    chat: Arc<dyn ChatProvider>,
    tts: Arc<dyn TtsProvider>,
    memory: Option<Arc<dyn MemoryStore>>,
    playback: Arc<dyn AudioSink>,
    asr: Option<Arc<dyn AsrSession>>,
    capture: Option<Box<dyn AudioSource>>,
    state: Arc<StateCell>,
    events: broadcast::Sender<PipelineEvent>,
    history: Arc<Mutex<ConversationHistory>>,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    status_tx: watch::Sender<Option<TurnReport>>,
    next_turn: TurnId,
    current: Option<ActiveTurn>,
    pending_text: Option<String>,
    cancel_reason: Option<CancelReason>,
    last_asr_activity: Option<Instant>,
    asr_flush_requested: bool,
    shutdown: CancellationToken,
}

impl Supervisor {
    async fn run(mut self) {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Stop) | None => break,
                    Some(Command::SubmitText(text)) => self.handle_submit_text(text).await,
                    Some(Command::Transcript(t)) => self.handle_transcript(t).await,
                    Some(Command::CancelTurn(reason)) => self.handle_cancel(reason),
                    Some(Command::TurnFinished { turn, outcome, assistant_text, user_text }) => {
                        self.handle_turn_finished(turn, outcome, assistant_text, user_text).await;
                    }
                },
                _ = tick.tick() => self.check_asr_timeout().await,
            }
        }
        self.cleanup().await;
    }

    async fn handle_submit_text(&mut self, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }
        let state = self.state.get();
        if state.is_assistant_active() {
            self.pending_text = Some(text);
            self.handle_cancel(CancelReason::BargeIn);
        } else if state == TurnState::Cancelling {
            self.pending_text = Some(text);
        } else {
            self.start_turn(text).await;
        }
    }

    async fn handle_transcript(&mut self, transcript: Transcript) {
        self.last_asr_activity = Some(Instant::now());

        if !transcript.is_final {
            let _ = self
                .events
                .send(PipelineEvent::PartialTranscript(transcript));
            if self.state.get() == TurnState::Idle {
                self.state.set(TurnState::Listening);
            }
            return;
        }

        self.asr_flush_requested = false;
        let _ = self
            .events
            .send(PipelineEvent::FinalTranscript(transcript.clone()));
        let text = transcript.text.trim().to_string();

        match self.state.get() {
            TurnState::Idle | TurnState::Listening => {
                self.state.set(TurnState::Recognizing);
                if text.is_empty() {
                    // nothing recognizable was said; the turn collapses
                    self.state.set(TurnState::Idle);
                } else {
                    self.start_turn(text).await;
                }
            }
            // a final arriving while the assistant replies (or while the
            // cancel is still acknowledged) opens the next turn
            _ => {
                if !text.is_empty() {
                    self.pending_text = Some(text);
                }
            }
        }
    }

    fn handle_cancel(&mut self, reason: CancelReason) {
        if !self.state.get().is_assistant_active() {
            // repeated barge-in during Cancelling is a no-op
            return;
        }
        let Some(active) = &self.current else {
            return;
        };
        tracing::info!(turn = %active.turn, ?reason, "cancelling in-flight turn");
        self.state.set(TurnState::Cancelling);
        self.cancel_reason = Some(reason);
        active.cancel.cancel();
        // the playback bound is the tightest; do not wait for the turn task
        self.playback.abort();
        if reason == CancelReason::BargeIn {
            let _ = self.events.send(PipelineEvent::BargeIn { turn: active.turn });
        }
    }

    async fn handle_turn_finished(
        &mut self,
        turn: TurnId,
        outcome: TurnOutcome,
        assistant_text: String,
        user_text: String,
    ) {
        let Some(active) = self.current.take() else {
            return;
        };
        if active.turn != turn {
            self.current = Some(active);
            return;
        }
        let _ = active.handle.await;

        let final_outcome = match (&outcome, self.cancel_reason.take()) {
            (TurnOutcome::Cancelled(_), Some(reason)) => TurnOutcome::Cancelled(reason),
            _ => outcome,
        };

        match &final_outcome {
            TurnOutcome::Completed => {
                self.state.set(TurnState::Completed);
                let reply = assistant_text.trim();
                if !reply.is_empty() {
                    self.history.lock().push_assistant(reply.to_string(), turn);
                }
                if let Some(memory) = &self.memory {
                    let record = memory.record_turn(&self.config.user_id, &user_text, reply);
                    if tokio::time::timeout(MEMORY_DEADLINE, record).await.is_err() {
                        tracing::warn!("memory record_turn missed its deadline");
                    }
                }
            }
            TurnOutcome::Cancelled(reason) => {
                tracing::info!(%turn, ?reason, "turn cancelled");
            }
            TurnOutcome::Failed(kind) => {
                tracing::error!(%turn, ?kind, "turn failed; pipeline stays up");
                self.state.set(TurnState::Failed);
            }
        }

        self.status_tx.send_replace(Some(TurnReport {
            turn,
            outcome: final_outcome.clone(),
        }));
        let _ = self.events.send(PipelineEvent::TurnFinished(TurnReport {
            turn,
            outcome: final_outcome,
        }));
        self.state.set(TurnState::Idle);

        if let Some(text) = self.pending_text.take() {
            self.start_turn(text).await;
        }
    }

    async fn start_turn(&mut self, text: String) {
        let turn = self.next_turn;
        self.next_turn = turn.next();

        self.history.lock().push_user(text.clone(), turn);
        let _ = self.events.send(PipelineEvent::UserText {
            turn,
            text: text.clone(),
        });
        self.state.set(TurnState::Generating);

        let cancel = CancellationToken::new();
        let history_messages = self.history.lock().to_chat_messages();
        let ctx = TurnContext {
            turn,
            user_text: text,
            cancel: cancel.clone(),
            chat: Arc::clone(&self.chat),
            tts: Arc::clone(&self.tts),
            memory: self.memory.clone(),
            playback: Arc::clone(&self.playback),
            state: Arc::clone(&self.state),
            events: self.events.clone(),
            cmd_tx: self.cmd_tx.clone(),
            system_prompt: self.config.role.system_prompt.clone(),
            history_messages,
            user_id: self.config.user_id.clone(),
            params: self.config.params,
            memory_limit: self.config.memory_limit,
            llm_first_token_timeout: self.config.llm_first_token_timeout,
            tts_first_frame_timeout: self.config.tts_first_frame_timeout,
            sanitizer: self.config.sanitizer,
        };
        let handle = tokio::spawn(run_turn(ctx));
        self.current = Some(ActiveTurn {
            turn,
            cancel,
            handle,
        });
    }

    /// Force an ASR flush when listening has stalled without a final
    async fn check_asr_timeout(&mut self) {
        if self.state.get() != TurnState::Listening || self.asr_flush_requested {
            return;
        }
        let Some(asr) = &self.asr else { return };
        let Some(last) = self.last_asr_activity else {
            return;
        };
        if last.elapsed() >= self.config.asr_final_timeout {
            tracing::debug!("no final transcript in time, forcing ASR flush");
            self.asr_flush_requested = true;
            if let Err(e) = asr.flush().await {
                tracing::warn!(error = %e, "ASR flush failed");
            }
        }
    }

    async fn cleanup(&mut self) {
        if let Some(active) = self.current.take() {
            active.cancel.cancel();
            let _ = tokio::time::timeout(Duration::from_millis(500), active.handle).await;
        }
        if let Some(capture) = self.capture.as_mut() {
            capture.stop();
        }
        if let Some(asr) = &self.asr {
            let _ = asr.close().await;
        }
        let _ = tokio::time::timeout(Duration::from_secs(1), self.playback.flush()).await;
        self.shutdown.cancel();
    }
}

struct TurnContext {
    turn: TurnId,
    user_text: String,
    cancel: CancellationToken,
    chat: Arc<dyn ChatProvider>,
    tts: Arc<dyn TtsProvider>,
    memory: Option<Arc<dyn MemoryStore>>,
    playback: Arc<dyn AudioSink>,
    state: Arc<StateCell>,
    events: broadcast::Sender<PipelineEvent>,
    cmd_tx: mpsc::Sender<Command>,
    system_prompt: String,
    history_messages: Vec<ChatMessage>,
    user_id: String,
    params: GenerationParams,
    memory_limit: usize,
    llm_first_token_timeout: Duration,
    tts_first_frame_timeout: Duration,
    sanitizer: SanitizerConfig,
}

async fn run_turn(ctx: TurnContext) {
    let (outcome, assistant_text) = drive_turn(&ctx).await;
    let _ = ctx
        .cmd_tx
        .send(Command::TurnFinished {
            turn: ctx.turn,
            outcome,
            assistant_text,
            user_text: ctx.user_text.clone(),
        })
        .await;
}

enum ChatNext {
    Event(ChatEvent),
    Closed,
    Cancelled,
    Timeout,
}

async fn next_chat_event(
    stream: &mut ChatStream,
    cancel: &CancellationToken,
    first_timeout: Option<Duration>,
) -> ChatNext {
    match first_timeout {
        Some(limit) => tokio::select! {
            _ = cancel.cancelled() => ChatNext::Cancelled,
            next = tokio::time::timeout(limit, stream.events.recv()) => match next {
                Err(_) => ChatNext::Timeout,
                Ok(Some(event)) => ChatNext::Event(event),
                Ok(None) => ChatNext::Closed,
            },
        },
        None => tokio::select! {
            _ = cancel.cancelled() => ChatNext::Cancelled,
            event = stream.events.recv() => match event {
                Some(event) => ChatNext::Event(event),
                None => ChatNext::Closed,
            },
        },
    }
}

async fn drive_turn(ctx: &TurnContext) -> (TurnOutcome, String) {
    let fault: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));

    // memory lookup feeds the system message; a slow store cannot stall the
    // turn past the deadline
    let mut system = ctx.system_prompt.clone();
    if let Some(memory) = &ctx.memory {
        let search = memory.search(&ctx.user_text, &ctx.user_id, ctx.memory_limit);
        match tokio::time::timeout(MEMORY_DEADLINE, search).await {
            Ok(Ok(snippets)) if !snippets.is_empty() => {
                system.push_str("\n\nRelevant memories about the user:");
                for snippet in &snippets {
                    system.push_str("\n- ");
                    system.push_str(&snippet.content);
                }
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "memory search failed"),
            Err(_) => tracing::warn!("memory search missed its deadline"),
        }
    }

    let mut messages = Vec::with_capacity(ctx.history_messages.len() + 1);
    messages.push(ChatMessage::system(system));
    messages.extend(ctx.history_messages.iter().cloned());

    let mut stream = match ctx.chat.open(messages, ctx.params, ctx.cancel.clone()).await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ctx.events.send(PipelineEvent::Error {
                turn: ctx.turn,
                message: e.to_string(),
            });
            return (TurnOutcome::Failed(e.kind()), String::new());
        }
    };

    let mut sanitizer = TextSanitizer::new(ctx.sanitizer);
    let mut speech = Speech::new(ctx, Arc::clone(&fault));
    let mut assistant_text = String::new();
    let mut first = true;
    let mut error: Option<Error> = None;

    loop {
        let timeout = first.then_some(ctx.llm_first_token_timeout);
        match next_chat_event(&mut stream, &ctx.cancel, timeout).await {
            ChatNext::Cancelled => break,
            ChatNext::Timeout => {
                error = Some(Error::LlmTimeout);
                break;
            }
            ChatNext::Closed => break,
            ChatNext::Event(ChatEvent::Token(token)) => {
                first = false;
                assistant_text.push_str(&token.text);
                let _ = ctx.events.send(PipelineEvent::AssistantToken {
                    turn: ctx.turn,
                    text: token.text.clone(),
                });
                for utterance in sanitizer.push(&token.text) {
                    speech.speak(utterance).await;
                }
            }
            ChatNext::Event(ChatEvent::Done(outcome)) => {
                if !outcome.tool_calls.is_empty() {
                    tracing::info!(
                        count = outcome.tool_calls.len(),
                        "model requested tool calls; not executed"
                    );
                }
                break;
            }
            ChatNext::Event(ChatEvent::Error(e)) => {
                error = Some(e);
                break;
            }
        }
    }

    if ctx.cancel.is_cancelled() {
        speech.abort();
        ctx.playback.abort();
        return match fault.lock().take() {
            Some(e) => {
                let _ = ctx.events.send(PipelineEvent::Error {
                    turn: ctx.turn,
                    message: e.to_string(),
                });
                (TurnOutcome::Failed(e.kind()), assistant_text)
            }
            None => (
                TurnOutcome::Cancelled(CancelReason::Explicit),
                assistant_text,
            ),
        };
    }

    if let Some(e) = error {
        // the reply audibly stops; whatever text was produced stays on
        // screen, marked by the error event
        speech.abort();
        ctx.playback.abort();
        let _ = ctx.events.send(PipelineEvent::Error {
            turn: ctx.turn,
            message: e.to_string(),
        });
        return (TurnOutcome::Failed(e.kind()), assistant_text);
    }

    // natural end of the token stream: flush the sanitizer tail, let TTS
    // finish, then drain playback
    for utterance in sanitizer.finish() {
        speech.speak(utterance).await;
    }
    if let Err(e) = speech.drain().await {
        ctx.playback.abort();
        return finish_after_interrupt(ctx, e, fault, assistant_text);
    }

    if !ctx.cancel.is_cancelled() {
        ctx.state.set(TurnState::Draining);
    }
    let flushed = tokio::select! {
        _ = ctx.cancel.cancelled() => false,
        _ = ctx.playback.flush() => true,
    };
    if !flushed {
        ctx.playback.abort();
        return finish_after_interrupt(ctx, Error::Cancelled, fault, assistant_text);
    }

    (TurnOutcome::Completed, assistant_text)
}

/// Map an interrupted drain to its outcome: a stage fault wins over a plain
/// cancellation
fn finish_after_interrupt(
    ctx: &TurnContext,
    error: Error,
    fault: Arc<Mutex<Option<Error>>>,
    assistant_text: String,
) -> (TurnOutcome, String) {
    let effective = fault.lock().take().unwrap_or(error);
    match effective {
        Error::Cancelled => (
            TurnOutcome::Cancelled(CancelReason::Explicit),
            assistant_text,
        ),
        other => {
            let _ = ctx.events.send(PipelineEvent::Error {
                turn: ctx.turn,
                message: other.to_string(),
            });
            (TurnOutcome::Failed(other.kind()), assistant_text)
        }
    }
}

/// Per-turn speech side: lazily opened TTS session plus the frame forwarder.
///
/// A TTS failure downgrades the turn to text-only; the token stream is still
/// consumed so the user gets the reply on screen.
struct Speech<'a> {
    ctx: &'a TurnContext,
    fault: Arc<Mutex<Option<Error>>>,
    session: Option<Box<dyn TtsSession>>,
    forward: Option<JoinHandle<Result<()>>>,
    failed: bool,
}

impl<'a> Speech<'a> {
    fn new(ctx: &'a TurnContext, fault: Arc<Mutex<Option<Error>>>) -> Self {
        Self {
            ctx,
            fault,
            session: None,
            forward: None,
            failed: false,
        }
    }

    async fn speak(&mut self, utterance: Utterance) {
        if self.failed || utterance.is_blank() {
            return;
        }
        if self.session.is_none() {
            self.open().await;
            if self.failed {
                return;
            }
        }
        let _ = self.ctx.events.send(PipelineEvent::AssistantUtterance {
            turn: self.ctx.turn,
            text: utterance.text.clone(),
        });
        if let Some(session) = self.session.as_mut() {
            if let Err(e) = session.send_text(&utterance.text).await {
                tracing::warn!(error = %e, "TTS send failed; reply continues without audio");
                self.failed = true;
            }
        }
    }

    async fn open(&mut self) {
        match self.ctx.tts.open(self.ctx.cancel.clone()).await {
            Ok(mut session) => {
                if let Some(frames) = session.take_frames() {
                    self.forward = Some(tokio::spawn(forward_frames(
                        frames,
                        Arc::clone(&self.ctx.playback),
                        self.ctx.turn,
                        self.ctx.cancel.clone(),
                        self.ctx.tts_first_frame_timeout,
                        Arc::clone(&self.fault),
                    )));
                }
                self.session = Some(session);
                if !self.ctx.cancel.is_cancelled() {
                    self.ctx.state.set(TurnState::Speaking);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "TTS open failed; reply continues without audio");
                self.failed = true;
            }
        }
    }

    fn abort(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.abort();
        }
        // the forwarder unblocks once the frame channel closes and the
        // playback queue is cleared; it is not awaited on the abort path
        self.forward = None;
    }

    /// Finish the session and wait for its audio to be fully forwarded
    async fn drain(mut self) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        if self.failed {
            session.abort();
            return Ok(());
        }
        if let Err(e) = session.finish().await {
            tracing::warn!(error = %e, "TTS finish failed");
        }
        if let Some(forward) = self.forward.take() {
            return tokio::select! {
                _ = self.ctx.cancel.cancelled() => Err(Error::Cancelled),
                joined = forward => match joined {
                    Ok(result) => result,
                    Err(_) => Ok(()),
                },
            };
        }
        Ok(())
    }
}

/// Moves TTS audio into playback, tagging frames with the turn and policing
/// the first-frame deadline. On timeout it records the fault and trips the
/// turn's cancellation token so every stage unwinds.
async fn forward_frames(
    mut frames: mpsc::Receiver<AudioFrame>,
    playback: Arc<dyn AudioSink>,
    turn: TurnId,
    cancel: CancellationToken,
    first_frame_timeout: Duration,
    fault: Arc<Mutex<Option<Error>>>,
) -> Result<()> {
    let first = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        first = tokio::time::timeout(first_frame_timeout, frames.recv()) => first,
    };
    let mut frame = match first {
        Err(_) => {
            *fault.lock() = Some(Error::TtsTimeout);
            cancel.cancel();
            return Err(Error::TtsTimeout);
        }
        // a session may legitimately close with zero frames
        Ok(None) => return Ok(()),
        Ok(Some(frame)) => frame,
    };

    loop {
        let tagged = frame.with_turn(turn);
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            submitted = playback.submit(tagged) => submitted?,
        }
        frame = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            next = frames.recv() => match next {
                Some(frame) => frame,
                None => return Ok(()),
            },
        };
    }
}

/// Capture → AEC → recognition feed
async fn run_capture_feed(
    mut frames: mpsc::Receiver<AudioFrame>,
    mut aec: Option<AecProcessor>,
    mut references: Option<broadcast::Receiver<ReferenceFrame>>,
    asr: Arc<dyn AsrSession>,
    aggregate: bool,
    shutdown: CancellationToken,
) {
    loop {
        let has_references = references.is_some();
        tokio::select! {
            _ = shutdown.cancelled() => break,
            reference = recv_reference(&mut references), if has_references => {
                match reference {
                    Some(reference) => {
                        if let Some(aec) = aec.as_mut() {
                            aec.push_reference(&reference);
                        }
                    }
                    // tap closed; stop polling it
                    None => references = None,
                }
            }
            frame = frames.recv() => match frame {
                None => break,
                Some(frame) => {
                    let processed = match aec.as_mut() {
                        Some(aec) if aggregate => aec.process_aggregate(&frame),
                        Some(aec) => aec.process_capture(&frame),
                        None => frame,
                    };
                    if asr.send(processed).await.is_err() {
                        tracing::warn!("recognition session rejected audio, stopping feed");
                        break;
                    }
                }
            },
        }
    }
    if let Some(aec) = aec {
        aec.log_summary();
    }
}

async fn recv_reference(
    references: &mut Option<broadcast::Receiver<ReferenceFrame>>,
) -> Option<ReferenceFrame> {
    let Some(rx) = references.as_mut() else {
        return None;
    };
    loop {
        match rx.recv().await {
            Ok(reference) => return Some(reference),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

/// Recognition events → orchestrator commands
async fn run_asr_events(
    mut transcripts: broadcast::Receiver<Transcript>,
    cmd_tx: mpsc::Sender<Command>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            event = transcripts.recv() => match event {
                Ok(transcript) => {
                    if cmd_tx.send(Command::Transcript(transcript)).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "transcript forwarder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}
