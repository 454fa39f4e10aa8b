//! Scripted test doubles
//!
//! Drive the orchestrator end-to-end without devices or networks: a chat
//! provider that replays scripted token streams, a TTS provider that
//! synthesizes silence, an ASR session fed by hand, a recording playback
//! sink and a recording memory store.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use voiceloop_core::{
    AsrProvider, AsrSession, AudioFrame, AudioSink, CancellationToken, Channels, ChatEvent,
    ChatMessage, ChatOutcome, ChatProvider, ChatStream, Error, GenerationParams, MemorySnippet,
    MemoryStore, ReferenceFrame, Result, SampleRate, Token, Transcript, TtsProvider, TtsSession,
    TurnId,
};

/// What the playback sink observed, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackRecord {
    Frame(Option<TurnId>),
    Abort,
}

/// Recording playback sink
pub struct FakePlayback {
    records: Mutex<Vec<PlaybackRecord>>,
    last_submit: Mutex<Option<Instant>>,
    playing: AtomicBool,
    reference_tx: broadcast::Sender<ReferenceFrame>,
}

impl FakePlayback {
    pub fn new() -> Self {
        let (reference_tx, _) = broadcast::channel(64);
        Self {
            records: Mutex::new(Vec::new()),
            last_submit: Mutex::new(None),
            playing: AtomicBool::new(false),
            reference_tx,
        }
    }

    /// Stamp a submit without going through the sink (barge-in grace tests)
    pub fn mark_submit(&self) {
        *self.last_submit.lock() = Some(Instant::now());
    }

    pub fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<PlaybackRecord> {
        self.records.lock().clone()
    }

    pub fn frames_submitted(&self) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| matches!(r, PlaybackRecord::Frame(_)))
            .count()
    }

    /// Frames that arrived after the most recent abort
    pub fn frames_after_last_abort(&self) -> usize {
        let records = self.records.lock();
        let last_abort = records
            .iter()
            .rposition(|r| matches!(r, PlaybackRecord::Abort));
        match last_abort {
            None => 0,
            Some(at) => records[at + 1..]
                .iter()
                .filter(|r| matches!(r, PlaybackRecord::Frame(_)))
                .count(),
        }
    }
}

impl Default for FakePlayback {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioSink for FakePlayback {
    async fn submit(&self, frame: AudioFrame) -> Result<()> {
        self.records.lock().push(PlaybackRecord::Frame(frame.turn()));
        *self.last_submit.lock() = Some(Instant::now());
        let _ = self.reference_tx.send(ReferenceFrame::new(
            frame.samples().into(),
            frame.sample_rate(),
            Instant::now(),
        ));
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn abort(&self) {
        self.records.lock().push(PlaybackRecord::Abort);
        self.playing.store(false, Ordering::SeqCst);
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    fn last_submit(&self) -> Option<Instant> {
        *self.last_submit.lock()
    }

    fn reference_frames(&self) -> broadcast::Receiver<ReferenceFrame> {
        self.reference_tx.subscribe()
    }
}

/// One step of a scripted chat stream
pub enum ChatStep {
    Token(String),
    Delay(Duration),
    Error(Error),
}

/// A scripted chat completion
pub struct ChatScript {
    pub steps: Vec<ChatStep>,
    /// Send an end-of-stream marker after the steps
    pub done: bool,
}

impl ChatScript {
    pub fn tokens(texts: &[&str]) -> Self {
        Self {
            steps: texts.iter().map(|t| ChatStep::Token((*t).to_string())).collect(),
            done: true,
        }
    }

    pub fn with_leading_delay(mut self, delay: Duration) -> Self {
        self.steps.insert(0, ChatStep::Delay(delay));
        self
    }

    pub fn with_token_delay(texts: &[&str], delay: Duration) -> Self {
        let mut steps = Vec::new();
        for t in texts {
            steps.push(ChatStep::Token((*t).to_string()));
            steps.push(ChatStep::Delay(delay));
        }
        Self { steps, done: true }
    }
}

enum QueuedOpen {
    Script(ChatScript),
    Fail(Error),
}

/// Chat provider replaying queued scripts, one per `open`
pub struct FakeChatProvider {
    queue: Mutex<VecDeque<QueuedOpen>>,
    opens: AtomicUsize,
    last_request: Mutex<Vec<ChatMessage>>,
}

impl FakeChatProvider {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            opens: AtomicUsize::new(0),
            last_request: Mutex::new(Vec::new()),
        }
    }

    pub fn push_script(&self, script: ChatScript) {
        self.queue.lock().push_back(QueuedOpen::Script(script));
    }

    pub fn push_open_failure(&self, error: Error) {
        self.queue.lock().push_back(QueuedOpen::Fail(error));
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Messages of the most recent request
    pub fn last_request(&self) -> Vec<ChatMessage> {
        self.last_request.lock().clone()
    }
}

impl Default for FakeChatProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatProvider for FakeChatProvider {
    async fn open(
        &self,
        messages: Vec<ChatMessage>,
        _params: GenerationParams,
        cancel: CancellationToken,
    ) -> Result<ChatStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock() = messages;

        let next = self.queue.lock().pop_front();
        let script = match next {
            Some(QueuedOpen::Script(script)) => script,
            Some(QueuedOpen::Fail(error)) => return Err(error),
            None => return Err(Error::LlmFailed("no script queued".into())),
        };

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut index = 0u32;
            for step in script.steps {
                match step {
                    ChatStep::Token(text) => {
                        let token = Token::new(text, index);
                        index += 1;
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            sent = tx.send(ChatEvent::Token(token)) => {
                                if sent.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    ChatStep::Delay(delay) => {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    ChatStep::Error(error) => {
                        let _ = tx.send(ChatEvent::Error(error)).await;
                        return;
                    }
                }
            }
            if script.done {
                let _ = tx.send(ChatEvent::Done(ChatOutcome::stop())).await;
            }
        });
        Ok(ChatStream { events: rx })
    }
}

enum TtsCommand {
    Text(String),
    Finish,
}

/// TTS provider synthesizing silent frames for every utterance
pub struct FakeTtsProvider {
    frames_per_utterance: usize,
    frame_samples: usize,
    first_frame_delay: Duration,
    /// Never emit audio and never close the frame channel; trips the
    /// first-frame deadline
    stall: bool,
    fail_open: AtomicBool,
    opened: AtomicUsize,
    spoken: Arc<Mutex<Vec<String>>>,
}

impl FakeTtsProvider {
    pub fn new() -> Self {
        Self {
            frames_per_utterance: 2,
            frame_samples: 240,
            first_frame_delay: Duration::ZERO,
            stall: false,
            fail_open: AtomicBool::new(false),
            opened: AtomicUsize::new(0),
            spoken: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_first_frame_delay(mut self, delay: Duration) -> Self {
        self.first_frame_delay = delay;
        self
    }

    pub fn stalled(mut self) -> Self {
        self.stall = true;
        self
    }

    pub fn fail_next_open(&self) {
        self.fail_open.store(true, Ordering::SeqCst);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Every utterance text sent to any session, in order
    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().clone()
    }
}

impl Default for FakeTtsProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TtsProvider for FakeTtsProvider {
    async fn open(&self, cancel: CancellationToken) -> Result<Box<dyn TtsSession>> {
        if self.fail_open.swap(false, Ordering::SeqCst) {
            return Err(Error::Tts("synthetic open failure".into()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<TtsCommand>(32);
        let (frame_tx, frame_rx) = mpsc::channel(32);
        let abort = CancellationToken::new();

        let spoken = Arc::clone(&self.spoken);
        let frames_per_utterance = self.frames_per_utterance;
        let frame_samples = self.frame_samples;
        let first_frame_delay = self.first_frame_delay;
        let stall = self.stall;
        let session_abort = abort.clone();

        tokio::spawn(async move {
            let mut first = true;
            loop {
                let command = tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = session_abort.cancelled() => return,
                    command = cmd_rx.recv() => command,
                };
                match command {
                    Some(TtsCommand::Text(text)) => {
                        spoken.lock().push(text);
                        if stall {
                            continue;
                        }
                        if first && !first_frame_delay.is_zero() {
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                _ = tokio::time::sleep(first_frame_delay) => {}
                            }
                        }
                        first = false;
                        for _ in 0..frames_per_utterance {
                            let frame = AudioFrame::new(
                                vec![0i16; frame_samples],
                                SampleRate::Hz24000,
                                Channels::Mono,
                            );
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                _ = session_abort.cancelled() => return,
                                sent = frame_tx.send(frame) => {
                                    if sent.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                    Some(TtsCommand::Finish) | None => {
                        if stall {
                            // keep the channel open until the turn unwinds
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                _ = session_abort.cancelled() => {}
                            }
                        }
                        return;
                    }
                }
            }
        });

        Ok(Box::new(FakeTtsSession {
            cmd_tx,
            frames: Some(frame_rx),
            abort,
        }))
    }
}

pub struct FakeTtsSession {
    cmd_tx: mpsc::Sender<TtsCommand>,
    frames: Option<mpsc::Receiver<AudioFrame>>,
    abort: CancellationToken,
}

#[async_trait]
impl TtsSession for FakeTtsSession {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.cmd_tx
            .send(TtsCommand::Text(text.to_string()))
            .await
            .map_err(|_| Error::Tts("session closed".into()))
    }

    async fn finish(&mut self) -> Result<()> {
        let _ = self.cmd_tx.send(TtsCommand::Finish).await;
        Ok(())
    }

    fn abort(&mut self) {
        self.abort.cancel();
    }

    fn take_frames(&mut self) -> Option<mpsc::Receiver<AudioFrame>> {
        self.frames.take()
    }
}

/// Hand-fed recognition session
pub struct FakeAsrSession {
    transcript_tx: broadcast::Sender<Transcript>,
    sent: AtomicUsize,
    flushes: AtomicUsize,
    closed: AtomicBool,
}

impl FakeAsrSession {
    pub fn new() -> Self {
        let (transcript_tx, _) = broadcast::channel(64);
        Self {
            transcript_tx,
            sent: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Inject a transcript event as if it came from the provider
    pub fn emit(&self, transcript: Transcript) {
        let _ = self.transcript_tx.send(transcript);
    }

    pub fn sent_frames(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for FakeAsrSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AsrSession for FakeAsrSession {
    async fn send(&self, _frame: AudioFrame) -> Result<()> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn transcripts(&self) -> broadcast::Receiver<Transcript> {
        self.transcript_tx.subscribe()
    }

    async fn flush(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Provider handing out one shared [`FakeAsrSession`]
pub struct FakeAsrProvider {
    session: Arc<FakeAsrSession>,
}

impl FakeAsrProvider {
    pub fn new() -> (Self, Arc<FakeAsrSession>) {
        let session = Arc::new(FakeAsrSession::new());
        (
            Self {
                session: Arc::clone(&session),
            },
            session,
        )
    }
}

#[async_trait]
impl AsrProvider for FakeAsrProvider {
    async fn open(&self) -> Result<Arc<dyn AsrSession>> {
        Ok(Arc::clone(&self.session) as Arc<dyn AsrSession>)
    }
}

/// Memory store that records every call
pub struct RecordingMemoryStore {
    snippets: Mutex<Vec<MemorySnippet>>,
    searches: Mutex<Vec<String>>,
    records: Mutex<Vec<(String, String, String)>>,
}

impl RecordingMemoryStore {
    pub fn new() -> Self {
        Self {
            snippets: Mutex::new(Vec::new()),
            searches: Mutex::new(Vec::new()),
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn set_snippets(&self, snippets: Vec<MemorySnippet>) {
        *self.snippets.lock() = snippets;
    }

    pub fn searches(&self) -> Vec<String> {
        self.searches.lock().clone()
    }

    /// `(user_id, user_text, assistant_text)` triples, in call order
    pub fn records(&self) -> Vec<(String, String, String)> {
        self.records.lock().clone()
    }
}

impl Default for RecordingMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryStore for RecordingMemoryStore {
    async fn search(
        &self,
        query: &str,
        _user_id: &str,
        _limit: usize,
    ) -> Result<Vec<MemorySnippet>> {
        self.searches.lock().push(query.to_string());
        Ok(self.snippets.lock().clone())
    }

    async fn record_turn(
        &self,
        user_id: &str,
        user_text: &str,
        assistant_text: &str,
    ) -> Result<()> {
        self.records.lock().push((
            user_id.to_string(),
            user_text.to_string(),
            assistant_text.to_string(),
        ));
        Ok(())
    }
}
