//! Websocket streaming synthesis client
//!
//! A session is opened per turn. Text fragments go upstream as they are
//! sanitized; PCM audio comes back base64-encoded and is reframed at the
//! session's sample rate. `finish` requests the final flush, after which the
//! frame channel closes; `abort` tears the socket down immediately.

use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use voiceloop_config::TtsSettings;
use voiceloop_core::{
    AudioFrame, CancellationToken, Channels, Error, Result, SampleRate, TtsProvider, TtsSession,
};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// First-audio watermark; exceeding it marks the session degraded, not failed
const FIRST_AUDIO_WATERMARK: Duration = Duration::from_millis(800);

#[derive(Serialize)]
struct StartMessage<'a> {
    r#type: &'static str,
    session_id: String,
    voice: &'a str,
    sample_rate: u32,
    format: &'a str,
}

#[derive(Serialize)]
struct TextMessage<'a> {
    r#type: &'static str,
    text: &'a str,
}

#[derive(Serialize)]
struct FinishMessage {
    r#type: &'static str,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum DownstreamMessage {
    Audio {
        #[serde(default)]
        data: String,
    },
    Done,
    Error {
        #[serde(default)]
        message: String,
    },
}

enum Command {
    Text(String),
    Finish,
}

/// Provider opening websocket synthesis sessions
pub struct WsTtsProvider {
    settings: TtsSettings,
}

impl WsTtsProvider {
    pub fn new(settings: TtsSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl TtsProvider for WsTtsProvider {
    async fn open(&self, cancel: CancellationToken) -> Result<Box<dyn TtsSession>> {
        let session = WsTtsSession::connect(self.settings.clone(), cancel).await?;
        Ok(Box::new(session))
    }
}

/// A live synthesis session
#[derive(Debug)]
pub struct WsTtsSession {
    cmd_tx: mpsc::Sender<Command>,
    frames: Option<mpsc::Receiver<AudioFrame>>,
    abort: CancellationToken,
}

impl WsTtsSession {
    pub async fn connect(settings: TtsSettings, cancel: CancellationToken) -> Result<Self> {
        if settings.format != "s16le" {
            return Err(Error::Config(format!(
                "unsupported TTS sample format `{}`",
                settings.format
            )));
        }
        let sample_rate = SampleRate::from_hz(settings.sample_rate).ok_or_else(|| {
            Error::Config(format!("unsupported TTS rate {} Hz", settings.sample_rate))
        })?;

        let mut request = settings
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Config(format!("bad TTS url: {e}")))?;
        let bearer = format!("Bearer {}", settings.api_key);
        request.headers_mut().insert(
            AUTHORIZATION,
            bearer
                .parse()
                .map_err(|_| Error::Config("TTS credential is not header-safe".into()))?,
        );

        let (mut ws, _) = connect_async(request)
            .await
            .map_err(|e| Error::Tts(e.to_string()))?;

        let start = StartMessage {
            r#type: "start",
            session_id: Uuid::new_v4().to_string(),
            voice: &settings.voice,
            sample_rate: settings.sample_rate,
            format: &settings.format,
        };
        let payload = serde_json::to_string(&start).map_err(|e| Error::Tts(e.to_string()))?;
        ws.send(Message::Text(payload))
            .await
            .map_err(|e| Error::Tts(e.to_string()))?;

        let abort = CancellationToken::new();
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (frame_tx, frame_rx) = mpsc::channel(32);

        tokio::spawn(run_io(
            ws,
            sample_rate,
            cmd_rx,
            frame_tx,
            cancel,
            abort.clone(),
        ));

        Ok(Self {
            cmd_tx,
            frames: Some(frame_rx),
            abort,
        })
    }
}

#[async_trait]
impl TtsSession for WsTtsSession {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.cmd_tx
            .send(Command::Text(text.to_string()))
            .await
            .map_err(|_| Error::Tts("session closed".into()))
    }

    async fn finish(&mut self) -> Result<()> {
        self.cmd_tx
            .send(Command::Finish)
            .await
            .map_err(|_| Error::Tts("session closed".into()))
    }

    fn abort(&mut self) {
        self.abort.cancel();
    }

    fn take_frames(&mut self) -> Option<mpsc::Receiver<AudioFrame>> {
        self.frames.take()
    }
}

async fn run_io(
    mut ws: Ws,
    sample_rate: SampleRate,
    mut cmd_rx: mpsc::Receiver<Command>,
    frame_tx: mpsc::Sender<AudioFrame>,
    cancel: CancellationToken,
    abort: CancellationToken,
) {
    let opened_at = Instant::now();
    let mut first_audio: Option<Duration> = None;
    let mut frames_emitted = 0u64;
    let b64 = base64::engine::general_purpose::STANDARD;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = abort.cancelled() => break,
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Text(text)) => {
                    let payload = serde_json::to_string(&TextMessage { r#type: "text", text: &text })
                        .expect("text message serializes");
                    if let Err(e) = ws.send(Message::Text(payload)).await {
                        tracing::error!(error = %e, "TTS text send failed");
                        break;
                    }
                }
                Some(Command::Finish) => {
                    let payload = serde_json::to_string(&FinishMessage { r#type: "finish" })
                        .expect("static message serializes");
                    if let Err(e) = ws.send(Message::Text(payload)).await {
                        tracing::error!(error = %e, "TTS finish send failed");
                        break;
                    }
                }
                None => break,
            },
            incoming = ws.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<DownstreamMessage>(&text) {
                        Ok(DownstreamMessage::Audio { data }) => {
                            let Ok(bytes) = b64.decode(data.as_bytes()) else {
                                tracing::warn!("undecodable TTS audio payload");
                                continue;
                            };
                            if first_audio.is_none() {
                                let delay = opened_at.elapsed();
                                if delay > FIRST_AUDIO_WATERMARK {
                                    tracing::warn!(
                                        delay_ms = delay.as_millis() as u64,
                                        "TTS first audio past watermark, session degraded"
                                    );
                                }
                                first_audio = Some(delay);
                            }
                            let samples: Vec<i16> = bytes
                                .chunks_exact(2)
                                .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
                                .collect();
                            if samples.is_empty() {
                                continue;
                            }
                            frames_emitted += 1;
                            let frame = AudioFrame::new(samples, sample_rate, Channels::Mono);
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = abort.cancelled() => break,
                                sent = frame_tx.send(frame) => {
                                    if sent.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        Ok(DownstreamMessage::Done) => break,
                        Ok(DownstreamMessage::Error { message }) => {
                            tracing::error!(message = %message, "TTS provider error");
                            break;
                        }
                        Err(e) => tracing::warn!(error = %e, "unparseable TTS event"),
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "TTS stream error");
                    break;
                }
                None => break,
            },
        }
    }

    let _ = ws.send(Message::Close(None)).await;
    tracing::debug!(
        frames = frames_emitted,
        first_audio_ms = first_audio.map(|d| d.as_millis() as u64),
        "TTS session closed"
    );
}
