//! Websocket streaming recognition client
//!
//! The session pushes binary PCM frames upstream and receives JSON
//! transcript events downstream. A session may outlive many turns; `flush`
//! asks the provider to finalize the current utterance. On a network drop
//! the session reconnects at most once, keeping emitted sequence numbers
//! monotonic across the gap; in-flight audio that never reached the server
//! is lost.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use voiceloop_config::AsrSettings;
use voiceloop_core::{AsrProvider, AsrSession, AudioFrame, Error, Result, Transcript};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `close` waits for an in-flight final before giving up
const CLOSE_DRAIN: Duration = Duration::from_millis(500);

#[derive(Serialize)]
struct StartMessage<'a> {
    r#type: &'static str,
    model: &'a str,
    sample_rate: u32,
    channels: u16,
    format: &'static str,
    disfluency_removal: bool,
}

#[derive(Serialize)]
struct FinalizeMessage {
    r#type: &'static str,
}

#[derive(Deserialize)]
struct TranscriptEvent {
    #[serde(default)]
    text: String,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    sequence: u64,
    #[serde(default)]
    start_ms: u64,
    #[serde(default)]
    end_ms: u64,
}

impl TranscriptEvent {
    fn into_transcript(self, sequence_offset: u64) -> Transcript {
        Transcript {
            text: self.text,
            is_final: self.is_final,
            sequence: self.sequence + sequence_offset,
            start_ms: self.start_ms,
            end_ms: self.end_ms,
        }
    }
}

enum Command {
    Audio(Vec<u8>),
    Flush,
    Close,
}

/// Provider opening websocket recognition sessions
pub struct WsAsrProvider {
    settings: AsrSettings,
}

impl WsAsrProvider {
    pub fn new(settings: AsrSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl AsrProvider for WsAsrProvider {
    async fn open(&self) -> Result<Arc<dyn AsrSession>> {
        let session = WsAsrSession::connect(self.settings.clone()).await?;
        Ok(Arc::new(session))
    }
}

/// A live recognition session
pub struct WsAsrSession {
    cmd_tx: mpsc::Sender<Command>,
    transcript_tx: broadcast::Sender<Transcript>,
}

impl WsAsrSession {
    pub async fn connect(settings: AsrSettings) -> Result<Self> {
        let ws = dial(&settings).await?;
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (transcript_tx, _) = broadcast::channel(64);

        tokio::spawn(run_io(ws, settings, cmd_rx, transcript_tx.clone()));
        Ok(Self {
            cmd_tx,
            transcript_tx,
        })
    }
}

#[async_trait]
impl AsrSession for WsAsrSession {
    async fn send(&self, frame: AudioFrame) -> Result<()> {
        let bytes = pcm_bytes(frame.samples());
        match self.cmd_tx.try_send(Command::Audio(bytes)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                // the writer is behind; this frame is lost, as it would be on
                // the wire
                tracing::trace!("ASR writer backlogged, dropping frame");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(Error::Asr("session closed".into()))
            }
        }
    }

    fn transcripts(&self) -> broadcast::Receiver<Transcript> {
        self.transcript_tx.subscribe()
    }

    async fn flush(&self) -> Result<()> {
        self.cmd_tx
            .send(Command::Flush)
            .await
            .map_err(|_| Error::Asr("session closed".into()))
    }

    async fn close(&self) -> Result<()> {
        let _ = self.cmd_tx.send(Command::Close).await;
        Ok(())
    }
}

async fn dial(settings: &AsrSettings) -> Result<Ws> {
    let mut request = settings
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| Error::Config(format!("bad ASR url: {e}")))?;
    let bearer = format!("Bearer {}", settings.api_key);
    request.headers_mut().insert(
        AUTHORIZATION,
        bearer
            .parse()
            .map_err(|_| Error::Config("ASR credential is not header-safe".into()))?,
    );

    let (mut ws, _) = connect_async(request).await.map_err(classify_dial_error)?;

    let start = StartMessage {
        r#type: "start",
        model: &settings.model,
        sample_rate: settings.sample_rate,
        channels: 1,
        format: "pcm",
        disfluency_removal: settings.disfluency_removal,
    };
    let payload = serde_json::to_string(&start).map_err(|e| Error::Asr(e.to_string()))?;
    ws.send(Message::Text(payload))
        .await
        .map_err(|e| Error::Asr(e.to_string()))?;
    Ok(ws)
}

fn classify_dial_error(err: WsError) -> Error {
    match err {
        WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            Error::AsrAuthFailed(response.status().to_string())
        }
        other => Error::Asr(other.to_string()),
    }
}

async fn run_io(
    mut ws: Ws,
    settings: AsrSettings,
    mut cmd_rx: mpsc::Receiver<Command>,
    transcript_tx: broadcast::Sender<Transcript>,
) {
    let mut reconnected = false;
    let mut sequence_offset = 0u64;
    let mut last_sequence = 0u64;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Audio(bytes)) => {
                    if let Err(e) = ws.send(Message::Binary(bytes)).await {
                        if !try_reconnect(&mut ws, &settings, &mut reconnected, last_sequence, &mut sequence_offset).await {
                            tracing::error!(error = %e, "ASR send failed after reconnect");
                            return;
                        }
                    }
                }
                Some(Command::Flush) => {
                    let payload = serde_json::to_string(&FinalizeMessage { r#type: "finalize" })
                        .expect("static message serializes");
                    if ws.send(Message::Text(payload)).await.is_err()
                        && !try_reconnect(&mut ws, &settings, &mut reconnected, last_sequence, &mut sequence_offset).await
                    {
                        return;
                    }
                }
                Some(Command::Close) | None => {
                    let _ = ws.send(Message::Close(None)).await;
                    drain_finals(&mut ws, &transcript_tx, sequence_offset).await;
                    return;
                }
            },
            incoming = ws.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<TranscriptEvent>(&text) {
                        Ok(event) => {
                            let transcript = event.into_transcript(sequence_offset);
                            last_sequence = transcript.sequence;
                            let _ = transcript_tx.send(transcript);
                        }
                        Err(e) => tracing::warn!(error = %e, "unparseable ASR event"),
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "ASR stream error");
                    if !try_reconnect(&mut ws, &settings, &mut reconnected, last_sequence, &mut sequence_offset).await {
                        return;
                    }
                }
                None => {
                    if !try_reconnect(&mut ws, &settings, &mut reconnected, last_sequence, &mut sequence_offset).await {
                        return;
                    }
                }
            },
        }
    }
}

/// At-most-one transparent reconnect per session
async fn try_reconnect(
    ws: &mut Ws,
    settings: &AsrSettings,
    reconnected: &mut bool,
    last_sequence: u64,
    sequence_offset: &mut u64,
) -> bool {
    if *reconnected {
        return false;
    }
    *reconnected = true;
    match dial(settings).await {
        Ok(new_ws) => {
            *ws = new_ws;
            // the new connection numbers from zero; keep our output monotonic
            *sequence_offset = last_sequence;
            tracing::info!("ASR session reconnected");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "ASR reconnect failed");
            false
        }
    }
}

/// Emit any in-flight final that arrives right after close is requested
async fn drain_finals(
    ws: &mut Ws,
    transcript_tx: &broadcast::Sender<Transcript>,
    sequence_offset: u64,
) {
    let deadline = tokio::time::Instant::now() + CLOSE_DRAIN;
    loop {
        let next = tokio::time::timeout_at(deadline, ws.next()).await;
        match next {
            Ok(Some(Ok(Message::Text(text)))) => {
                if let Ok(event) = serde_json::from_str::<TranscriptEvent>(&text) {
                    let _ = transcript_tx.send(event.into_transcript(sequence_offset));
                }
            }
            Ok(Some(Ok(_))) => {}
            _ => return,
        }
    }
}

fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_message_shape() {
        let start = StartMessage {
            r#type: "start",
            model: "realtime-asr-1",
            sample_rate: 16_000,
            channels: 1,
            format: "pcm",
            disfluency_removal: true,
        };
        let json = serde_json::to_string(&start).unwrap();
        assert!(json.contains("\"type\":\"start\""));
        assert!(json.contains("\"sample_rate\":16000"));
        assert!(json.contains("\"disfluency_removal\":true"));
    }

    #[test]
    fn transcript_event_defaults_and_offset() {
        let event: TranscriptEvent =
            serde_json::from_str(r#"{"text":"stop","is_final":true,"sequence":3}"#).unwrap();
        let transcript = event.into_transcript(10);
        assert_eq!(transcript.sequence, 13);
        assert!(transcript.is_final);
        assert_eq!(transcript.end_ms, 0);
    }

    #[test]
    fn pcm_bytes_are_little_endian() {
        assert_eq!(pcm_bytes(&[1, -2]), vec![0x01, 0x00, 0xFE, 0xFF]);
    }
}
