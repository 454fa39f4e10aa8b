//! voiceloop entry point
//!
//! Thin surface over the pipeline: loads `.env` and settings, selects a
//! role, wires providers and devices, then drives either the typed-input
//! REPL or the hands-free voice loop. Exit codes: 0 clean shutdown, 2
//! configuration or auth failure at startup, 1 any other fatal error.

use std::io::Write;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use voiceloop_audio::{
    list_input_devices, list_output_devices, AecProcessor, AudioCapture, AudioPlayback,
    CaptureConfig, PlaybackConfig,
};
use voiceloop_config::{RoleLibrary, Settings};
use voiceloop_core::{ErrorKind, MemoryStore, Role};
use voiceloop_pipeline::{Pipeline, PipelineConfig, PipelineDeps, PipelineEvent};
use voiceloop_providers::{
    LocalMemoryStore, NullMemoryStore, OpenAiChatProvider, WsAsrProvider, WsTtsProvider,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Typed input, spoken replies
    Text,
    /// Microphone input with barge-in
    Voice,
}

#[derive(Parser)]
#[command(name = "voiceloop", about = "Full-duplex streaming voice assistant")]
struct Args {
    #[arg(long, value_enum, default_value_t = Mode::Text)]
    mode: Mode,

    /// Role id from the built-in library (default/casual/professional/companion)
    #[arg(long)]
    role: Option<String>,

    /// Print audio devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let args = Args::parse();
    let _ = dotenvy::dotenv();

    if args.list_devices {
        return list_devices();
    }

    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return 2;
        }
    };
    init_tracing(&settings);

    let voice = args.mode == Mode::Voice;
    if let Err(e) = settings.validate(voice) {
        eprintln!("configuration error: {e}");
        return 2;
    }

    let role_id = args.role.as_deref().unwrap_or(&settings.role);
    let role = match RoleLibrary::builtin().get(role_id) {
        Ok(role) => role.clone(),
        Err(e) => {
            eprintln!("configuration error: {e}");
            return 2;
        }
    };
    tracing::info!(role = %role.id, mode = ?args.mode, "starting voiceloop");

    let playback = match AudioPlayback::new(PlaybackConfig {
        device: settings.audio.output_device.clone(),
        sample_rate: settings.tts.sample_rate,
        watermark_ms: settings.pipeline.playback_watermark_ms,
    }) {
        Ok(playback) => Arc::new(playback),
        Err(e) => {
            eprintln!("audio error: {e}");
            return 2;
        }
    };

    let memory: Arc<dyn MemoryStore> = if settings.memory.enabled {
        Arc::new(LocalMemoryStore::new(settings.memory.capacity))
    } else {
        Arc::new(NullMemoryStore)
    };

    let deps = PipelineDeps {
        chat: Arc::new(OpenAiChatProvider::new(&settings.llm)),
        tts: Arc::new(WsTtsProvider::new(settings.tts.clone())),
        memory,
        playback,
        asr: voice.then(|| Arc::new(WsAsrProvider::new(settings.asr.clone())) as _),
        capture: voice.then(|| {
            Box::new(AudioCapture::new(CaptureConfig {
                device: settings.audio.input_device.clone(),
                sample_rate: settings.audio.capture_sample_rate,
                channels: if settings.audio.aggregate_device { 2 } else { 1 },
                frame_ms: settings.audio.frame_ms,
            })) as _
        }),
        aec: (voice && settings.audio.aec.enabled).then(|| {
            AecProcessor::new(&settings.audio.aec, settings.audio.capture_sample_rate)
        }),
    };

    let config = PipelineConfig::from_settings(&settings, role);
    let pipeline = Arc::new(Pipeline::new(config, deps));

    if let Err(e) = pipeline.start().await {
        eprintln!("startup failed: {e}");
        return match e.kind() {
            ErrorKind::Config | ErrorKind::ProviderFatal => 2,
            _ => 1,
        };
    }

    tokio::spawn(print_events(pipeline.subscribe()));

    match args.mode {
        Mode::Text => text_loop(&pipeline).await,
        Mode::Voice => voice_loop().await,
    }

    if pipeline.stop().await.is_err() {
        return 1;
    }
    0
}

/// Typed-input REPL; replies stream to the terminal and the speaker
async fn text_loop(pipeline: &Pipeline) {
    println!("voiceloop text mode. /quit to exit, /history to review.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    match line {
                        "" => {}
                        "/quit" => break,
                        "/history" => {
                            for message in pipeline.history() {
                                let who = match message.role {
                                    Role::User => "you",
                                    Role::Assistant => "assistant",
                                    Role::System => "system",
                                };
                                println!("{who}: {}", message.text);
                            }
                        }
                        text => {
                            if pipeline.submit_text(text).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Ok(None) | Err(_) => break,
            },
        }
    }
}

/// Hands-free loop: everything happens in the pipeline, wait for Ctrl-C
async fn voice_loop() {
    println!("voiceloop voice mode. Speak when ready; Ctrl-C to exit.");
    let _ = tokio::signal::ctrl_c().await;
}

/// Stream pipeline events to the terminal
async fn print_events(mut events: tokio::sync::broadcast::Receiver<PipelineEvent>) {
    loop {
        match events.recv().await {
            Ok(PipelineEvent::PartialTranscript(t)) => {
                print!("\r[hearing] {}", t.text);
                let _ = std::io::stdout().flush();
            }
            Ok(PipelineEvent::UserText { text, .. }) => {
                println!("\ryou: {text}");
            }
            Ok(PipelineEvent::AssistantToken { text, .. }) => {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            Ok(PipelineEvent::TurnFinished(report)) => {
                println!();
                tracing::debug!(turn = %report.turn, outcome = ?report.outcome, "turn finished");
            }
            Ok(PipelineEvent::BargeIn { .. }) => {
                println!("\n[interrupted]");
            }
            Ok(PipelineEvent::Error { message, .. }) => {
                println!("\n[error] {message} (reply incomplete)");
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn list_devices() -> i32 {
    match (list_input_devices(), list_output_devices()) {
        (Ok(inputs), Ok(outputs)) => {
            println!("input devices:");
            for name in inputs {
                println!("  {name}");
            }
            println!("output devices:");
            for name in outputs {
                println!("  {name}");
            }
            0
        }
        (Err(e), _) | (_, Err(e)) => {
            eprintln!("audio error: {e}");
            2
        }
    }
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("voiceloop={}", settings.observability.log_level))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
