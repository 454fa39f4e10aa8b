//! End-to-end pipeline tests over scripted providers
//!
//! Cover the happy voice turn, barge-in, markup stripping, provider
//! failures, timeouts and the boundary behaviors of the turn state machine.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use voiceloop_core::{
    Error, ErrorKind, MemorySnippet, Role, Transcript, TurnOutcome, TurnState,
};
use voiceloop_pipeline::testing::{
    ChatScript, ChatStep, FakeAsrProvider, FakeAsrSession, FakeChatProvider, FakePlayback,
    FakeTtsProvider, PlaybackRecord, RecordingMemoryStore,
};
use voiceloop_pipeline::{Pipeline, PipelineConfig, PipelineDeps, PipelineEvent};

struct Harness {
    pipeline: Pipeline,
    chat: Arc<FakeChatProvider>,
    tts: Arc<FakeTtsProvider>,
    playback: Arc<FakePlayback>,
    memory: Arc<RecordingMemoryStore>,
    asr: Option<Arc<FakeAsrSession>>,
}

fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    // the grace window is unit-tested on the controller; keep it out of the
    // way of scripted timing here
    config.barge_in.software_aec_active = false;
    config
}

fn build(config: PipelineConfig, voice: bool, tts: FakeTtsProvider) -> Harness {
    let chat = Arc::new(FakeChatProvider::new());
    let tts = Arc::new(tts);
    let playback = Arc::new(FakePlayback::new());
    let memory = Arc::new(RecordingMemoryStore::new());

    let (asr_provider, asr_session) = FakeAsrProvider::new();
    let asr = voice.then_some(asr_session);

    let deps = PipelineDeps {
        chat: Arc::clone(&chat) as _,
        tts: Arc::clone(&tts) as _,
        memory: Arc::clone(&memory) as _,
        playback: Arc::clone(&playback) as _,
        asr: voice.then_some(Arc::new(asr_provider) as _),
        capture: None,
        aec: None,
    };

    Harness {
        pipeline: Pipeline::new(config, deps),
        chat,
        tts,
        playback,
        memory,
        asr,
    }
}

async fn wait_for_event(
    rx: &mut broadcast::Receiver<PipelineEvent>,
    pred: impl Fn(&PipelineEvent) -> bool,
) -> PipelineEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("expected event within deadline")
}

async fn wait_for_outcome(
    rx: &mut broadcast::Receiver<PipelineEvent>,
    pred: impl Fn(&TurnOutcome) -> bool,
) -> TurnOutcome {
    let event = wait_for_event(rx, |e| {
        matches!(e, PipelineEvent::TurnFinished(report) if pred(&report.outcome))
    })
    .await;
    match event {
        PipelineEvent::TurnFinished(report) => report.outcome,
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn happy_path_voice_turn() {
    let mut config = test_config();
    config.memory_enabled = true;
    let harness = build(config, true, FakeTtsProvider::new());
    let mut events = harness.pipeline.subscribe();

    harness
        .chat
        .push_script(ChatScript::tokens(&[" It", " is", " about", " three", " pm", "."]));
    harness.pipeline.start().await.unwrap();

    let asr = harness.asr.as_ref().unwrap();
    asr.emit(Transcript::partial("what time", 1));
    asr.emit(Transcript::final_result("what time is it", 2));

    let outcome = wait_for_outcome(&mut events, |o| matches!(o, TurnOutcome::Completed)).await;
    assert_eq!(outcome, TurnOutcome::Completed);

    // the sentence terminator produced exactly one spoken utterance
    assert_eq!(harness.tts.spoken(), vec!["It is about three pm."]);
    assert!(harness.playback.frames_submitted() > 0);

    let history = harness.pipeline.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].text, "what time is it");
    assert_eq!(history[1].role, Role::Assistant);
    assert_eq!(history[1].text, "It is about three pm.");

    // the memory store saw exactly one record for the completed turn
    let records = harness.memory.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].1, "what time is it");
    assert_eq!(records[0].2, "It is about three pm.");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.pipeline.state(), TurnState::Idle);

    harness.pipeline.stop().await.unwrap();
    assert!(asr.is_closed());
}

#[tokio::test]
async fn memory_snippets_feed_the_system_message() {
    let mut config = test_config();
    config.memory_enabled = true;
    let harness = build(config, false, FakeTtsProvider::new());
    let mut events = harness.pipeline.subscribe();

    harness.memory.set_snippets(vec![MemorySnippet {
        content: "User likes green tea".into(),
    }]);
    harness.chat.push_script(ChatScript::tokens(&["Noted."]));

    harness.pipeline.start().await.unwrap();
    harness.pipeline.submit_text("what do I drink").await.unwrap();
    wait_for_outcome(&mut events, |o| matches!(o, TurnOutcome::Completed)).await;

    let request = harness.chat.last_request();
    assert_eq!(request[0].role, Role::System);
    assert!(request[0].content.contains("User likes green tea"));
    assert_eq!(harness.memory.searches(), vec!["what do I drink"]);

    harness.pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn barge_in_cancels_and_next_turn_starts() {
    let harness = build(test_config(), true, FakeTtsProvider::new());
    let mut events = harness.pipeline.subscribe();

    harness.chat.push_script(ChatScript::with_token_delay(
        &[
            "Once upon a time.",
            " There was a kingdom.",
            " It had a long story.",
            " Which kept going.",
            " And going on.",
        ],
        Duration::from_millis(100),
    ));
    harness.chat.push_script(ChatScript::tokens(&["Okay, stopping."]));

    harness.pipeline.start().await.unwrap();
    let asr = harness.asr.as_ref().unwrap();
    asr.emit(Transcript::partial("tell me a long story", 1));
    asr.emit(Transcript::final_result("tell me a long story", 2));

    // wait until the assistant is audibly speaking
    wait_for_event(&mut events, |e| {
        matches!(e, PipelineEvent::AssistantUtterance { .. })
    })
    .await;

    // the user interrupts
    asr.emit(Transcript::partial("stop", 3));
    wait_for_event(&mut events, |e| matches!(e, PipelineEvent::BargeIn { .. })).await;

    let outcome =
        wait_for_outcome(&mut events, |o| matches!(o, TurnOutcome::Cancelled(_))).await;
    assert_eq!(
        outcome,
        TurnOutcome::Cancelled(voiceloop_core::CancelReason::BargeIn)
    );

    // playback was aborted and the cancelled turn left no assistant message
    assert!(harness
        .playback
        .records()
        .iter()
        .any(|r| matches!(r, PlaybackRecord::Abort)));
    let history = harness.pipeline.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].text, "tell me a long story");

    // the interrupting utterance becomes the next turn
    asr.emit(Transcript::final_result("stop", 4));
    wait_for_outcome(&mut events, |o| matches!(o, TurnOutcome::Completed)).await;

    let history = harness.pipeline.history();
    assert_eq!(history.len(), 3);
    assert_eq!(history[1].text, "stop");
    assert_eq!(history[2].text, "Okay, stopping.");

    harness.pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn markup_is_stripped_for_tts_but_kept_on_screen() {
    let harness = build(test_config(), false, FakeTtsProvider::new());
    let mut events = harness.pipeline.subscribe();

    harness.chat.push_script(ChatScript::tokens(&[
        "**Hi**",
        " there.",
        "\n- item one",
        "\n- item two",
        "\n",
    ]));

    harness.pipeline.start().await.unwrap();
    harness.pipeline.submit_text("greet me").await.unwrap();
    wait_for_outcome(&mut events, |o| matches!(o, TurnOutcome::Completed)).await;

    // the TTS feed is stripped and segmented per line/sentence
    assert_eq!(
        harness.tts.spoken(),
        vec!["Hi there.", "item one", "item two"]
    );

    // the raw reply keeps the markup for display
    let history = harness.pipeline.history();
    assert!(history[1].text.contains("**Hi**"));
    assert!(history[1].text.contains("- item one"));

    harness.pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn provider_fatal_fails_turn_but_pipeline_survives() {
    let harness = build(test_config(), false, FakeTtsProvider::new());
    let mut events = harness.pipeline.subscribe();

    harness
        .chat
        .push_open_failure(Error::LlmFailed("401 unauthorized".into()));
    harness.pipeline.start().await.unwrap();
    harness.pipeline.submit_text("hello").await.unwrap();

    let outcome = wait_for_outcome(&mut events, |o| matches!(o, TurnOutcome::Failed(_))).await;
    assert_eq!(outcome, TurnOutcome::Failed(ErrorKind::ProviderFatal));

    // no synthesis was attempted; the user message stays in history
    assert_eq!(harness.tts.opened(), 0);
    let history = harness.pipeline.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].text, "hello");

    // the next turn works with a fresh session
    harness.chat.push_script(ChatScript::tokens(&["Hi."]));
    harness.pipeline.submit_text("again").await.unwrap();
    wait_for_outcome(&mut events, |o| matches!(o, TurnOutcome::Completed)).await;

    harness.pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn llm_first_token_timeout_aborts_turn() {
    let mut config = test_config();
    config.llm_first_token_timeout = Duration::from_millis(100);
    let harness = build(config, false, FakeTtsProvider::new());
    let mut events = harness.pipeline.subscribe();

    harness.chat.push_script(
        ChatScript::tokens(&["too late"]).with_leading_delay(Duration::from_millis(500)),
    );
    harness.pipeline.start().await.unwrap();
    harness.pipeline.submit_text("slow model").await.unwrap();

    let outcome = wait_for_outcome(&mut events, |o| matches!(o, TurnOutcome::Failed(_))).await;
    assert_eq!(outcome, TurnOutcome::Failed(ErrorKind::Timeout));

    assert_eq!(harness.playback.frames_submitted(), 0);
    let history = harness.pipeline.history();
    assert_eq!(history.len(), 1);

    harness.pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn tts_stall_trips_first_frame_deadline() {
    let mut config = test_config();
    config.tts_first_frame_timeout = Duration::from_millis(100);
    let harness = build(config, false, FakeTtsProvider::new().stalled());
    let mut events = harness.pipeline.subscribe();

    harness.chat.push_script(ChatScript::with_token_delay(
        &["First sentence here.", " Second part.", " Third part."],
        Duration::from_millis(100),
    ));
    harness.pipeline.start().await.unwrap();
    harness.pipeline.submit_text("speak up").await.unwrap();

    let outcome = wait_for_outcome(&mut events, |o| matches!(o, TurnOutcome::Failed(_))).await;
    assert_eq!(outcome, TurnOutcome::Failed(ErrorKind::Timeout));
    assert_eq!(harness.playback.frames_submitted(), 0);

    harness.pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn tts_open_failure_still_completes_with_text() {
    let harness = build(test_config(), false, FakeTtsProvider::new());
    let mut events = harness.pipeline.subscribe();

    harness.tts.fail_next_open();
    harness.chat.push_script(ChatScript::tokens(&["Hello there."]));
    harness.pipeline.start().await.unwrap();
    harness.pipeline.submit_text("hi").await.unwrap();

    wait_for_outcome(&mut events, |o| matches!(o, TurnOutcome::Completed)).await;

    // the reply reached history even though no audio was produced
    let history = harness.pipeline.history();
    assert_eq!(history[1].text, "Hello there.");
    assert_eq!(harness.playback.frames_submitted(), 0);

    harness.pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn empty_final_transcript_collapses_to_idle() {
    let harness = build(test_config(), true, FakeTtsProvider::new());
    harness.pipeline.start().await.unwrap();

    let asr = harness.asr.as_ref().unwrap();
    asr.emit(Transcript::final_result("   ", 1));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.chat.opens(), 0);
    assert_eq!(harness.tts.opened(), 0);
    assert!(harness.memory.records().is_empty());
    assert_eq!(harness.pipeline.state(), TurnState::Idle);

    harness.pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn zero_token_stream_completes_without_tts() {
    let harness = build(test_config(), false, FakeTtsProvider::new());
    let mut events = harness.pipeline.subscribe();

    harness.chat.push_script(ChatScript {
        steps: vec![],
        done: true,
    });
    harness.pipeline.start().await.unwrap();
    harness.pipeline.submit_text("say nothing").await.unwrap();

    wait_for_outcome(&mut events, |o| matches!(o, TurnOutcome::Completed)).await;
    assert_eq!(harness.tts.opened(), 0);
    assert_eq!(harness.playback.frames_submitted(), 0);

    harness.pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn typed_text_during_speaking_is_a_barge_in() {
    let harness = build(test_config(), false, FakeTtsProvider::new());
    let mut events = harness.pipeline.subscribe();

    harness.chat.push_script(ChatScript::with_token_delay(
        &[
            "Let me explain at length.",
            " There is a lot to cover.",
            " Really quite a lot.",
        ],
        Duration::from_millis(100),
    ));
    harness.chat.push_script(ChatScript::tokens(&["Sure."]));

    harness.pipeline.start().await.unwrap();
    harness.pipeline.submit_text("explain something").await.unwrap();

    wait_for_event(&mut events, |e| {
        matches!(e, PipelineEvent::AssistantUtterance { .. })
    })
    .await;
    harness.pipeline.submit_text("actually, new question").await.unwrap();

    let outcome =
        wait_for_outcome(&mut events, |o| matches!(o, TurnOutcome::Cancelled(_))).await;
    assert_eq!(
        outcome,
        TurnOutcome::Cancelled(voiceloop_core::CancelReason::BargeIn)
    );

    wait_for_outcome(&mut events, |o| matches!(o, TurnOutcome::Completed)).await;
    let history = harness.pipeline.history();
    let texts: Vec<&str> = history.iter().map(|m| m.text.as_str()).collect();
    assert!(texts.contains(&"actually, new question"));
    assert_eq!(history.last().unwrap().text, "Sure.");
    // the cancelled turn contributed no assistant message
    assert_eq!(
        history.iter().filter(|m| m.role == Role::Assistant).count(),
        1
    );

    harness.pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn chat_error_mid_stream_fails_turn_and_keeps_partial_text() {
    let harness = build(test_config(), false, FakeTtsProvider::new());
    let mut events = harness.pipeline.subscribe();

    harness.chat.push_script(ChatScript {
        steps: vec![
            ChatStep::Token("Partial answer".into()),
            ChatStep::Error(Error::LlmInterrupted("connection reset".into())),
        ],
        done: false,
    });
    harness.pipeline.start().await.unwrap();
    harness.pipeline.submit_text("question").await.unwrap();

    let outcome = wait_for_outcome(&mut events, |o| matches!(o, TurnOutcome::Failed(_))).await;
    assert_eq!(outcome, TurnOutcome::Failed(ErrorKind::ProviderTransient));

    // the partial text never becomes an assistant message
    let history = harness.pipeline.history();
    assert_eq!(history.len(), 1);

    harness.pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn stalled_listening_forces_asr_flush() {
    let mut config = test_config();
    config.asr_final_timeout = Duration::from_millis(300);
    let harness = build(config, true, FakeTtsProvider::new());
    harness.pipeline.start().await.unwrap();

    // speech began but the provider never finalizes on its own
    let asr = harness.asr.as_ref().unwrap();
    asr.emit(Transcript::partial("unfinished thought", 1));

    tokio::time::timeout(Duration::from_secs(3), async {
        while asr.flushes() == 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("orchestrator forces a flush after the final timeout");

    harness.pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn start_stop_with_no_activity_is_clean() {
    let harness = build(test_config(), true, FakeTtsProvider::new());
    harness.pipeline.start().await.unwrap();
    harness.pipeline.stop().await.unwrap();

    let asr = harness.asr.as_ref().unwrap();
    assert!(asr.is_closed());
    assert_eq!(harness.pipeline.state(), TurnState::Idle);
}
