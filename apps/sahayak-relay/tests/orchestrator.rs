mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sahayak_relay::events::EventKind;
use sahayak_relay::upstream::ClientRole;
use sahayak_relay::{
    RelayError, SessionHandlers, SessionId, SessionKind, SessionOrchestrator, SessionRegistry,
    UpstreamClosed,
};
use support::{FakeLiveServer, FakeMode, FAKE_AUDIO};

#[derive(Default)]
struct Recorded {
    audio: Vec<String>,
    content: Vec<String>,
    errors: Vec<String>,
    closed: Vec<UpstreamClosed>,
}

fn recording_handlers() -> (SessionHandlers, Arc<Mutex<Recorded>>) {
    let recorded = Arc::new(Mutex::new(Recorded::default()));
    let audio = Arc::clone(&recorded);
    let content = Arc::clone(&recorded);
    let errors = Arc::clone(&recorded);
    let closed = Arc::clone(&recorded);
    let handlers = SessionHandlers {
        on_audio: Arc::new(move |chunk| audio.lock().unwrap().audio.push(chunk.data)),
        on_content: Arc::new(move |text| content.lock().unwrap().content.push(text)),
        on_error: Arc::new(move |message| errors.lock().unwrap().errors.push(message)),
        on_closed: Arc::new(move |event| closed.lock().unwrap().closed.push(event)),
    };
    (handlers, recorded)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn orchestrator(server: &FakeLiveServer, timeout: Duration) -> SessionOrchestrator {
    SessionOrchestrator::new(SessionRegistry::new(), server.settings(timeout))
}

#[test_timeout::tokio_timeout_test(10)]
async fn teacher_session_opens_text_and_audio_clients() {
    let server = FakeLiveServer::start(FakeMode::Ack).await;
    let orchestrator = orchestrator(&server, Duration::from_secs(5));

    let id = orchestrator.create_session(Some("Teach fractions")).await.unwrap();

    assert!(orchestrator.is_session_active(&id));
    assert_eq!(orchestrator.registry().len(), 1);
    assert_eq!(
        orchestrator.get_all_sessions_status().get(&id).map(String::as_str),
        Some("TEXT:ACTIVE, AUDIO:ACTIVE")
    );
    assert_eq!(server.open_connections(), 2);

    let setups = server.setups();
    assert_eq!(setups.len(), 2);
    let voice_for = |modality: &str| {
        setups
            .iter()
            .find(|setup| setup["generationConfig"]["responseModalities"] == modality)
            .map(|setup| {
                assert_eq!(setup["model"], "models/test-live");
                assert_eq!(setup["systemInstruction"]["parts"][0]["text"], "Teach fractions");
                setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                    ["voiceName"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .unwrap()
    };
    assert_eq!(voice_for("text"), "Aoede");
    assert_eq!(voice_for("audio"), "Puck");

    orchestrator.close_session(&id);
}

#[test_timeout::tokio_timeout_test(10)]
async fn blank_custom_instruction_uses_default() {
    let server = FakeLiveServer::start(FakeMode::Ack).await;
    let orchestrator = orchestrator(&server, Duration::from_secs(5));

    let id = orchestrator.create_session(Some("   ")).await.unwrap();
    for setup in server.setups() {
        assert_eq!(
            setup["systemInstruction"]["parts"][0]["text"],
            "You are a test teacher."
        );
    }
    orchestrator.close_session(&id);
}

#[test_timeout::tokio_timeout_test(10)]
async fn prompt_creator_uses_one_text_client() {
    let server = FakeLiveServer::start(FakeMode::Ack).await;
    let orchestrator = orchestrator(&server, Duration::from_secs(5));

    let id = orchestrator.create_prompt_creator_session().await.unwrap();

    assert!(orchestrator.is_session_active(&id));
    assert_eq!(server.open_connections(), 1);
    let session = orchestrator.session(&id).unwrap();
    assert_eq!(session.kind(), SessionKind::PromptCreator);
    assert_eq!(session.status_string(), "TEXT:ACTIVE, AUDIO:NONE");

    let setups = server.setups();
    assert_eq!(setups.len(), 1);
    assert_eq!(setups[0]["generationConfig"]["responseModalities"], "text");
    assert!(setups[0]["generationConfig"].get("speechConfig").is_none());
    assert!(setups[0]["systemInstruction"]["parts"][0]["text"]
        .as_str()
        .unwrap()
        .contains("FINAL_PROMPT:"));

    assert!(matches!(
        orchestrator.send_audio(&id, FAKE_AUDIO),
        Err(RelayError::SessionDegraded { .. })
    ));
    orchestrator.close_session(&id);
}

#[test_timeout::tokio_timeout_test(10)]
async fn future_planner_session_is_single_client() {
    let server = FakeLiveServer::start(FakeMode::Ack).await;
    let orchestrator = orchestrator(&server, Duration::from_secs(5));

    let id = orchestrator
        .create(SessionKind::FuturePlanner, Some("ignored"))
        .await
        .unwrap();
    assert_eq!(orchestrator.session(&id).unwrap().kind(), SessionKind::FuturePlanner);
    let instruction = server.setups()[0]["systemInstruction"]["parts"][0]["text"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(instruction.contains("wants to become"));
    orchestrator.close_session(&id);
}

#[test_timeout::tokio_timeout_test(10)]
async fn unacknowledged_setup_times_out_without_leaking() {
    let server = FakeLiveServer::start(FakeMode::Silent).await;
    let orchestrator = orchestrator(&server, Duration::from_millis(300));

    let result = orchestrator.create_session(None).await;

    assert!(matches!(result, Err(RelayError::HandshakeTimeout(_))));
    assert!(orchestrator.registry().is_empty());
    assert_eq!(server.accepted_connections(), 2);
    server.wait_for_open(0).await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn one_failed_client_closes_the_other() {
    let server = FakeLiveServer::start(FakeMode::AckTextOnly).await;
    let orchestrator = orchestrator(&server, Duration::from_millis(300));

    let result = orchestrator.create_session(None).await;

    assert!(result.is_err());
    assert!(orchestrator.registry().is_empty());
    server.wait_for_open(0).await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn close_session_is_idempotent() {
    let server = FakeLiveServer::start(FakeMode::Ack).await;
    let orchestrator = orchestrator(&server, Duration::from_secs(5));
    let id = orchestrator.create_session(None).await.unwrap();
    let session = orchestrator.session(&id).unwrap();

    assert!(orchestrator.close_session(&id));
    assert!(!orchestrator.close_session(&id));

    assert!(!session.text_client().is_open());
    assert!(!session.audio_client().unwrap().is_open());
    assert!(!orchestrator.is_session_active(&id));
    server.wait_for_open(0).await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn text_reply_arrives_as_one_content_event() {
    let server = FakeLiveServer::start(FakeMode::Ack).await;
    let orchestrator = orchestrator(&server, Duration::from_secs(5));
    let id = orchestrator.create_session(None).await.unwrap();
    let (handlers, recorded) = recording_handlers();
    orchestrator.wire_session(&id, &handlers).unwrap();

    orchestrator.send_text(&id, "What is a fraction?").unwrap();
    wait_until(|| !recorded.lock().unwrap().content.is_empty()).await;
    // give a stray second event a chance to show up
    tokio::time::sleep(Duration::from_millis(100)).await;

    let recorded = recorded.lock().unwrap();
    assert_eq!(recorded.content, vec!["Hello world".to_string()]);
    assert!(recorded.audio.is_empty());

    let frames = server.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(
        frames[0]["clientContent"]["turns"][0]["parts"][0]["text"],
        "What is a fraction?"
    );
    assert_eq!(frames[0]["clientContent"]["turnComplete"], true);
}

#[test_timeout::tokio_timeout_test(10)]
async fn audio_reply_arrives_without_content() {
    let server = FakeLiveServer::start(FakeMode::Ack).await;
    let orchestrator = orchestrator(&server, Duration::from_secs(5));
    let id = orchestrator.create_session(None).await.unwrap();
    let (handlers, recorded) = recording_handlers();
    orchestrator.wire_session(&id, &handlers).unwrap();

    orchestrator.send_audio(&id, FAKE_AUDIO).unwrap();
    wait_until(|| !recorded.lock().unwrap().audio.is_empty()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let recorded = recorded.lock().unwrap();
    assert_eq!(recorded.audio, vec![FAKE_AUDIO.to_string()]);
    assert!(recorded.content.is_empty());
    assert_eq!(
        server.frames()[0]["realtimeInput"]["mediaChunks"][0]["mimeType"],
        "audio/pcm;rate=16000"
    );
}

#[test_timeout::tokio_timeout_test(10)]
async fn video_frames_route_to_audio_client() {
    let server = FakeLiveServer::start(FakeMode::Ack).await;
    let orchestrator = orchestrator(&server, Duration::from_secs(5));
    let id = orchestrator.create_session(None).await.unwrap();

    orchestrator.set_screen_sharing(&id, true).unwrap();
    orchestrator.send_video(&id, "/9j/").unwrap();
    wait_until(|| !server.frames().is_empty()).await;

    assert_eq!(
        server.frames()[0]["realtimeInput"]["mediaChunks"][0]["mimeType"],
        "image/jpeg"
    );
    assert!(orchestrator.session(&id).unwrap().screen_sharing());
}

#[test_timeout::tokio_timeout_test(10)]
async fn unwired_sessions_are_detectable() {
    let server = FakeLiveServer::start(FakeMode::Ack).await;
    let orchestrator = orchestrator(&server, Duration::from_secs(5));
    let id = orchestrator.create_session(None).await.unwrap();
    let session = orchestrator.session(&id).unwrap();

    assert!(!session.text_client().subscriptions().is_wired(EventKind::Content));
    let (handlers, _recorded) = recording_handlers();
    orchestrator.wire_session(&id, &handlers).unwrap();
    assert!(session.text_client().subscriptions().is_wired(EventKind::Content));
    assert!(session
        .audio_client()
        .unwrap()
        .subscriptions()
        .is_wired(EventKind::Audio));
}

#[test_timeout::tokio_timeout_test(10)]
async fn upstream_hangup_is_reported_and_degrades_session() {
    let server = FakeLiveServer::start(FakeMode::Ack).await;
    let orchestrator = orchestrator(&server, Duration::from_secs(5));
    let id = orchestrator.create_session(None).await.unwrap();
    let (handlers, recorded) = recording_handlers();
    orchestrator.wire_session(&id, &handlers).unwrap();

    server.hang_up();
    wait_until(|| recorded.lock().unwrap().closed.len() == 2).await;

    let roles: Vec<ClientRole> = recorded
        .lock()
        .unwrap()
        .closed
        .iter()
        .map(|event| event.role)
        .collect();
    assert!(roles.contains(&ClientRole::Text));
    assert!(roles.contains(&ClientRole::Audio));
    assert!(!orchestrator.is_session_active(&id));
    assert!(matches!(
        orchestrator.send_text(&id, "anyone there?"),
        Err(RelayError::SessionDegraded { .. })
    ));
}

#[test_timeout::tokio_timeout_test(10)]
async fn shutdown_closes_every_session() {
    let server = FakeLiveServer::start(FakeMode::Ack).await;
    let orchestrator = orchestrator(&server, Duration::from_secs(5));
    orchestrator.create_session(None).await.unwrap();
    orchestrator.create_prompt_creator_session().await.unwrap();

    assert_eq!(orchestrator.shutdown(), 2);
    assert!(orchestrator.registry().is_empty());
    server.wait_for_open(0).await;
}

#[test]
fn unknown_session_routing_is_not_found() {
    let registry = SessionRegistry::new();
    let settings = sahayak_relay::LiveSettings {
        endpoint: sahayak_relay::upstream::LiveEndpoint::new("ws://127.0.0.1:9", None),
        model: "m".into(),
        default_instruction: "d".into(),
        text_voice: "Aoede".into(),
        audio_voice: "Puck".into(),
        google_search: false,
        handshake_timeout: Duration::from_secs(1),
    };
    let orchestrator = SessionOrchestrator::new(registry, settings);
    let id = SessionId::new();
    assert!(matches!(
        orchestrator.send_text(&id, "hello"),
        Err(RelayError::SessionNotFound(_))
    ));
}
