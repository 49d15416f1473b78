//! In-process stand-in for the Live endpoint.
//!
//! Replies to `clientContent` with one model turn of two text parts and to
//! `realtimeInput` with one audio part, so tests can observe both fan-out
//! paths.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use sahayak_relay::upstream::LiveEndpoint;
use sahayak_relay::LiveSettings;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};

pub const FAKE_AUDIO: &str = "AAAA";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeMode {
    /// Acknowledge every setup.
    Ack,
    /// Accept connections but never acknowledge setup.
    Silent,
    /// Acknowledge text-modality setups only.
    AckTextOnly,
}

pub struct FakeLiveServer {
    pub addr: SocketAddr,
    open: Arc<AtomicUsize>,
    accepted: Arc<AtomicUsize>,
    setups: Arc<Mutex<Vec<Value>>>,
    frames: Arc<Mutex<Vec<Value>>>,
    hangup: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
}

impl FakeLiveServer {
    pub async fn start(mode: FakeMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let open = Arc::new(AtomicUsize::new(0));
        let accepted = Arc::new(AtomicUsize::new(0));
        let setups = Arc::new(Mutex::new(Vec::new()));
        let frames = Arc::new(Mutex::new(Vec::new()));
        let (hangup, _) = broadcast::channel(4);

        let accept_task = {
            let open = Arc::clone(&open);
            let accepted = Arc::clone(&accepted);
            let setups = Arc::clone(&setups);
            let frames = Arc::clone(&frames);
            let hangup = hangup.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    open.fetch_add(1, Ordering::SeqCst);
                    let open = Arc::clone(&open);
                    let setups = Arc::clone(&setups);
                    let frames = Arc::clone(&frames);
                    let hangup = hangup.subscribe();
                    tokio::spawn(async move {
                        serve_upstream(stream, mode, setups, frames, hangup).await;
                        open.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            })
        };

        Self {
            addr,
            open,
            accepted,
            setups,
            frames,
            hangup,
            accept_task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/live", self.addr)
    }

    pub fn settings(&self, handshake_timeout: Duration) -> LiveSettings {
        LiveSettings {
            endpoint: LiveEndpoint::new(self.url(), None),
            model: "models/test-live".into(),
            default_instruction: "You are a test teacher.".into(),
            text_voice: "Aoede".into(),
            audio_voice: "Puck".into(),
            google_search: false,
            handshake_timeout,
        }
    }

    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn accepted_connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn setups(&self) -> Vec<Value> {
        self.setups.lock().unwrap().clone()
    }

    pub fn frames(&self) -> Vec<Value> {
        self.frames.lock().unwrap().clone()
    }

    /// Closes every upstream connection from the server side.
    pub fn hang_up(&self) {
        let _ = self.hangup.send(());
    }

    pub async fn wait_for_open(&self, expected: usize) {
        while self.open_connections() != expected {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for FakeLiveServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_upstream(
    stream: TcpStream,
    mode: FakeMode,
    setups: Arc<Mutex<Vec<Value>>>,
    frames: Arc<Mutex<Vec<Value>>>,
    mut hangup: broadcast::Receiver<()>,
) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                let _ = ws.close(None).await;
                return;
            }
            incoming = ws.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                    Some(Ok(_)) => continue,
                };
                let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                for reply in replies(mode, &frame, &setups, &frames) {
                    if ws.send(Message::Text(reply.to_string().into())).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

fn replies(
    mode: FakeMode,
    frame: &Value,
    setups: &Mutex<Vec<Value>>,
    frames: &Mutex<Vec<Value>>,
) -> Vec<Value> {
    if let Some(setup) = frame.get("setup") {
        setups.lock().unwrap().push(setup.clone());
        let modality = setup["generationConfig"]["responseModalities"]
            .as_str()
            .unwrap_or_default();
        let acknowledge = match mode {
            FakeMode::Ack => true,
            FakeMode::Silent => false,
            FakeMode::AckTextOnly => modality == "text",
        };
        return if acknowledge {
            vec![json!({ "setupComplete": {} })]
        } else {
            Vec::new()
        };
    }

    frames.lock().unwrap().push(frame.clone());
    if frame.get("clientContent").is_some() {
        vec![
            json!({ "serverContent": { "modelTurn": { "parts": [
                { "text": "Hello " },
                { "text": "world" }
            ] } } }),
            json!({ "serverContent": { "turnComplete": true } }),
        ]
    } else if frame.get("realtimeInput").is_some() {
        vec![json!({ "serverContent": { "modelTurn": { "parts": [
            { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": FAKE_AUDIO } }
        ] } } })]
    } else {
        Vec::new()
    }
}
