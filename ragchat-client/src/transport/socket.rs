//! Persistent event connection over a websocket
//!
//! One background task owns the socket. It dispatches incoming frames to the
//! registered handlers one at a time and reconnects with exponential backoff
//! when the connection drops. Room membership is not restored here; state
//! listeners see the `Open` transition and re-join.

use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use ragchat_core::config::TransportConfig;
use ragchat_core::events::Envelope;
use ragchat_core::utils::truncate;
use ragchat_core::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

use super::{ConnectionState, EventChannel, EventHandler, StateListener};

/// State shared between the channel handle and its connection task
struct Shared {
    state: RwLock<ConnectionState>,
    handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
    listeners: RwLock<Vec<StateListener>>,
    /// Frames queued for the socket writer; present only while open
    outbound: RwLock<Option<mpsc::UnboundedSender<String>>>,
    running: AtomicBool,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        {
            let mut state = self.state.write();
            if *state == next {
                return;
            }
            *state = next;
        }
        debug!(state = %next, "event connection state changed");
        let listeners: Vec<StateListener> = self.listeners.read().clone();
        for listener in listeners {
            listener(next);
        }
    }

    fn dispatch(&self, text: &str) {
        let envelope = match Envelope::from_text(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Invalid frame on event connection: {} (raw: {})", e, truncate(text, 120));
                return;
            }
        };

        let handlers = self
            .handlers
            .read()
            .get(&envelope.event)
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(event = %envelope.event, "no handlers registered");
            return;
        }
        for handler in handlers {
            handler(&envelope.data);
        }
    }
}

/// Websocket implementation of [`EventChannel`]
pub struct SocketChannel {
    url: String,
    config: TransportConfig,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl SocketChannel {
    pub fn new(url: impl Into<String>, config: TransportConfig) -> Self {
        Self {
            url: url.into(),
            config,
            shared: Arc::new(Shared {
                state: RwLock::new(ConnectionState::Closed),
                handlers: RwLock::new(HashMap::new()),
                listeners: RwLock::new(Vec::new()),
                outbound: RwLock::new(None),
                running: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the connection task is running
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Spawn the connection task. Calling it again while running is a no-op.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            debug!("Event connection already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let url = self.url.clone();
        let initial = self.config.initial_delay();
        let max = self.config.max_delay();
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            run_connection(url, initial, max, shared, shutdown_rx).await;
        });
        *self.task.lock() = Some(handle);
    }

    /// Stop reconnecting and close the socket, waiting for the connection
    /// task to finish
    pub async fn shutdown(&self) {
        self.signal_shutdown();
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
        *self.shared.outbound.write() = None;
        self.shared.set_state(ConnectionState::Closed);
    }

    fn signal_shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.try_send(());
        }
    }
}

impl EventChannel for SocketChannel {
    fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    fn on(&self, event: &str, handler: EventHandler) {
        self.shared
            .handlers
            .write()
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }

    fn on_state(&self, listener: StateListener) {
        self.shared.listeners.write().push(listener);
    }

    fn connect(&self) {
        self.start();
    }

    fn disconnect(&self) {
        self.signal_shutdown();
    }

    fn emit(&self, event: &str, payload: Value) -> Result<()> {
        let text = Envelope::new(event, payload).to_text()?;
        let outbound = self.shared.outbound.read();
        match outbound.as_ref() {
            Some(tx) => tx
                .send(text)
                .map_err(|_| Error::Connection("Event connection writer stopped".to_string())),
            None => Err(Error::Connection(format!(
                "Event connection is {}",
                self.state()
            ))),
        }
    }
}

/// How one connected session ended
enum SessionEnd {
    Shutdown,
    Closed,
    Errored,
}

async fn run_connection(
    url: String,
    initial_delay: Duration,
    max_delay: Duration,
    shared: Arc<Shared>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut delay = initial_delay;

    loop {
        shared.set_state(ConnectionState::Connecting);
        info!("Connecting to event server at {}", url);

        match connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => {
                info!("Event connection open");
                delay = initial_delay;

                let (mut write, mut read) = ws_stream.split();
                let (tx, mut rx) = mpsc::unbounded_channel::<String>();
                *shared.outbound.write() = Some(tx);
                shared.set_state(ConnectionState::Open);

                let end = loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => {
                            while let Ok(text) = rx.try_recv() {
                                let _ = write.send(WsMessage::Text(text)).await;
                            }
                            let _ = write.send(WsMessage::Close(None)).await;
                            break SessionEnd::Shutdown;
                        }
                        Some(text) = rx.recv() => {
                            if let Err(e) = write.send(WsMessage::Text(text)).await {
                                warn!("Event connection write failed: {}", e);
                                break SessionEnd::Errored;
                            }
                        }
                        msg = read.next() => {
                            match msg {
                                Some(Ok(WsMessage::Text(text))) => shared.dispatch(&text),
                                Some(Ok(WsMessage::Close(_))) | None => {
                                    warn!("Event connection closed by server");
                                    break SessionEnd::Closed;
                                }
                                Some(Err(e)) => {
                                    warn!("Event connection error: {}", e);
                                    break SessionEnd::Errored;
                                }
                                Some(Ok(_)) => {}
                            }
                        }
                    }
                };

                *shared.outbound.write() = None;
                match end {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Closed => shared.set_state(ConnectionState::Closed),
                    SessionEnd::Errored => shared.set_state(ConnectionState::Errored),
                }
            }
            Err(e) => {
                warn!("Event connection failed: {}", e);
                shared.set_state(ConnectionState::Errored);
            }
        }

        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        info!("Reconnecting event connection in {:?}", delay);
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(max_delay);
    }

    shared.set_state(ConnectionState::Closed);
    shared.running.store(false, Ordering::SeqCst);
    debug!("Event connection task stopped");
}
