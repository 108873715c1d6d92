//! State of the identified gateway session.

use crate::{
    error::{SendError, SendErrorType},
    heartbeat::{Heartbeater, Heartbeats},
    payload::Heartbeat,
    ratelimiter::CommandRatelimiter,
    stage::Stage,
};
use futures_util::future::{self, AbortHandle};
use serde::Serialize;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc::UnboundedSender, watch, Notify},
    time::Instant,
};
use tokio_tungstenite::tungstenite::{
    protocol::{frame::coding::CloseCode, CloseFrame},
    Message as TungsteniteMessage,
};

/// Minimum spacing between two IDENTIFY payloads on one token.
const IDENTIFY_INTERVAL: Duration = Duration::from_millis(5_000);

/// Shared state of one client's gateway session.
///
/// The session outlives individual websocket connections: the socket writer
/// is swapped on every reconnect while the identity (session id, sequence,
/// handshake flags) carries over so the next connection can resume.
#[derive(Debug)]
pub struct Session {
    auth_sent: AtomicBool,
    close_sent: Mutex<Option<(u16, String)>>,
    first_init: AtomicBool,
    handle_identify_ratelimit: AtomicBool,
    heartbeater_handle: Mutex<Option<AbortHandle>>,
    pub heartbeats: Arc<Heartbeats>,
    heartbeat_interval: AtomicU64,
    id: Mutex<Option<Box<str>>>,
    identify_time: Mutex<Option<Instant>>,
    initiating: AtomicBool,
    processing_ready: AtomicBool,
    pub ratelimit: Arc<CommandRatelimiter>,
    seq: Arc<AtomicU64>,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
    stage_rx: watch::Receiver<Stage>,
    stage_tx: watch::Sender<Stage>,
    tx: Mutex<Option<UnboundedSender<TungsteniteMessage>>>,
}

impl Session {
    pub fn new() -> Self {
        let (stage_tx, stage_rx) = watch::channel(Stage::default());

        Self {
            auth_sent: AtomicBool::new(false),
            close_sent: Mutex::new(None),
            first_init: AtomicBool::new(true),
            handle_identify_ratelimit: AtomicBool::new(false),
            heartbeater_handle: Mutex::new(None),
            heartbeats: Arc::new(Heartbeats::default()),
            heartbeat_interval: AtomicU64::new(0),
            id: Mutex::new(None),
            identify_time: Mutex::new(None),
            initiating: AtomicBool::new(false),
            processing_ready: AtomicBool::new(false),
            ratelimit: Arc::new(CommandRatelimiter::new()),
            seq: Arc::new(AtomicU64::new(0)),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            stage_rx,
            stage_tx,
            tx: Mutex::new(None),
        }
    }

    /// Attach the writer of a freshly established connection.
    pub fn set_tx(&self, tx: UnboundedSender<TungsteniteMessage>) {
        self.tx.lock().expect("tx poisoned").replace(tx);
        self.close_sent.lock().expect("close poisoned").take();
    }

    /// Send an already serialised JSON text over the socket.
    ///
    /// The caller must have acquired a slot from the rate bucket.
    pub fn send_text(&self, json: String) -> Result<(), SendError> {
        let tx = self.tx.lock().expect("tx poisoned");

        tx.as_ref()
            .ok_or(SendError {
                kind: SendErrorType::Sending,
                source: None,
            })?
            .send(TungsteniteMessage::Text(json))
            .map_err(|source| SendError {
                kind: SendErrorType::Sending,
                source: Some(Box::new(source)),
            })
    }

    /// Send a lifecycle payload, parking until the rate bucket's priority
    /// reserve has room.
    pub async fn send_priority(&self, payload: &impl Serialize) -> Result<(), SendError> {
        let json = serde_json::to_string(payload).map_err(|source| SendError {
            kind: SendErrorType::Serializing,
            source: Some(Box::new(source)),
        })?;

        while !self.ratelimit.acquire(true) {
            tokio::time::sleep(self.ratelimit.time_until_reset()).await;
        }

        self.send_text(json)
    }

    /// Send an immediate heartbeat with the current sequence.
    pub async fn heartbeat(&self) -> Result<(), SendError> {
        self.heartbeats.send();

        self.send_priority(&Heartbeat::new(self.seq())).await
    }

    /// Close the connection, recording the frame for the disconnect
    /// resolution.
    ///
    /// Close frames share the writer with regular sends but are never
    /// delayed behind the rate window; holding a close back would keep a
    /// broken connection alive.
    pub fn close(&self, code: u16, reason: &str) -> Result<(), SendError> {
        let _ = self.ratelimit.acquire(true);

        self.close_sent
            .lock()
            .expect("close poisoned")
            .replace((code, reason.to_owned()));

        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };

        let tx = self.tx.lock().expect("tx poisoned");

        tx.as_ref()
            .ok_or(SendError {
                kind: SendErrorType::Sending,
                source: None,
            })?
            .send(TungsteniteMessage::Close(Some(frame)))
            .map_err(|source| SendError {
                kind: SendErrorType::Sending,
                source: Some(Box::new(source)),
            })
    }

    /// Close frame this side sent, if any.
    pub fn take_close_sent(&self) -> Option<(u16, String)> {
        self.close_sent.lock().expect("close poisoned").take()
    }

    /// Returns the current sequence.
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }

    /// Advance the sequence; it never moves backwards.
    pub fn set_seq(&self, seq: u64) {
        self.seq.fetch_max(seq, Ordering::AcqRel);
    }

    /// Returns the current lifecycle stage.
    pub fn stage(&self) -> Stage {
        *self.stage_rx.borrow()
    }

    /// Transition the lifecycle stage, waking all stage waiters.
    pub fn set_stage(&self, stage: Stage) {
        tracing::debug!(%stage, "stage transition");
        self.stage_tx.send_replace(stage);
    }

    /// Wait until the stage satisfies the predicate, returning it.
    pub async fn wait_for_stage(&self, predicate: impl Fn(Stage) -> bool) -> Stage {
        let mut rx = self.stage_rx.clone();

        loop {
            let stage = *rx.borrow_and_update();

            if predicate(stage) || rx.changed().await.is_err() {
                return stage;
            }
        }
    }

    pub fn id(&self) -> Option<Box<str>> {
        self.id.lock().expect("id poisoned").clone()
    }

    pub fn set_id(&self, new_id: Box<str>) {
        self.id.lock().expect("id poisoned").replace(new_id);
    }

    pub fn clear_id(&self) {
        self.id.lock().expect("id poisoned").take();
    }

    pub fn auth_sent(&self) -> bool {
        self.auth_sent.load(Ordering::Relaxed)
    }

    pub fn set_auth_sent(&self, value: bool) {
        self.auth_sent.store(value, Ordering::Release);
    }

    pub fn initiating(&self) -> bool {
        self.initiating.load(Ordering::Relaxed)
    }

    pub fn set_initiating(&self, value: bool) {
        self.initiating.store(value, Ordering::Release);
    }

    pub fn processing_ready(&self) -> bool {
        self.processing_ready.load(Ordering::Relaxed)
    }

    pub fn set_processing_ready(&self, value: bool) {
        self.processing_ready.store(value, Ordering::Release);
    }

    /// Whether no session has ever finished initialising.
    pub fn first_init(&self) -> bool {
        self.first_init.load(Ordering::Relaxed)
    }

    pub fn set_first_init(&self, value: bool) {
        self.first_init.store(value, Ordering::Release);
    }

    /// Drop the session identity so the next connection identifies anew.
    ///
    /// Calling this twice is equivalent to calling it once.
    pub fn invalidate(&self) {
        self.clear_id();
        self.set_auth_sent(false);
    }

    /// Record that an IDENTIFY was transmitted just now.
    pub fn record_identify(&self) {
        self.handle_identify_ratelimit.store(true, Ordering::Release);
        self.identify_time
            .lock()
            .expect("identify poisoned")
            .replace(Instant::now());
    }

    /// Keep the identify guard only while the last IDENTIFY is recent.
    pub fn refresh_identify_guard(&self) {
        let recent = self
            .identify_time
            .lock()
            .expect("identify poisoned")
            .map_or(false, |at| at.elapsed() < IDENTIFY_INTERVAL);

        self.handle_identify_ratelimit
            .fetch_and(recent, Ordering::AcqRel);
    }

    /// Time to sleep before the next IDENTIFY may be sent, if any.
    pub fn identify_backoff(&self) -> Option<Duration> {
        if !self.handle_identify_ratelimit.load(Ordering::Acquire) {
            return None;
        }

        let at = (*self.identify_time.lock().expect("identify poisoned"))?;
        let remaining = IDENTIFY_INTERVAL.checked_sub(at.elapsed())?;

        (!remaining.is_zero()).then_some(remaining)
    }

    pub fn heartbeat_interval(&self) -> u64 {
        self.heartbeat_interval.load(Ordering::Relaxed)
    }

    pub fn set_heartbeat_interval(&self, new_heartbeat_interval: u64) {
        self.heartbeat_interval
            .store(new_heartbeat_interval, Ordering::Release);
    }

    /// Request a cooperative shutdown, waking every parked task.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.shutdown_notify.notify_waiters();
        // re-announce the stage so stage waiters observe the flag
        self.stage_tx.send_replace(self.stage());
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Wait for a shutdown request.
    pub async fn wait_shutdown(&self) {
        while !self.is_shutdown() {
            self.shutdown_notify.notified().await;
        }
    }

    /// Sleep, returning early with `true` when a shutdown was requested.
    pub async fn sleep_or_shutdown(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.wait_shutdown() => true,
            _ = tokio::time::sleep(duration) => self.is_shutdown(),
        }
    }

    pub fn stop_heartbeater(&self) {
        if let Some(handle) = self
            .heartbeater_handle
            .lock()
            .expect("heartbeater poisoned")
            .take()
        {
            handle.abort();
        }
    }

    /// Spawn a heartbeater against the current connection, replacing any
    /// previous one.
    pub fn start_heartbeater(&self) {
        let interval = self.heartbeat_interval();

        let Some(tx) = self.tx.lock().expect("tx poisoned").clone() else {
            tracing::error!("no connection to heartbeat on");

            return;
        };

        let heartbeater = Heartbeater::new(
            Arc::clone(&self.heartbeats),
            interval,
            Arc::clone(&self.ratelimit),
            Arc::clone(&self.seq),
            tx,
        )
        .run();
        let (fut, handle) = future::abortable(heartbeater);

        tokio::spawn(fut);

        if let Some(old) = self
            .heartbeater_handle
            .lock()
            .expect("heartbeater poisoned")
            .replace(handle)
        {
            old.abort();
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_heartbeater();
    }
}
