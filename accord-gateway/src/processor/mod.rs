//! Background processor driving the gateway connection.
//!
//! Runs as its own task for the lifetime of the client: it waits for the
//! session arbiter to hand it a connect slot, establishes and authenticates
//! connections, decodes the inbound event stream, dispatches events to the
//! handler registry and decides, on every disconnect, between resuming,
//! re-identifying and shutting down.

pub(crate) mod connect;

use self::connect::ConnectPermit;
use crate::{
    close_code,
    compression::Decompressor,
    config::Config,
    emitter::Emitter,
    event::{Disconnected, Event, HandlerError, SessionReady, Shutdown},
    payload::GatewayFrame,
    registry::DISPATCHES_PER_CACHE_TIMEOUT,
    sender::OutboundQueues,
    session::Session,
    stage::Stage,
    voice::DisconnectCause,
};
use accord_gateway_queue::ConnectNode;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

/// Reason of the close that invalidates the session for good.
const INVALIDATE_REASON: &str = "INVALIDATE_SESSION";

/// Reason of the close sent when an inbound frame couldn't be decoded.
const MALFORMED_REASON: &str = "MALFORMED_PACKAGE";

/// Slot holding the node currently queued with the arbiter, shared with the
/// client facade so shutdown can withdraw it.
pub(crate) type NodeSlot = Arc<Mutex<Option<Arc<dyn ConnectNode>>>>;

/// What to do after a connection ended.
#[derive(Debug, Eq, PartialEq)]
enum Disposition {
    /// Re-attach to the session over a new connection.
    Resume,
    /// The session is gone; queue a fresh identify with the arbiter.
    Reidentify,
    /// Stop for good, reporting the close code.
    Shutdown(u16),
}

/// Outcome of the local resume loop.
#[derive(Debug, Eq, PartialEq)]
enum ResumeOutcome {
    /// A connection was established and the RESUME went out.
    Resumed,
    /// The session id disappeared while backing off.
    SessionLost,
    /// A shutdown was requested while backing off.
    Shutdown,
}

pub(crate) struct GatewayProcessor {
    config: Arc<Config>,
    connect_rx: UnboundedReceiver<ConnectPermit>,
    decompressor: Decompressor,
    dispatches: u64,
    emitter: Emitter,
    gate: connect::ConnectGate,
    node: NodeSlot,
    queues: Arc<OutboundQueues>,
    rx: Option<UnboundedReceiver<TungsteniteMessage>>,
    server_close: Option<(u16, String)>,
    session: Arc<Session>,
    url: String,
}

impl GatewayProcessor {
    pub fn new(
        config: Arc<Config>,
        emitter: Emitter,
        session: Arc<Session>,
        queues: Arc<OutboundQueues>,
        gate: connect::ConnectGate,
        connect_rx: UnboundedReceiver<ConnectPermit>,
        node: NodeSlot,
    ) -> Self {
        let url = connect::build_url(config.gateway_url(), config.compression());
        let decompressor = Decompressor::new(config.compression(), config.shard_info());

        Self {
            config,
            connect_rx,
            decompressor,
            dispatches: 0,
            emitter,
            gate,
            node,
            queues,
            rx: None,
            server_close: None,
            session,
            url,
        }
    }

    pub async fn run(mut self) {
        'lifecycle: loop {
            let permit = tokio::select! {
                maybe_permit = self.connect_rx.recv() => match maybe_permit {
                    Some(permit) => permit,
                    None => break,
                },
                _ = self.session.wait_shutdown() => {
                    self.finalize(1000);

                    break;
                }
            };

            self.node.lock().expect("node poisoned").take();

            if self.session.is_shutdown() {
                self.finalize(1000);

                break;
            }

            if !self.session.first_init() {
                self.session.set_stage(Stage::AttemptingToReconnect);
            }

            let connected = self.connect_and_identify().await;
            permit.complete();

            if let Err(source) = connected {
                tracing::warn!("connecting failed: {source}");

                if let Err(code) = self.queue_reidentify().await {
                    self.finalize(code);

                    break;
                }

                continue;
            }

            loop {
                match self.drive().await {
                    Disposition::Shutdown(code) => {
                        self.finalize(code);

                        break 'lifecycle;
                    }
                    Disposition::Reidentify => {
                        if let Err(code) = self.queue_reidentify().await {
                            self.finalize(code);

                            break 'lifecycle;
                        }

                        continue 'lifecycle;
                    }
                    Disposition::Resume => match self.resume_loop().await {
                        ResumeOutcome::Resumed => continue,
                        ResumeOutcome::Shutdown => {
                            self.finalize(1000);

                            break 'lifecycle;
                        }
                        ResumeOutcome::SessionLost => {
                            if let Err(code) = self.queue_reidentify().await {
                                self.finalize(code);

                                break 'lifecycle;
                            }

                            continue 'lifecycle;
                        }
                    },
                }
            }
        }
    }

    /// Read the connection until it ends, then decide how to proceed.
    async fn drive(&mut self) -> Disposition {
        let mut rx = self.rx.take().expect("a connection is attached");

        while let Some(message) = rx.recv().await {
            match message {
                TungsteniteMessage::Binary(bytes) => self.handle_frame(&bytes).await,
                TungsteniteMessage::Text(text) => self.handle_frame(text.as_bytes()).await,
                TungsteniteMessage::Close(frame) => {
                    tracing::info!(?frame, "got close frame");

                    self.server_close =
                        frame.map(|frame| (u16::from(frame.code), frame.reason.into_owned()));
                }
                _ => {}
            }
        }

        self.resolve_disconnect()
    }

    async fn handle_frame(&mut self, frame: &[u8]) {
        let text = match self.decompressor.decompress(frame) {
            Ok(Some(text)) => text,
            Ok(None) => return,
            Err(source) => {
                tracing::warn!("failed to decompress frame: {source}");
                let _ = self.session.close(4000, MALFORMED_REASON);

                return;
            }
        };

        self.process(&text).await;
    }

    async fn process(&mut self, json: &str) {
        tracing::trace!(%json, "received JSON");

        let frame = match serde_json::from_str::<GatewayFrame>(json) {
            Ok(frame) => frame,
            Err(source) => {
                tracing::warn!(%json, "payload isn't valid JSON: {source}");
                let _ = self.session.close(4000, MALFORMED_REASON);

                return;
            }
        };

        if let Some(seq) = frame.s {
            self.session.set_seq(seq);
        }

        match frame.op {
            0 => self.process_dispatch(&frame, json),
            1 => {
                tracing::debug!("got heartbeat request");

                if let Err(source) = self.session.heartbeat().await {
                    tracing::warn!("error sending requested heartbeat: {source}");
                }
            }
            7 => {
                tracing::debug!("got request to reconnect");
                let _ = self.session.close(4000, "");
            }
            9 => self.process_invalidate_session(&frame.d),
            10 => self.process_hello(&frame.d),
            11 => self.session.heartbeats.receive(),
            op => tracing::debug!(op, "unhandled opcode"),
        }
    }

    fn process_dispatch(&mut self, frame: &GatewayFrame, json: &str) {
        let sequence = self.session.seq();

        let Some(event_type) = frame.t.as_deref() else {
            tracing::warn!("dispatch without an event type");

            return;
        };

        self.dispatches += 1;
        if self.dispatches % DISPATCHES_PER_CACHE_TIMEOUT == 0 {
            if let Some(cache) = self.config.event_cache() {
                cache.timeout(sequence);
            }
        }

        match event_type {
            "READY" => self.process_ready(&frame.d, sequence),
            "RESUMED" => self.process_resumed(),
            "PRESENCES_REPLACE" => self.process_presences_replace(&frame.d, sequence),
            _ => {
                if !frame.d.is_object() {
                    tracing::warn!(event_type, "dispatch data isn't an object");

                    return;
                }

                self.invoke_handler(event_type, sequence, &frame.d);
            }
        }

        // raw listeners see the frame only once handlers mutated the caches
        self.emitter.bytes(json.as_bytes());
    }

    fn process_ready(&mut self, data: &Value, sequence: u64) {
        let Some(session_id) = data.get("session_id").and_then(Value::as_str) else {
            tracing::warn!("READY without a session id");

            return;
        };

        tracing::debug!(session_id, "session established");
        self.session.set_id(session_id.into());
        self.session.set_processing_ready(true);
        self.session.set_initiating(true);
        self.session.set_stage(Stage::LoadingSubsystems);

        self.invoke_handler("READY", sequence, data);

        self.ready();
    }

    /// Complete session initialisation once the READY handler finished.
    fn ready(&mut self) {
        self.session.set_processing_ready(false);
        self.session.set_initiating(false);

        if self.session.first_init() {
            self.session.set_first_init(false);
            self.emitter.event(Event::Ready(SessionReady {
                session_id: self.session.id().map(String::from).unwrap_or_default(),
            }));
        } else {
            self.emitter.event(Event::Reconnected);

            // audio connections of guilds that vanished while the session
            // was replaced have nothing to reattach to
            let audio = self.config.audio_connections();
            let directory = self.config.guild_directory();

            for guild_id in audio.guild_ids() {
                if !directory.guild_exists(guild_id) {
                    audio.close(guild_id, DisconnectCause::RemovedDuringReconnect);
                }
            }
        }

        self.session.set_stage(Stage::Connected);
    }

    fn process_resumed(&mut self) {
        self.session.set_auth_sent(true);

        if self.session.processing_ready() {
            // a READY is still being worked through; its completion emits
            self.session.set_stage(Stage::LoadingSubsystems);
        } else {
            self.session.set_initiating(false);
            self.emitter.event(Event::Resumed);
            self.session.set_stage(Stage::Connected);
        }
    }

    fn process_presences_replace(&mut self, data: &Value, sequence: u64) {
        let Some(presences) = data.as_array() else {
            tracing::warn!("PRESENCES_REPLACE isn't an array");

            return;
        };

        for presence in presences {
            self.invoke_handler("PRESENCE_UPDATE", sequence, presence);
        }
    }

    fn invoke_handler(&self, event_type: &str, sequence: u64, data: &Value) {
        let Some(handler) = self.config.handlers().get(event_type) else {
            tracing::debug!(event_type, "no handler registered");

            return;
        };

        if let Err(source) = handler.handle(sequence, data) {
            tracing::warn!(event_type, %data, "handler failed: {source}");
            self.emitter.event(Event::HandlerError(HandlerError {
                event_type: event_type.to_owned(),
                message: source.to_string(),
            }));
        }
    }

    fn process_invalidate_session(&mut self, data: &Value) {
        self.session.refresh_identify_guard();

        if data.as_bool().unwrap_or_default() {
            tracing::debug!("got request to resume the session");
            let _ = self.session.close(4000, "");
        } else {
            tracing::debug!("got request to invalidate the session");
            self.session.clear_id();
            let _ = self.session.close(1000, INVALIDATE_REASON);
        }
    }

    fn process_hello(&mut self, data: &Value) {
        let interval = data
            .get("heartbeat_interval")
            .and_then(Value::as_u64)
            .unwrap_or_default();

        tracing::debug!(interval, "got hello");

        if interval > 0 {
            self.session.set_heartbeat_interval(interval);
            self.session.start_heartbeater();
        }
    }

    /// Inspect both close frames and pick the path forward.
    fn resolve_disconnect(&mut self) -> Disposition {
        self.session.stop_heartbeater();

        let client_close = self.session.take_close_sent();
        let server_close = self.server_close.take();

        let is_invalidate = client_close
            .as_ref()
            .map_or(false, |(code, reason)| *code == 1000 && reason == INVALIDATE_REASON);
        let closed_by_server = client_close.is_none();

        let frame = if closed_by_server {
            server_close
        } else {
            client_close
        };
        let code = frame.as_ref().map(|(code, _)| *code);
        let reason = frame.and_then(|(_, reason)| (!reason.is_empty()).then_some(reason));

        let reconnectable =
            !closed_by_server || code.map_or(true, close_code::can_reconnect);

        if self.session.is_shutdown() || !reconnectable {
            return Disposition::Shutdown(code.unwrap_or(1006));
        }

        self.decompressor.reset();

        if is_invalidate {
            self.invalidate();
        }

        self.emitter
            .event(Event::Disconnected(Disconnected { code, reason }));

        if self.session.id().is_some() {
            Disposition::Resume
        } else {
            Disposition::Reidentify
        }
    }

    /// Drop the session identity and everything derived from it.
    fn invalidate(&mut self) {
        self.session.invalidate();
        self.queues.clear_chunk();

        if let Some(cache) = self.config.event_cache() {
            cache.clear();
        }

        for cache in self.config.entity_caches() {
            cache.invalidate();
        }
    }

    /// Apply the identify guard, then queue a re-identify with the arbiter.
    async fn queue_reidentify(&mut self) -> Result<(), u16> {
        if let Some(backoff) = self.session.identify_backoff() {
            tracing::debug!(?backoff, "identified recently, sleeping the remainder");

            if self.session.sleep_or_shutdown(backoff).await {
                return Err(1000);
            }
        }

        if self.session.is_shutdown() {
            return Err(1000);
        }

        self.session.set_stage(Stage::ReconnectQueued);

        if self.enqueue_reconnect() {
            Ok(())
        } else {
            tracing::warn!("arbiter rejected the reconnect");

            Err(1006)
        }
    }

    /// Stop everything and emit the shutdown event.
    fn finalize(&mut self, code: u16) {
        tracing::debug!(code, "shutting down");

        self.session.request_shutdown();
        self.session.stop_heartbeater();

        if let Some(node) = self.node.lock().expect("node poisoned").take() {
            self.config.arbiter().remove(&node);
        }

        self.decompressor.shutdown();
        self.session.set_stage(Stage::Shutdown);
        self.queues.notify();

        self.emitter.event(Event::Shutdown(Shutdown { code }));
    }
}
