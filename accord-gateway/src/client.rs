//! Client facade owning the background tasks.

use crate::{
    config::Config,
    emitter::Emitter,
    event::{Event, EventTypeFlags, Shutdown},
    heartbeat::Latency,
    listener::Listeners,
    processor::{
        connect::{ConnectGate, GatewayNode},
        GatewayProcessor, NodeSlot,
    },
    ratelimiter::CommandRatelimiter,
    sender::{OutboundQueues, SenderTask},
    session::Session,
    stage::Stage,
    voice::VoiceRequest,
};
use accord_gateway_queue::{ConnectNode, NodeKind};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver};

/// Client maintaining an identified session with the gateway.
///
/// Starting a client spawns its background tasks and queues the first
/// connection with the session arbiter; from then on the client keeps the
/// session alive on its own, heartbeating, resuming after disconnects and
/// re-identifying when the session is invalidated. Dropping the client does
/// not stop it; call [`shutdown`] for a clean stop.
///
/// # Examples
///
/// Start a client and log its lifecycle events:
///
/// ```no_run
/// use accord_gateway::{Config, GatewayClient};
/// use std::env;
///
/// # #[tokio::main] async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let token = env::var("DISCORD_TOKEN")?;
/// let client = GatewayClient::start(Config::builder(token).build());
///
/// let mut events = client.events();
///
/// while let Some(event) = events.recv().await {
///     println!("{event:?}");
/// }
/// # Ok(()) }
/// ```
///
/// [`shutdown`]: Self::shutdown
#[derive(Debug)]
pub struct GatewayClient {
    config: Arc<Config>,
    listeners: Listeners<Event>,
    node: NodeSlot,
    queues: Arc<OutboundQueues>,
    session: Arc<Session>,
}

impl GatewayClient {
    /// Start a new client with the provided configuration.
    ///
    /// Must be called within a Tokio runtime.
    pub fn start(config: Config) -> Self {
        let config = Arc::new(config);
        let listeners = Listeners::default();
        let emitter = Emitter::new(listeners.clone());
        let session = Arc::new(Session::new());
        let queues = Arc::new(OutboundQueues::new());
        let node: NodeSlot = Arc::new(Mutex::new(None));

        let (connect_tx, connect_rx) = mpsc::unbounded_channel();
        let gate = ConnectGate(connect_tx);

        let processor = GatewayProcessor::new(
            Arc::clone(&config),
            emitter.clone(),
            Arc::clone(&session),
            Arc::clone(&queues),
            gate.clone(),
            connect_rx,
            Arc::clone(&node),
        );
        tokio::spawn(processor.run());

        let sender = SenderTask {
            audio: Arc::clone(config.audio_connections()),
            directory: Arc::clone(config.guild_directory()),
            queues: Arc::clone(&queues),
            session: Arc::clone(&session),
        };
        tokio::spawn(sender.run());

        let start: Arc<dyn ConnectNode> =
            Arc::new(GatewayNode::new(NodeKind::Start, config.shard_info(), gate));
        node.lock()
            .expect("node poisoned")
            .replace(Arc::clone(&start));

        if !config.arbiter().append(start) {
            tracing::warn!("arbiter rejected the start node");

            session.request_shutdown();
            session.set_stage(Stage::Shutdown);
            emitter.event(Event::Shutdown(Shutdown { code: 1006 }));
        }

        Self {
            config,
            listeners,
            node,
            queues,
            session,
        }
    }

    /// Immutable reference to the configuration of this client.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Subscribe to the default set of lifecycle events.
    pub fn events(&self) -> UnboundedReceiver<Event> {
        self.some_events(EventTypeFlags::default())
    }

    /// Subscribe to a chosen set of lifecycle events.
    pub fn some_events(&self, event_types: EventTypeFlags) -> UnboundedReceiver<Event> {
        self.listeners.add(event_types)
    }

    /// Current lifecycle stage.
    pub fn stage(&self) -> Stage {
        self.session.stage()
    }

    /// Heartbeat latency statistics of the session.
    pub fn latency(&self) -> Latency {
        self.session.heartbeats.latency()
    }

    /// Statistics about the outbound rate budget.
    pub fn ratelimiter(&self) -> &CommandRatelimiter {
        &self.session.ratelimit
    }

    /// Queue an already serialised payload for sending.
    ///
    /// General messages are sent after queued chunk/sync requests and audio
    /// connection requests, in FIFO order.
    pub fn send(&self, message: String) {
        self.queues.queue_message(message);
    }

    /// Queue an already serialised member chunk or sync request.
    ///
    /// These are sent before general messages and are dropped when the
    /// session is invalidated, since their responses would refer to a dead
    /// session.
    pub fn request_guild_members(&self, request: String) {
        self.queues.queue_chunk(request);
    }

    /// Queue an audio connect to a channel.
    pub fn connect_audio(&self, guild_id: u64, channel_id: u64) {
        self.queues.queue_voice_connect(guild_id, channel_id);
    }

    /// Queue an audio disconnect-then-connect to a channel.
    pub fn reconnect_audio(&self, guild_id: u64, channel_id: u64) {
        self.queues.queue_voice_reconnect(guild_id, channel_id);
    }

    /// Queue an audio disconnect for a guild.
    pub fn disconnect_audio(&self, guild_id: u64) {
        self.queues.queue_voice_disconnect(guild_id);
    }

    /// Withdraw the queued audio request of a guild, if any.
    pub fn cancel_audio_request(&self, guild_id: u64) -> Option<VoiceRequest> {
        self.queues.remove_voice(guild_id)
    }

    /// Ingest the server's confirmation of this client's voice state.
    ///
    /// Expected to be called by the registered VOICE_STATE_UPDATE handler
    /// whenever the update refers to the current user. Returns the queued
    /// request that the confirmation satisfied, if any.
    pub fn audio_state_update(
        &self,
        guild_id: u64,
        connected_channel: Option<u64>,
    ) -> Option<VoiceRequest> {
        self.queues.voice_update(guild_id, connected_channel)
    }

    /// Shut the client down.
    ///
    /// Withdraws any queued connect from the arbiter, closes the connection
    /// with code 1000 and stops the background tasks. A shutdown event with
    /// the close code is emitted once the connection ended.
    pub fn shutdown(&self) {
        tracing::debug!("shutdown requested");

        if let Some(node) = self.node.lock().expect("node poisoned").take() {
            self.config.arbiter().remove(&node);
        }

        self.session.request_shutdown();

        if let Err(source) = self.session.close(1000, "Shutting down") {
            tracing::debug!("no connection to close: {source}");
        }

        self.queues.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::GatewayClient;
    use crate::{config::Config, event::Event, stage::Stage};
    use accord_gateway_queue::InstantArbiter;
    use static_assertions::assert_impl_all;
    use std::{fmt::Debug, sync::Arc, time::Duration};

    assert_impl_all!(GatewayClient: Debug, Send, Sync);

    #[tokio::test]
    async fn shutdown_emits_event() {
        let config = Config::builder("a token")
            .arbiter(Arc::new(InstantArbiter))
            .gateway_url("wss://127.0.0.1:1")
            .build();

        let client = GatewayClient::start(config);
        let mut events = client.some_events(crate::EventTypeFlags::SHUTDOWN);

        client.shutdown();

        let event = tokio::time::timeout(Duration::from_secs(30), events.recv())
            .await
            .expect("shutdown event in time")
            .expect("listeners open");

        assert!(matches!(event, Event::Shutdown(_)));
        assert_eq!(Stage::Shutdown, client.stage());
    }

    #[tokio::test]
    async fn queue_surface_is_usable_before_connecting() {
        let config = Config::builder("a token")
            .arbiter(Arc::new(InstantArbiter))
            .gateway_url("wss://127.0.0.1:1")
            .build();

        let client = GatewayClient::start(config);

        client.send(r#"{"op":3}"#.to_owned());
        client.request_guild_members(r#"{"op":8}"#.to_owned());
        client.connect_audio(1, 10);

        assert!(client.cancel_audio_request(1).is_some());
        assert!(client.cancel_audio_request(2).is_none());

        client.shutdown();
    }
}
