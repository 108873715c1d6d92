//! Customizable configuration for gateway clients.

use crate::{
    compression::CompressionKind,
    payload::IdentifyProperties,
    registry::{EntityCache, EventCache, HandlerRegistry},
    voice::{AudioConnections, GuildDirectory, NoAudioConnections, PermissiveDirectory},
    GATEWAY_URL,
};
use accord_gateway_queue::{LocalArbiter, SessionArbiter};
use serde_json::Value;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    sync::Arc,
    time::Duration,
};

/// Maximum value of an acceptable [large threshold].
///
/// [large threshold]: ConfigBuilder::large_threshold
pub const LARGE_THRESHOLD_MAXIMUM: u64 = 250;

/// Minimum value of an acceptable [large threshold].
///
/// [large threshold]: ConfigBuilder::large_threshold
pub const LARGE_THRESHOLD_MINIMUM: u64 = 50;

/// Identifier of a shard, including the shard's ID and the total number of
/// shards in use.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ShardId {
    /// Current ID of the shard, 0-indexed.
    current: u64,
    /// Total number of shards used by the bot, 1-indexed.
    total: u64,
}

impl ShardId {
    /// ID of a bot that has only one shard.
    pub const ONE: ShardId = ShardId::new(0, 1);

    /// Create a new identifier for a shard.
    ///
    /// The current shard is 0-indexed while the total number of shards is
    /// 1-indexed. This means that a current shard of 7 with a total of 8 is
    /// valid, while a current shard value of 8 out of 8 total shards is
    /// invalid.
    ///
    /// # Panics
    ///
    /// Panics if the current shard is greater than or equal to the total
    /// number of shards, or if the total number of shards is zero.
    pub const fn new(current: u64, total: u64) -> Self {
        assert!(total > 0, "total must be greater than zero");
        assert!(
            current < total,
            "current shard (0-indexed) must be less than total (1-indexed)",
        );

        Self { current, total }
    }

    /// ID of the shard, 0-indexed.
    pub const fn current(self) -> u64 {
        self.current
    }

    /// Total number of shards, 1-indexed.
    pub const fn total(self) -> u64 {
        self.total
    }
}

/// Display the shard ID.
///
/// Formats as `shard {current}/{total}`.
impl Display for ShardId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str("shard ")?;
        Display::fmt(&self.current, f)?;
        f.write_str("/")?;

        Display::fmt(&self.total, f)
    }
}

/// Configuration used by a client to identify with the gateway and operate.
///
/// Use [`Config::builder`] to start configuring a client.
#[derive(Clone, Debug)]
pub struct Config {
    arbiter: Arc<dyn SessionArbiter>,
    audio_connections: Arc<dyn AudioConnections>,
    compression: CompressionKind,
    entity_caches: Vec<Arc<dyn EntityCache>>,
    event_cache: Option<Arc<dyn EventCache>>,
    gateway_url: String,
    guild_directory: Arc<dyn GuildDirectory>,
    handlers: Arc<HandlerRegistry>,
    identify_properties: Option<IdentifyProperties>,
    large_threshold: u64,
    max_reconnect_delay: Duration,
    presence: Option<Value>,
    shard: Option<ShardId>,
    token: String,
}

impl Config {
    /// Create a new builder with a token.
    pub fn builder(token: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder::new(token.into())
    }

    pub fn arbiter(&self) -> &Arc<dyn SessionArbiter> {
        &self.arbiter
    }

    pub fn audio_connections(&self) -> &Arc<dyn AudioConnections> {
        &self.audio_connections
    }

    pub const fn compression(&self) -> CompressionKind {
        self.compression
    }

    pub fn entity_caches(&self) -> &[Arc<dyn EntityCache>] {
        &self.entity_caches
    }

    pub fn event_cache(&self) -> Option<&Arc<dyn EventCache>> {
        self.event_cache.as_ref()
    }

    pub fn gateway_url(&self) -> &str {
        &self.gateway_url
    }

    pub fn guild_directory(&self) -> &Arc<dyn GuildDirectory> {
        &self.guild_directory
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn identify_properties(&self) -> Option<&IdentifyProperties> {
        self.identify_properties.as_ref()
    }

    pub const fn large_threshold(&self) -> u64 {
        self.large_threshold
    }

    pub const fn max_reconnect_delay(&self) -> Duration {
        self.max_reconnect_delay
    }

    pub fn presence(&self) -> Option<&Value> {
        self.presence.as_ref()
    }

    /// Shard of the session, if sharding is in use.
    pub const fn shard(&self) -> Option<ShardId> {
        self.shard
    }

    /// Shard of the session as `[id, total]`, defaulting to a single shard.
    pub fn shard_info(&self) -> [u64; 2] {
        self.shard
            .map_or([0, 1], |shard| [shard.current(), shard.total()])
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Builder to customize and construct a [`Config`].
#[derive(Debug)]
pub struct ConfigBuilder(Config);

impl ConfigBuilder {
    fn new(token: String) -> Self {
        Self(Config {
            arbiter: Arc::new(LocalArbiter::new()),
            audio_connections: Arc::new(NoAudioConnections),
            compression: CompressionKind::ZlibStream,
            entity_caches: Vec::new(),
            event_cache: None,
            gateway_url: GATEWAY_URL.to_owned(),
            guild_directory: Arc::new(PermissiveDirectory),
            handlers: Arc::new(HandlerRegistry::new()),
            identify_properties: None,
            large_threshold: LARGE_THRESHOLD_MAXIMUM,
            max_reconnect_delay: Duration::from_secs(900),
            presence: None,
            shard: None,
            token,
        })
    }

    /// Consume the builder, returning the final configuration.
    pub fn build(self) -> Config {
        self.0
    }

    /// Arbiter serialising identifies across shards.
    ///
    /// Defaults to a [`LocalArbiter`], which is only correct when every
    /// shard of the token lives in this process.
    pub fn arbiter(mut self, arbiter: Arc<dyn SessionArbiter>) -> Self {
        self.0.arbiter = arbiter;

        self
    }

    /// Handle on the per-guild audio connections.
    pub fn audio_connections(mut self, audio_connections: Arc<dyn AudioConnections>) -> Self {
        self.0.audio_connections = audio_connections;

        self
    }

    /// Transport compression to negotiate with the gateway.
    pub fn compression(mut self, compression: CompressionKind) -> Self {
        self.0.compression = compression;

        self
    }

    /// Entity caches flushed when the session is invalidated.
    pub fn entity_caches(mut self, entity_caches: Vec<Arc<dyn EntityCache>>) -> Self {
        self.0.entity_caches = entity_caches;

        self
    }

    /// Cache of deferred lookups, expired on a fixed dispatch cadence.
    pub fn event_cache(mut self, event_cache: Arc<dyn EventCache>) -> Self {
        self.0.event_cache = Some(event_cache);

        self
    }

    /// Base URL to connect to, without query parameters.
    pub fn gateway_url(mut self, gateway_url: impl Into<String>) -> Self {
        self.0.gateway_url = gateway_url.into();

        self
    }

    /// Directory answering guild, channel and permission lookups for the
    /// audio request queue.
    pub fn guild_directory(mut self, guild_directory: Arc<dyn GuildDirectory>) -> Self {
        self.0.guild_directory = guild_directory;

        self
    }

    /// Registry of dispatch event handlers.
    pub fn handlers(mut self, handlers: Arc<HandlerRegistry>) -> Self {
        self.0.handlers = handlers;

        self
    }

    /// Client properties reported when identifying.
    pub fn identify_properties(mut self, identify_properties: IdentifyProperties) -> Self {
        self.0.identify_properties = Some(identify_properties);

        self
    }

    /// Member count above which a guild's offline members are omitted.
    ///
    /// # Panics
    ///
    /// Panics if the value is outside 50..=250.
    pub fn large_threshold(mut self, large_threshold: u64) -> Self {
        assert!(
            (LARGE_THRESHOLD_MINIMUM..=LARGE_THRESHOLD_MAXIMUM).contains(&large_threshold),
            "large threshold isn't in the accepted range",
        );

        self.0.large_threshold = large_threshold;

        self
    }

    /// Upper bound of the reconnect backoff.
    pub fn max_reconnect_delay(mut self, max_reconnect_delay: Duration) -> Self {
        self.0.max_reconnect_delay = max_reconnect_delay;

        self
    }

    /// Presence to assume on connect, passed through opaquely.
    pub fn presence(mut self, presence: Value) -> Self {
        self.0.presence = Some(presence);

        self
    }

    /// Shard of the session.
    pub fn shard(mut self, shard: ShardId) -> Self {
        self.0.shard = Some(shard);

        self
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, ConfigBuilder, ShardId};
    use static_assertions::assert_impl_all;
    use std::fmt::Debug;

    assert_impl_all!(Config: Clone, Debug, Send, Sync);
    assert_impl_all!(ConfigBuilder: Debug, Send, Sync);
    assert_impl_all!(ShardId: Clone, Copy, Debug, Eq, PartialEq, Send, Sync);

    #[test]
    fn shard_id_display() {
        assert_eq!("shard 2/4", ShardId::new(2, 4).to_string());
        assert_eq!("shard 0/1", ShardId::ONE.to_string());
    }

    #[test]
    #[should_panic(expected = "current shard")]
    fn shard_id_validates() {
        ShardId::new(4, 4);
    }

    #[tokio::test]
    async fn defaults() {
        let config = Config::builder("a token").build();

        assert_eq!("a token", config.token());
        assert_eq!(250, config.large_threshold());
        assert!(config.shard().is_none());
        assert_eq!([0, 1], config.shard_info());
        assert!(config.presence().is_none());
    }

    #[tokio::test]
    #[should_panic(expected = "large threshold")]
    async fn large_threshold_validates() {
        Config::builder("a token").large_threshold(49);
    }
}
