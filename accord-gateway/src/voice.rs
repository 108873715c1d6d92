//! Queue of audio connection requests, one per guild.
//!
//! Joining, moving and leaving voice channels all go over the gateway as
//! VOICE_STATE_UPDATE payloads, and the server confirms them with a
//! VOICE_STATE_UPDATE dispatch. Requests for the same guild issued before
//! the previous one was confirmed must collapse into a single request, and
//! an unconfirmed request is re-sent on a fixed cadence until the server
//! answers. The actual UDP audio transport is not this crate's concern; it
//! is reached through [`AudioConnections`].

use std::{
    collections::{hash_map::Entry, HashMap},
    fmt::Debug,
    time::Duration,
};
use tokio::time::Instant;

/// Delay before an unconfirmed request is transmitted again.
const RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// What a queued request is trying to do.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionStage {
    /// Join a channel the client isn't connected to in this guild.
    Connect,
    /// Leave the current channel, then join the requested one.
    Reconnect,
    /// Leave the current channel.
    Disconnect,
}

/// Why an audio connection was closed by the gateway core.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DisconnectCause {
    /// The guild the connection belonged to no longer exists.
    RemovedFromGuild,
    /// The target channel was deleted.
    ChannelDeleted,
    /// Permission to connect to the target channel was revoked.
    LostPermission,
    /// The guild disappeared while a new session replaced an invalidated
    /// one.
    RemovedDuringReconnect,
}

/// A queued audio connection request for one guild.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VoiceRequest {
    /// Guild the request applies to.
    pub guild_id: u64,
    /// Target channel; `None` for disconnects.
    pub channel_id: Option<u64>,
    /// What the request is trying to do.
    pub stage: ConnectionStage,
    /// Earliest time the request may be transmitted.
    next_attempt: Instant,
}

impl VoiceRequest {
    #[cfg(test)]
    pub(crate) fn next_attempt(&self) -> Instant {
        self.next_attempt
    }
}

/// Lookup of guild and channel liveness, and of connect permission.
///
/// Backed by the entity caches, which live outside this crate.
pub trait GuildDirectory: Debug + Send + Sync {
    /// Whether the guild still exists.
    fn guild_exists(&self, guild_id: u64) -> bool;

    /// Whether the channel still exists within the guild.
    fn channel_exists(&self, guild_id: u64, channel_id: u64) -> bool;

    /// Whether the client may connect to the channel.
    fn can_connect(&self, guild_id: u64, channel_id: u64) -> bool;
}

/// A directory that reports every guild and channel as available.
///
/// Used when no entity caches are wired up; eligibility checks then never
/// drop a request.
#[derive(Debug)]
pub struct PermissiveDirectory;

impl GuildDirectory for PermissiveDirectory {
    fn guild_exists(&self, _guild_id: u64) -> bool {
        true
    }

    fn channel_exists(&self, _guild_id: u64, _channel_id: u64) -> bool {
        true
    }

    fn can_connect(&self, _guild_id: u64, _channel_id: u64) -> bool {
        true
    }
}

/// Handle on the per-guild audio connections owned by the voice subsystem.
pub trait AudioConnections: Debug + Send + Sync {
    /// Guilds that currently have an audio connection.
    fn guild_ids(&self) -> Vec<u64>;

    /// Close the audio connection of a guild, reporting why.
    fn close(&self, guild_id: u64, cause: DisconnectCause);
}

/// An [`AudioConnections`] with no connections.
#[derive(Debug)]
pub struct NoAudioConnections;

impl AudioConnections for NoAudioConnections {
    fn guild_ids(&self) -> Vec<u64> {
        Vec::new()
    }

    fn close(&self, _guild_id: u64, _cause: DisconnectCause) {}
}

/// Result of one [`VoiceQueue::next_ready`] pass.
#[derive(Debug, Default)]
pub struct NextReady {
    /// Request to transmit, if any became eligible.
    pub request: Option<VoiceRequest>,
    /// Requests dropped by the eligibility checks, with the cause to
    /// report.
    pub removed: Vec<(u64, DisconnectCause)>,
    /// Time until the earliest not-yet-due request, for parking.
    pub retry_in: Option<Duration>,
}

/// Coalescing table of audio connection requests, keyed by guild.
///
/// At most one request exists per guild; queueing against a guild that
/// already has one merges the two. The table is only touched while the
/// outbound queue lock is held.
#[derive(Debug, Default)]
pub struct VoiceQueue {
    requests: HashMap<u64, VoiceRequest>,
}

impl VoiceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a connect to a channel.
    pub fn queue_connect(&mut self, guild_id: u64, channel_id: u64) {
        self.coalesce(guild_id, ConnectionStage::Connect, Some(channel_id));
    }

    /// Queue a disconnect-then-connect to a channel.
    pub fn queue_reconnect(&mut self, guild_id: u64, channel_id: u64) {
        self.coalesce(guild_id, ConnectionStage::Reconnect, Some(channel_id));
    }

    /// Queue a disconnect.
    pub fn queue_disconnect(&mut self, guild_id: u64) {
        self.coalesce(guild_id, ConnectionStage::Disconnect, None);
    }

    /// Remove and return the queued request of a guild.
    pub fn remove(&mut self, guild_id: u64) -> Option<VoiceRequest> {
        self.requests.remove(&guild_id)
    }

    /// Number of queued requests.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether no requests are queued.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Ingest the server's confirmation of the client's voice state in a
    /// guild.
    ///
    /// `connected_channel` is the channel the server reports the client in,
    /// or `None` when disconnected. Returns the queued request when the
    /// report satisfies it; a satisfied request is removed from the table.
    ///
    /// A disconnect confirmation against a `Reconnect` request flips the
    /// request to `Connect` and makes it due immediately, but returns
    /// `None`: the sender's next pass transmits the connect half.
    pub fn update(&mut self, guild_id: u64, connected_channel: Option<u64>) -> Option<VoiceRequest> {
        let request = self.requests.get_mut(&guild_id)?;

        match connected_channel {
            None => match request.stage {
                ConnectionStage::Disconnect => self.requests.remove(&guild_id),
                ConnectionStage::Reconnect => {
                    request.stage = ConnectionStage::Connect;
                    request.next_attempt = Instant::now();

                    None
                }
                ConnectionStage::Connect => None,
            },
            Some(channel_id) => {
                if request.stage == ConnectionStage::Connect
                    && request.channel_id == Some(channel_id)
                {
                    self.requests.remove(&guild_id)
                } else {
                    None
                }
            }
        }
    }

    /// Find the next request ready for transmission.
    ///
    /// Requests whose attempt time hasn't come are skipped. A non-disconnect
    /// request whose guild or channel vanished, or whose channel the client
    /// may no longer connect to, is dropped and reported in
    /// [`NextReady::removed`]. The returned request stays queued, with its
    /// attempt time pushed out, until [`update`] confirms it.
    ///
    /// [`update`]: Self::update
    pub fn next_ready(&mut self, directory: &dyn GuildDirectory) -> NextReady {
        let now = Instant::now();
        let mut result = NextReady::default();
        let mut ready = None;

        let guild_ids = self.requests.keys().copied().collect::<Vec<_>>();

        for guild_id in guild_ids {
            let request = self.requests[&guild_id];

            if request.next_attempt > now {
                let wait = request.next_attempt - now;
                result.retry_in = Some(result.retry_in.map_or(wait, |prev| prev.min(wait)));

                continue;
            }

            if request.stage != ConnectionStage::Disconnect {
                let channel_id = request.channel_id.expect("non-disconnect has a channel");

                let cause = if !directory.guild_exists(guild_id) {
                    Some(DisconnectCause::RemovedFromGuild)
                } else if !directory.channel_exists(guild_id, channel_id) {
                    Some(DisconnectCause::ChannelDeleted)
                } else if !directory.can_connect(guild_id, channel_id) {
                    Some(DisconnectCause::LostPermission)
                } else {
                    None
                };

                if let Some(cause) = cause {
                    self.requests.remove(&guild_id);
                    result.removed.push((guild_id, cause));

                    continue;
                }
            }

            ready = Some(guild_id);
            break;
        }

        if let Some(guild_id) = ready {
            let request = self
                .requests
                .get_mut(&guild_id)
                .expect("ready request is queued");
            request.next_attempt = now + RETRY_INTERVAL;

            result.request = Some(*request);
        }

        result
    }

    /// Drop every queued request.
    pub fn clear(&mut self) {
        self.requests.clear();
    }

    fn coalesce(&mut self, guild_id: u64, stage: ConnectionStage, channel_id: Option<u64>) {
        use ConnectionStage::{Connect, Disconnect, Reconnect};

        let request = match self.requests.entry(guild_id) {
            Entry::Vacant(entry) => {
                entry.insert(VoiceRequest {
                    guild_id,
                    channel_id,
                    stage,
                    next_attempt: Instant::now(),
                });

                return;
            }
            Entry::Occupied(entry) => entry.into_mut(),
        };

        request.stage = match (request.stage, stage) {
            (_, Disconnect) => Disconnect,
            (Connect, Connect) => Connect,
            // A pending disconnect followed by a connect must leave the
            // old channel first.
            (Disconnect, Connect | Reconnect) => Reconnect,
            (_, Reconnect) | (Reconnect, Connect) => Reconnect,
        };

        if request.stage == Disconnect {
            request.channel_id = None;
        } else if channel_id.is_some() {
            request.channel_id = channel_id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        AudioConnections, ConnectionStage, DisconnectCause, GuildDirectory, NoAudioConnections,
        PermissiveDirectory, VoiceQueue, RETRY_INTERVAL,
    };
    use static_assertions::{assert_impl_all, assert_obj_safe};
    use std::fmt::Debug;
    use tokio::time::Instant;

    assert_impl_all!(VoiceQueue: Debug, Default, Send, Sync);
    assert_obj_safe!(GuildDirectory, AudioConnections);

    const GUILD: u64 = 1;

    fn stage(queue: &mut VoiceQueue, guild_id: u64) -> Option<ConnectionStage> {
        let request = queue.remove(guild_id)?;
        Some(request.stage)
    }

    #[tokio::test(start_paused = true)]
    async fn coalescing_matches_table() {
        use ConnectionStage::{Connect, Disconnect, Reconnect};

        let cases: &[(&[ConnectionStage], ConnectionStage)] = &[
            (&[Connect], Connect),
            (&[Reconnect], Reconnect),
            (&[Disconnect], Disconnect),
            (&[Connect, Connect], Connect),
            (&[Connect, Reconnect], Reconnect),
            (&[Connect, Disconnect], Disconnect),
            (&[Reconnect, Connect], Reconnect),
            (&[Reconnect, Reconnect], Reconnect),
            (&[Reconnect, Disconnect], Disconnect),
            (&[Disconnect, Connect], Reconnect),
            (&[Disconnect, Reconnect], Reconnect),
            (&[Disconnect, Disconnect], Disconnect),
        ];

        for (sequence, expected) in cases {
            let mut queue = VoiceQueue::new();

            for step in *sequence {
                match step {
                    Connect => queue.queue_connect(GUILD, 10),
                    Reconnect => queue.queue_reconnect(GUILD, 10),
                    Disconnect => queue.queue_disconnect(GUILD),
                }
            }

            assert_eq!(
                Some(*expected),
                stage(&mut queue, GUILD),
                "sequence {sequence:?}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connect_updates_channel() {
        let mut queue = VoiceQueue::new();
        queue.queue_connect(GUILD, 10);
        queue.queue_connect(GUILD, 20);

        let request = queue.remove(GUILD).unwrap();
        assert_eq!(ConnectionStage::Connect, request.stage);
        assert_eq!(Some(20), request.channel_id);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_then_connect_reconnects_to_new_channel() {
        let mut queue = VoiceQueue::new();
        queue.queue_connect(GUILD, 10);
        queue.queue_disconnect(GUILD);
        queue.queue_connect(GUILD, 20);

        let request = queue.remove(GUILD).unwrap();
        assert_eq!(ConnectionStage::Reconnect, request.stage);
        assert_eq!(Some(20), request.channel_id);
    }

    #[tokio::test(start_paused = true)]
    async fn one_request_per_guild() {
        let mut queue = VoiceQueue::new();
        queue.queue_connect(GUILD, 10);
        queue.queue_reconnect(GUILD, 20);
        queue.queue_connect(2, 30);

        assert_eq!(2, queue.len());
    }

    #[tokio::test(start_paused = true)]
    async fn update_without_request_is_none() {
        let mut queue = VoiceQueue::new();

        assert!(queue.update(GUILD, None).is_none());
        assert!(queue.update(GUILD, Some(10)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn update_confirms_disconnect() {
        let mut queue = VoiceQueue::new();
        queue.queue_disconnect(GUILD);

        let request = queue.update(GUILD, None).unwrap();
        assert_eq!(ConnectionStage::Disconnect, request.stage);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn update_flips_reconnect_to_connect() {
        let mut queue = VoiceQueue::new();
        queue.queue_reconnect(GUILD, 10);

        // push the attempt time out as if the reconnect had been sent
        queue.next_ready(&PermissiveDirectory);

        assert!(queue.update(GUILD, None).is_none());

        let request = queue.remove(GUILD).unwrap();
        assert_eq!(ConnectionStage::Connect, request.stage);
        assert!(request.next_attempt() <= Instant::now());
    }

    #[tokio::test(start_paused = true)]
    async fn update_confirms_connect_on_matching_channel() {
        let mut queue = VoiceQueue::new();
        queue.queue_connect(GUILD, 10);

        assert!(queue.update(GUILD, Some(20)).is_none());
        assert_eq!(1, queue.len());

        let request = queue.update(GUILD, Some(10)).unwrap();
        assert_eq!(Some(10), request.channel_id);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn next_ready_defers_repeat_attempts() {
        let mut queue = VoiceQueue::new();
        queue.queue_connect(GUILD, 10);

        let first = queue.next_ready(&PermissiveDirectory);
        assert_eq!(GUILD, first.request.unwrap().guild_id);

        // unconfirmed, so it stays queued but isn't due yet
        let second = queue.next_ready(&PermissiveDirectory);
        assert!(second.request.is_none());
        assert!(second.retry_in.unwrap() <= RETRY_INTERVAL);

        tokio::time::sleep(RETRY_INTERVAL).await;

        let third = queue.next_ready(&PermissiveDirectory);
        assert_eq!(GUILD, third.request.unwrap().guild_id);
    }

    #[derive(Debug)]
    struct DeadGuildDirectory;

    impl GuildDirectory for DeadGuildDirectory {
        fn guild_exists(&self, guild_id: u64) -> bool {
            guild_id != GUILD
        }

        fn channel_exists(&self, _guild_id: u64, channel_id: u64) -> bool {
            channel_id != 20
        }

        fn can_connect(&self, _guild_id: u64, channel_id: u64) -> bool {
            channel_id != 30
        }
    }

    #[tokio::test(start_paused = true)]
    async fn next_ready_drops_ineligible_requests() {
        let mut queue = VoiceQueue::new();
        queue.queue_connect(GUILD, 10);
        queue.queue_connect(2, 20);
        queue.queue_connect(3, 30);

        let result = queue.next_ready(&DeadGuildDirectory);

        assert!(result.request.is_none());
        assert!(queue.is_empty());

        let mut removed = result.removed;
        removed.sort_unstable_by_key(|(guild_id, _)| *guild_id);
        assert_eq!(
            vec![
                (GUILD, DisconnectCause::RemovedFromGuild),
                (2, DisconnectCause::ChannelDeleted),
                (3, DisconnectCause::LostPermission),
            ],
            removed,
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnects_skip_eligibility_checks() {
        let mut queue = VoiceQueue::new();
        queue.queue_disconnect(GUILD);

        let result = queue.next_ready(&DeadGuildDirectory);

        assert_eq!(ConnectionStage::Disconnect, result.request.unwrap().stage);
        assert!(result.removed.is_empty());
    }

    #[test]
    fn no_audio_connections_is_empty() {
        assert!(NoAudioConnections.guild_ids().is_empty());
        NoAudioConnections.close(GUILD, DisconnectCause::RemovedDuringReconnect);
    }
}
