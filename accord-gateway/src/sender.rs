//! Outbound queues and the single-writer drain task.
//!
//! Everything the application sends funnels into three FIFO queues drained
//! by one task in strict priority order: member chunk/sync requests first,
//! then audio connection requests, then general messages. Lifecycle
//! payloads (heartbeat, IDENTIFY, RESUME, close) bypass the queues and go
//! through [`Session::send_priority`] instead, drawing from the same rate
//! bucket and writing through the same socket writer.

use crate::{
    payload::VoiceStateUpdate,
    session::Session,
    voice::{AudioConnections, ConnectionStage, DisconnectCause, GuildDirectory, VoiceQueue, VoiceRequest},
};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::Notify;

#[derive(Debug)]
enum OutboundItem {
    Voice(VoiceRequest),
    Text(String),
}

#[derive(Debug, Default)]
struct QueueInner {
    chunk: VecDeque<String>,
    general: VecDeque<String>,
    voice: VoiceQueue,
}

/// The three outbound queues, guarded by a single lock.
///
/// The voice table lives under the same lock as the message queues so a
/// coalescing mutation can never interleave with the sender's pick.
#[derive(Debug, Default)]
pub struct OutboundQueues {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl OutboundQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a member chunk or sync request, sent before general messages.
    pub fn queue_chunk(&self, message: String) {
        self.inner
            .lock()
            .expect("queues poisoned")
            .chunk
            .push_back(message);
        self.notify.notify_one();
    }

    /// Queue a general message.
    pub fn queue_message(&self, message: String) {
        self.inner
            .lock()
            .expect("queues poisoned")
            .general
            .push_back(message);
        self.notify.notify_one();
    }

    /// Queue an audio connect for a guild.
    pub fn queue_voice_connect(&self, guild_id: u64, channel_id: u64) {
        self.inner
            .lock()
            .expect("queues poisoned")
            .voice
            .queue_connect(guild_id, channel_id);
        self.notify.notify_one();
    }

    /// Queue an audio reconnect for a guild.
    pub fn queue_voice_reconnect(&self, guild_id: u64, channel_id: u64) {
        self.inner
            .lock()
            .expect("queues poisoned")
            .voice
            .queue_reconnect(guild_id, channel_id);
        self.notify.notify_one();
    }

    /// Queue an audio disconnect for a guild.
    pub fn queue_voice_disconnect(&self, guild_id: u64) {
        self.inner
            .lock()
            .expect("queues poisoned")
            .voice
            .queue_disconnect(guild_id);
        self.notify.notify_one();
    }

    /// Remove and return the queued audio request of a guild.
    pub fn remove_voice(&self, guild_id: u64) -> Option<VoiceRequest> {
        self.inner
            .lock()
            .expect("queues poisoned")
            .voice
            .remove(guild_id)
    }

    /// Ingest the server's voice state confirmation for a guild.
    pub fn voice_update(&self, guild_id: u64, connected_channel: Option<u64>) -> Option<VoiceRequest> {
        let satisfied = self
            .inner
            .lock()
            .expect("queues poisoned")
            .voice
            .update(guild_id, connected_channel);

        // a reconnect may have flipped to an immediately-due connect
        self.notify.notify_one();

        satisfied
    }

    /// Drop all queued chunk/sync requests.
    pub fn clear_chunk(&self) {
        self.inner.lock().expect("queues poisoned").chunk.clear();
    }

    pub(crate) fn notify(&self) {
        self.notify.notify_one();
    }

    fn next(
        &self,
        directory: &dyn GuildDirectory,
    ) -> (Option<OutboundItem>, Vec<(u64, DisconnectCause)>, Option<Duration>) {
        let mut inner = self.inner.lock().expect("queues poisoned");

        if let Some(text) = inner.chunk.pop_front() {
            return (Some(OutboundItem::Text(text)), Vec::new(), None);
        }

        let ready = inner.voice.next_ready(directory);

        if let Some(request) = ready.request {
            return (Some(OutboundItem::Voice(request)), ready.removed, ready.retry_in);
        }

        (
            inner.general.pop_front().map(OutboundItem::Text),
            ready.removed,
            ready.retry_in,
        )
    }
}

/// Single-writer task draining the outbound queues under the rate bucket.
pub(crate) struct SenderTask {
    pub audio: Arc<dyn AudioConnections>,
    pub directory: Arc<dyn GuildDirectory>,
    pub queues: Arc<OutboundQueues>,
    pub session: Arc<Session>,
}

impl SenderTask {
    pub async fn run(self) {
        loop {
            // hold sends until the gateway acknowledged authentication
            let stage = self
                .session
                .wait_for_stage(|stage| stage.is_authenticated() || stage.is_shutdown())
                .await;

            if stage.is_shutdown() || self.session.is_shutdown() {
                break;
            }

            let (item, removed, retry_in) = self.queues.next(&*self.directory);

            for (guild_id, cause) in removed {
                tracing::debug!(guild_id, ?cause, "dropping dead audio request");
                self.audio.close(guild_id, cause);
            }

            let Some(item) = item else {
                self.park(retry_in).await;

                continue;
            };

            let text = match item {
                OutboundItem::Voice(request) => {
                    let channel_id = (request.stage != ConnectionStage::Disconnect)
                        .then_some(request.channel_id)
                        .flatten();
                    let update = VoiceStateUpdate::new(request.guild_id, channel_id);

                    match serde_json::to_string(&update) {
                        Ok(json) => json,
                        Err(source) => {
                            tracing::error!("voice request failed to serialize: {source}");

                            continue;
                        }
                    }
                }
                OutboundItem::Text(text) => text,
            };

            while !self.session.ratelimit.acquire(false) {
                let wait = self.session.ratelimit.time_until_reset();

                if self.session.sleep_or_shutdown(wait).await {
                    return;
                }
            }

            if let Err(source) = self.session.send_text(text) {
                // the connection is being replaced; the stage wait above
                // parks us until it is usable again
                tracing::warn!("queued message wasn't sent: {source}");
            }
        }

        tracing::debug!("sender task stopping");
    }

    /// Park until new work arrives, the stage regresses, or the earliest
    /// deferred voice attempt comes due.
    async fn park(&self, retry_in: Option<Duration>) {
        let stage_changed = self
            .session
            .wait_for_stage(|stage| !stage.is_authenticated());

        match retry_in {
            Some(wait) => {
                tokio::select! {
                    _ = self.queues.notify.notified() => {}
                    _ = stage_changed => {}
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            None => {
                tokio::select! {
                    _ = self.queues.notify.notified() => {}
                    _ = stage_changed => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{OutboundQueues, SenderTask};
    use crate::{
        session::Session,
        stage::Stage,
        voice::{NoAudioConnections, PermissiveDirectory},
    };
    use static_assertions::assert_impl_all;
    use std::{fmt::Debug, sync::Arc, time::Duration};
    use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver};
    use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

    assert_impl_all!(OutboundQueues: Debug, Default, Send, Sync);

    fn spawn_sender(
        session: &Arc<Session>,
        queues: &Arc<OutboundQueues>,
    ) -> UnboundedReceiver<TungsteniteMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        session.set_tx(tx);
        session.set_stage(Stage::Connected);

        let sender = SenderTask {
            audio: Arc::new(NoAudioConnections),
            directory: Arc::new(PermissiveDirectory),
            queues: Arc::clone(queues),
            session: Arc::clone(session),
        };
        tokio::spawn(sender.run());

        rx
    }

    fn text(message: TungsteniteMessage) -> String {
        match message {
            TungsteniteMessage::Text(text) => text,
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn strict_priority_between_queues() {
        let session = Arc::new(Session::new());
        let queues = Arc::new(OutboundQueues::new());

        queues.queue_message(r#"{"op":3}"#.to_owned());
        queues.queue_chunk(r#"{"op":8}"#.to_owned());
        queues.queue_voice_connect(1, 10);

        let mut rx = spawn_sender(&session, &queues);

        let first = text(rx.recv().await.unwrap());
        assert_eq!(r#"{"op":8}"#, first);

        let second = text(rx.recv().await.unwrap());
        assert!(second.contains(r#""op":4"#), "voice second, got {second}");

        let third = text(rx.recv().await.unwrap());
        assert_eq!(r#"{"op":3}"#, third);
    }

    #[tokio::test(start_paused = true)]
    async fn fifo_within_a_queue() {
        let session = Arc::new(Session::new());
        let queues = Arc::new(OutboundQueues::new());

        for n in 0..5 {
            queues.queue_message(format!(r#"{{"n":{n}}}"#));
        }

        let mut rx = spawn_sender(&session, &queues);

        for n in 0..5 {
            assert_eq!(format!(r#"{{"n":{n}}}"#), text(rx.recv().await.unwrap()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_window_sends_remainder_after_rollover() {
        let session = Arc::new(Session::new());
        let queues = Arc::new(OutboundQueues::new());

        for n in 0..130 {
            queues.queue_message(format!(r#"{{"n":{n}}}"#));
        }

        let mut rx = spawn_sender(&session, &queues);

        for n in 0..115 {
            assert_eq!(format!(r#"{{"n":{n}}}"#), text(rx.recv().await.unwrap()));
        }

        // the clock has not advanced, so the window is still closed
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        tokio::time::sleep(Duration::from_secs(61)).await;

        for n in 115..130 {
            assert_eq!(format!(r#"{{"n":{n}}}"#), text(rx.recv().await.unwrap()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unauthenticated_stage_holds_sends() {
        let session = Arc::new(Session::new());
        let queues = Arc::new(OutboundQueues::new());

        queues.queue_message(r#"{"op":3}"#.to_owned());

        let (tx, mut rx) = mpsc::unbounded_channel();
        session.set_tx(tx);
        session.set_stage(Stage::AwaitingLoginConfirmation);

        let sender = SenderTask {
            audio: Arc::new(NoAudioConnections),
            directory: Arc::new(PermissiveDirectory),
            queues: Arc::clone(&queues),
            session: Arc::clone(&session),
        };
        tokio::spawn(sender.run());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        session.set_stage(Stage::Connected);

        assert_eq!(r#"{"op":3}"#, text(rx.recv().await.unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn voice_disconnect_serializes_null_channel() {
        let session = Arc::new(Session::new());
        let queues = Arc::new(OutboundQueues::new());

        queues.queue_voice_disconnect(7);

        let mut rx = spawn_sender(&session, &queues);

        let sent = text(rx.recv().await.unwrap());
        assert!(sent.contains(r#""channel_id":null"#), "{sent}");
        assert!(sent.contains(r#""guild_id":7"#), "{sent}");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_sender() {
        let session = Arc::new(Session::new());
        let queues = Arc::new(OutboundQueues::new());

        let (tx, _rx) = mpsc::unbounded_channel();
        session.set_tx(tx);
        session.set_stage(Stage::Connected);

        let sender = SenderTask {
            audio: Arc::new(NoAudioConnections),
            directory: Arc::new(PermissiveDirectory),
            queues: Arc::clone(&queues),
            session: Arc::clone(&session),
        };
        let handle = tokio::spawn(sender.run());

        session.request_shutdown();
        session.set_stage(Stage::Shutdown);

        handle.await.unwrap();
    }
}
