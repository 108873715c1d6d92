//! Periodic heartbeating and latency tracking.

use crate::{
    error::{SendError, SendErrorType},
    payload::Heartbeat,
    ratelimiter::CommandRatelimiter,
};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use tokio::sync::mpsc::UnboundedSender;
use tokio_tungstenite::tungstenite::{
    protocol::{frame::coding::CloseCode, CloseFrame},
    Message as TungsteniteMessage,
};

/// Information about the latency of the gateway connection.
///
/// Obtained through [`GatewayClient::latency`].
///
/// [`GatewayClient::latency`]: crate::GatewayClient::latency
#[derive(Clone, Debug)]
pub struct Latency {
    average: Option<Duration>,
    heartbeats: u32,
    recent: VecDeque<Duration>,
    received: Option<Instant>,
    sent: Option<Instant>,
}

impl Latency {
    /// The average time it took to receive an acknowledgement for every
    /// heartbeat sent over the duration of the session.
    ///
    /// # Note
    ///
    /// If this is `None`, no heartbeat has been acknowledged yet.
    pub fn average(&self) -> Option<Duration> {
        self.average
    }

    /// The total number of heartbeats that have been acknowledged during
    /// this session.
    pub fn heartbeats(&self) -> u32 {
        self.heartbeats
    }

    /// The 5 most recent round-trip times.
    ///
    /// Index 0 is the oldest, 4 is the most recent.
    pub fn recent(&self) -> &VecDeque<Duration> {
        &self.recent
    }

    /// When the last heartbeat acknowledgement was received.
    pub fn received(&self) -> Option<Instant> {
        self.received
    }

    /// When the last heartbeat was sent.
    pub fn sent(&self) -> Option<Instant> {
        self.sent
    }
}

/// Round-trip bookkeeping shared between the heartbeater and the session.
#[derive(Debug, Default)]
pub struct Heartbeats {
    received: Mutex<Option<Instant>>,
    recent: Mutex<VecDeque<u64>>,
    sent: Mutex<Option<Instant>>,
    total_iterations: AtomicU32,
    total_time: AtomicU64,
}

impl Heartbeats {
    /// Snapshot of the current latency statistics.
    pub fn latency(&self) -> Latency {
        let iterations = self.total_iterations.load(Ordering::Relaxed);
        let recent = self
            .recent
            .lock()
            .expect("recent poisoned")
            .iter()
            .map(|millis| Duration::from_millis(*millis))
            .collect();

        Latency {
            average: Duration::from_millis(self.total_time.load(Ordering::Relaxed))
                .checked_div(iterations),
            heartbeats: iterations,
            recent,
            received: *self.received.lock().expect("received poisoned"),
            sent: *self.sent.lock().expect("sent poisoned"),
        }
    }

    /// Whether the last sent heartbeat has been acknowledged.
    pub fn last_acked(&self) -> bool {
        self.received.lock().expect("received poisoned").is_some()
    }

    /// Track an acknowledgement, publishing the round-trip time.
    pub fn receive(&self) {
        let now = Instant::now();
        self.received
            .lock()
            .expect("received poisoned")
            .replace(now);

        self.total_iterations.fetch_add(1, Ordering::SeqCst);

        if let Some(duration) = self
            .sent
            .lock()
            .expect("sent poisoned")
            .map(|sent| sent.elapsed())
        {
            let Ok(millis) = u64::try_from(duration.as_millis()) else {
                tracing::error!(?duration, "duration millis is more than u64");

                return;
            };

            self.total_time.fetch_add(millis, Ordering::SeqCst);

            let mut recent = self.recent.lock().expect("recent poisoned");

            if recent.len() == 5 {
                recent.pop_front();
            }

            recent.push_back(millis);
        }
    }

    /// Track that a heartbeat was sent.
    pub fn send(&self) {
        self.received.lock().expect("received poisoned").take();
        self.sent
            .lock()
            .expect("sent poisoned")
            .replace(Instant::now());
    }
}

/// Task firing heartbeats on the HELLO-supplied interval.
///
/// Aborted on every disconnect and recreated on every HELLO, so it only
/// ever speaks to a single connection's writer.
pub(crate) struct Heartbeater {
    heartbeats: Arc<Heartbeats>,
    interval: u64,
    ratelimit: Arc<CommandRatelimiter>,
    seq: Arc<AtomicU64>,
    tx: UnboundedSender<TungsteniteMessage>,
}

impl Heartbeater {
    pub fn new(
        heartbeats: Arc<Heartbeats>,
        interval: u64,
        ratelimit: Arc<CommandRatelimiter>,
        seq: Arc<AtomicU64>,
        tx: UnboundedSender<TungsteniteMessage>,
    ) -> Self {
        Self {
            heartbeats,
            interval,
            ratelimit,
            seq,
            tx,
        }
    }

    pub async fn run(self) {
        if let Err(why) = self.run_inner().await {
            tracing::warn!("error sending heartbeat: {why:?}");
        }
    }

    // If there's an issue sending over the channel, odds are the session
    // ended and this task is about to be aborted anyway.
    async fn run_inner(self) -> Result<(), SendError> {
        let duration = Duration::from_millis(self.interval);

        let mut last = true;

        loop {
            while !self.ratelimit.acquire(true) {
                tokio::time::sleep(self.ratelimit.time_until_reset()).await;
            }

            let seq = self.seq.load(Ordering::Acquire);
            let json =
                serde_json::to_string(&Heartbeat::new(seq)).map_err(|source| SendError {
                    kind: SendErrorType::Serializing,
                    source: Some(Box::new(source)),
                })?;

            tracing::debug!(seq, "sending heartbeat");
            self.tx
                .send(TungsteniteMessage::Text(json))
                .map_err(|source| SendError {
                    kind: SendErrorType::Sending,
                    source: Some(Box::new(source)),
                })?;
            self.heartbeats.send();

            tokio::time::sleep(duration).await;

            // Check if a heartbeat acknowledgement was received.
            //
            // If so, then check if one was received last time.
            //
            // - if so, then mark that we didn't get one this time
            // - if not, then the connection is gone; close so the resume
            // path takes over
            if self.heartbeats.last_acked() {
                last = true;
            } else if last {
                last = false;
            } else {
                tracing::warn!("two heartbeat periods elapsed without an ack, closing");

                let frame = CloseFrame {
                    code: CloseCode::from(4000),
                    reason: "".into(),
                };
                self.tx
                    .send(TungsteniteMessage::Close(Some(frame)))
                    .map_err(|source| SendError {
                        kind: SendErrorType::Sending,
                        source: Some(Box::new(source)),
                    })?;

                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Heartbeater, Heartbeats};
    use crate::ratelimiter::CommandRatelimiter;
    use static_assertions::assert_impl_all;
    use std::{
        fmt::Debug,
        sync::{atomic::AtomicU64, Arc},
        time::Duration,
    };
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

    assert_impl_all!(Heartbeats: Debug, Default, Send, Sync);
    assert_impl_all!(super::Latency: Clone, Debug, Send, Sync);

    #[test]
    fn rtt_is_published() {
        let heartbeats = Heartbeats::default();
        assert!(!heartbeats.last_acked());

        heartbeats.send();
        assert!(!heartbeats.last_acked());

        heartbeats.receive();
        assert!(heartbeats.last_acked());

        let latency = heartbeats.latency();
        assert_eq!(1, latency.heartbeats());
        assert!(latency.average().is_some());
        assert!(latency.sent().is_some());
        assert!(latency.received().is_some());
    }

    #[test]
    fn recent_is_capped() {
        let heartbeats = Heartbeats::default();

        for _ in 0..7 {
            heartbeats.send();
            heartbeats.receive();
        }

        assert_eq!(5, heartbeats.latency().recent().len());
        assert_eq!(7, heartbeats.latency().heartbeats());
    }

    #[tokio::test(start_paused = true)]
    async fn beats_on_interval_and_closes_without_acks() {
        let heartbeats = Arc::new(Heartbeats::default());
        let ratelimit = Arc::new(CommandRatelimiter::new());
        let seq = Arc::new(AtomicU64::new(42));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let heartbeater = Heartbeater::new(
            Arc::clone(&heartbeats),
            100,
            ratelimit,
            seq,
            tx,
        );
        tokio::spawn(heartbeater.run());

        // first beat is immediate
        tokio::time::sleep(Duration::from_millis(10)).await;
        match rx.recv().await.unwrap() {
            TungsteniteMessage::Text(json) => assert_eq!(r#"{"d":42,"op":1}"#, json),
            other => panic!("expected heartbeat, got {other:?}"),
        }

        // one missed ack is tolerated, the second closes the connection
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            TungsteniteMessage::Text(_)
        ));

        tokio::time::sleep(Duration::from_millis(150)).await;
        match rx.recv().await.unwrap() {
            TungsteniteMessage::Close(Some(frame)) => {
                assert_eq!(4000, u16::from(frame.code));
            }
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn acked_heartbeats_keep_beating() {
        let heartbeats = Arc::new(Heartbeats::default());
        let ratelimit = Arc::new(CommandRatelimiter::new());
        let seq = Arc::new(AtomicU64::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let heartbeater = Heartbeater::new(
            Arc::clone(&heartbeats),
            100,
            ratelimit,
            seq,
            tx,
        );
        tokio::spawn(heartbeater.run());

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(110)).await;
            assert!(matches!(
                rx.recv().await.unwrap(),
                TungsteniteMessage::Text(_)
            ));
            heartbeats.receive();
        }
    }
}
