//! Connection establishment and recovery.

use super::{GatewayProcessor, ResumeOutcome};
use crate::{
    compression::{self, CompressionKind},
    error::{ConnectingError, ConnectingErrorType, SendError},
    event::{Connecting, Event, Identifying, Resuming},
    payload::{Identify, IdentifyInfo, IdentifyProperties, Resume},
    socket_forwarder::SocketForwarder,
    stage::Stage,
    Connection, API_VERSION,
};
use accord_gateway_queue::{ConnectNode, NodeKind};
use async_trait::async_trait;
use std::{env::consts::OS, error::Error, sync::Arc, time::Duration};
use tokio::sync::{
    mpsc::UnboundedSender,
    oneshot::{self, Sender as OneshotSender},
};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use url::Url;

/// Permission to perform one connect attempt, granted by the arbiter
/// through a [`GatewayNode`].
#[derive(Debug)]
pub(crate) struct ConnectPermit {
    done: OneshotSender<()>,
}

impl ConnectPermit {
    /// Report that authentication went out (or that the attempt died), so
    /// the node behind this permit may release the arbiter.
    pub fn complete(self) {
        let _ = self.done.send(());
    }
}

/// Sender half of the processor's connect gate, held by pending nodes.
#[derive(Clone, Debug)]
pub(crate) struct ConnectGate(pub(crate) UnboundedSender<ConnectPermit>);

/// Lifecycle token appended to the session arbiter.
///
/// Invoking it releases the processor's connect gate; when another node
/// waits behind this one, [`run`] does not return before the processor
/// reported that its authentication was transmitted, keeping the next
/// identify out of the same window.
///
/// [`run`]: ConnectNode::run
#[derive(Debug)]
pub(crate) struct GatewayNode {
    gate: ConnectGate,
    kind: NodeKind,
    shard: [u64; 2],
}

impl GatewayNode {
    pub fn new(kind: NodeKind, shard: [u64; 2], gate: ConnectGate) -> Self {
        Self { gate, kind, shard }
    }
}

#[async_trait]
impl ConnectNode for GatewayNode {
    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn shard(&self) -> [u64; 2] {
        self.shard
    }

    async fn run(&self, is_last: bool) {
        let (done, done_rx) = oneshot::channel();

        if self.gate.0.send(ConnectPermit { done }).is_err() {
            tracing::warn!("client is gone, dropping the connect slot");

            return;
        }

        if !is_last {
            let _ = done_rx.await;
        }
    }
}

/// Configuration used for websocket connections.
///
/// The frame and message size limits are disabled because the gateway is
/// not a malicious actor.
const WEBSOCKET_CONFIG: WebSocketConfig = WebSocketConfig {
    accept_unmasked_frames: false,
    max_frame_size: None,
    max_message_size: None,
    max_send_queue: None,
};

/// Build the connection URL with the protocol version, encoding and
/// compression query parameters.
pub(crate) fn build_url(base: &str, compression: CompressionKind) -> String {
    let mut url = base.to_owned();

    url.push_str("/?encoding=json&v=");
    url.push_str(&API_VERSION.to_string());

    compression::add_url_feature(&mut url, compression);

    url
}

async fn connect(url: &str) -> Result<Connection, ConnectingError> {
    let url = Url::parse(url).map_err(|source| ConnectingError {
        kind: ConnectingErrorType::ParsingUrl {
            url: url.to_owned(),
        },
        source: Some(Box::new(source)),
    })?;

    let (stream, _) =
        tokio_tungstenite::connect_async_with_config(url.as_str(), Some(WEBSOCKET_CONFIG))
            .await
        .map_err(|source| ConnectingError {
            kind: ConnectingErrorType::Establishing,
            source: Some(Box::new(source)),
        })?;

    tracing::debug!("shook hands with remote");

    Ok(stream)
}

/// Default identify properties to use when the user has not customized them
/// via [`ConfigBuilder::identify_properties`].
///
/// [`ConfigBuilder::identify_properties`]: crate::config::ConfigBuilder::identify_properties
fn default_identify_properties() -> IdentifyProperties {
    IdentifyProperties::new("accord", "accord", OS)
}

impl GatewayProcessor {
    /// Open a websocket and swap it in as the current connection.
    pub(super) async fn establish(&mut self) -> Result<(), ConnectingError> {
        self.emitter.event(Event::Connecting(Connecting {
            gateway: self.url.clone(),
            shard: self.config.shard_info(),
        }));

        let stream = connect(&self.url).await?;

        let (forwarder, rx, tx) = SocketForwarder::new(stream);
        tokio::spawn(forwarder.run());

        self.rx = Some(rx);
        self.session.set_tx(tx);
        self.server_close = None;
        self.decompressor.reset();

        Ok(())
    }

    /// Establish a connection and authenticate it, identifying unless a
    /// resumable session is present.
    pub(super) async fn connect_and_identify(
        &mut self,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.session.set_stage(Stage::Connecting);
        self.establish().await?;

        if let Some(session_id) = self.session.id() {
            self.send_resume(&session_id).await?;
        } else {
            self.send_identify().await?;
        }

        Ok(())
    }

    pub(super) async fn send_identify(&mut self) -> Result<(), SendError> {
        self.session.set_stage(Stage::Identifying);
        self.emitter.event(Event::Identifying(Identifying {
            shard: self.config.shard_info(),
        }));

        let properties = self
            .config
            .identify_properties()
            .cloned()
            .unwrap_or_else(default_identify_properties);

        let identify = Identify::new(IdentifyInfo {
            token: self.config.token().to_owned(),
            properties,
            version: API_VERSION,
            large_threshold: self.config.large_threshold(),
            presence: self.config.presence().cloned(),
            shard: self
                .config
                .shard()
                .map(|shard| [shard.current(), shard.total()]),
        });

        self.session.send_priority(&identify).await?;
        self.session.record_identify();
        self.session.set_auth_sent(true);
        self.session.set_stage(Stage::AwaitingLoginConfirmation);

        Ok(())
    }

    pub(super) async fn send_resume(&mut self, session_id: &str) -> Result<(), SendError> {
        let sequence = self.session.seq();

        tracing::debug!(sequence, session_id, "resuming session");
        self.emitter
            .event(Event::Resuming(Resuming { sequence }));

        let resume = Resume::new(sequence, session_id, self.config.token());

        self.session.send_priority(&resume).await?;
        self.session.set_auth_sent(true);
        self.session.set_stage(Stage::AwaitingLoginConfirmation);

        Ok(())
    }

    /// Re-establish the connection to resume the session, backing off
    /// exponentially between attempts.
    pub(super) async fn resume_loop(&mut self) -> ResumeOutcome {
        let mut wait = Duration::from_secs(2);

        loop {
            self.session.set_stage(Stage::WaitingToReconnect);

            tracing::debug!(
                wait_in_seconds = wait.as_secs(),
                "waiting before attempting to resume",
            );

            if self.session.sleep_or_shutdown(wait).await {
                return ResumeOutcome::Shutdown;
            }

            let Some(session_id) = self.session.id() else {
                return ResumeOutcome::SessionLost;
            };

            self.session.set_stage(Stage::AttemptingToReconnect);

            if let Err(source) = self.establish().await {
                tracing::warn!("resume connect failed: {source}");
                wait = (wait * 2).min(self.config.max_reconnect_delay());

                continue;
            }

            if let Err(source) = self.send_resume(&session_id).await {
                tracing::warn!("sending resume failed: {source}");
                wait = (wait * 2).min(self.config.max_reconnect_delay());

                continue;
            }

            return ResumeOutcome::Resumed;
        }
    }

    /// Append a re-identify node to the arbiter, retaining it so shutdown
    /// can withdraw it.
    pub(super) fn enqueue_reconnect(&mut self) -> bool {
        let node: Arc<dyn ConnectNode> = Arc::new(GatewayNode::new(
            NodeKind::Reconnect,
            self.config.shard_info(),
            self.gate.clone(),
        ));

        self.node
            .lock()
            .expect("node poisoned")
            .replace(Arc::clone(&node));

        self.config.arbiter().append(node)
    }
}

#[cfg(test)]
mod tests {
    use super::build_url;
    use crate::compression::CompressionKind;

    #[test]
    fn url_carries_version_and_encoding() {
        assert_eq!(
            "wss://gateway.example/?encoding=json&v=6",
            build_url("wss://gateway.example", CompressionKind::None),
        );
        assert_eq!(
            "wss://gateway.example/?encoding=json&v=6&compress=zlib-stream",
            build_url("wss://gateway.example", CompressionKind::ZlibStream),
        );
    }
}
