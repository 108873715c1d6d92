use crate::Connection;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::tungstenite::Message;

/// Task owning the websocket, forwarding frames both ways.
///
/// Having a single owner of the stream means there is never more than one
/// write in flight; every sender in the crate is a channel into this task.
pub struct SocketForwarder {
    rx: UnboundedReceiver<Message>,
    pub stream: Connection,
    tx: UnboundedSender<Message>,
}

impl SocketForwarder {
    const TIMEOUT: Duration = Duration::from_secs(90);

    pub fn new(
        stream: Connection,
    ) -> (Self, UnboundedReceiver<Message>, UnboundedSender<Message>) {
        let (to_user, from_forwarder) = mpsc::unbounded_channel();
        let (to_forwarder, from_user) = mpsc::unbounded_channel();

        (
            Self {
                rx: from_user,
                stream,
                tx: to_user,
            },
            from_forwarder,
            to_forwarder,
        )
    }

    pub async fn run(mut self) {
        tracing::debug!("starting driving loop");

        loop {
            tokio::select! {
                maybe_msg = self.rx.recv() => {
                    if let Some(msg) = maybe_msg {
                        tracing::trace!("sending message: {msg}");

                        if let Err(source) = self.stream.send(msg).await {
                            tracing::warn!("sending failed: {source}");
                            break;
                        }
                    } else {
                        tracing::debug!("rx stream ended, closing socket");
                        let _res = self.stream.close(None).await;

                        break;
                    }
                },
                try_msg = self.stream.next() => {
                    match try_msg {
                        Some(Ok(msg)) => {
                            if self.tx.send(msg).is_err() {
                                break;
                            }
                        },
                        Some(Err(source)) => {
                            tracing::warn!("socket errored: {source}");
                            break;
                        },
                        None => {
                            tracing::debug!("socket ended");
                            break;
                        }
                    }
                },
                _ = tokio::time::sleep(Self::TIMEOUT) => {
                    tracing::warn!("socket timed out");
                    break;
                }
            }
        }

        tracing::debug!("leaving loop");
    }
}
