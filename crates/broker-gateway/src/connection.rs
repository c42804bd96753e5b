//! Per-connection WebSocket accept/read/write loop.
//!
//! Adapted from `discord_proxy::connection::GatewayConnection`, which splits
//! a `tokio-tungstenite` stream and races read/write over `tokio::select!`.
//! That module is a *client* (`connect_async`, one upstream connection);
//! this one is the *server* side of the same library (`accept_hdr_async`,
//! many inbound connections), and additionally wakes on the subscriber's
//! per-connection [`tokio::sync::Notify`] to flush newly enqueued outbound
//! envelopes rather than only reacting to inbound frames.
//!
//! Authentication/JWT issuance is out of scope (spec §1): the connecting
//! user's identity is expected to already be established by an upstream
//! trusted layer and is carried here as a `user_id` query parameter on the
//! WebSocket upgrade request.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tracing::{debug, warn};

use broker_core::types::UserId;
use chrono::Utc;

use crate::error::{GatewayError, Result};
use crate::protocol::OutboundEnvelope;
use crate::registry::SubscriberRegistry;
use crate::router::FanoutRouter;

fn extract_user_id(request: &Request) -> Option<UserId> {
    let query = request.uri().query()?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "user_id").then(|| UserId(value.to_string()))
    })
}

/// Accept one WebSocket connection and drive it until it closes or the
/// server shuts down.
pub async fn handle_connection(
    stream: TcpStream,
    router: Arc<FanoutRouter>,
    registry: Arc<SubscriberRegistry>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let mut user_id: Option<UserId> = None;
    let callback = |request: &Request, response: Response| {
        user_id = extract_user_id(request);
        Ok(response)
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let user_id = user_id.ok_or_else(|| GatewayError::Unauthorized("missing user_id".to_string()))?;

    let (client_id, notify) = registry.add(user_id, Utc::now())?;
    debug!(?client_id, "subscriber connected");

    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                debug!(?client_id, "connection task shutting down");
                break;
            }
            () = notify.notified() => {
                if !flush_outbound(&registry, client_id, &mut write).await {
                    break;
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = router.handle_inbound(client_id, text.as_bytes()).await {
                            if send_one(&mut write, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(?client_id, "connection closed by peer");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(?client_id, error = %e, "transport error, dropping connection");
                        break;
                    }
                }
            }
        }
    }

    registry.remove(client_id);
    Ok(())
}

async fn flush_outbound(
    registry: &Arc<SubscriberRegistry>,
    client_id: broker_core::types::ClientId,
    write: &mut (impl futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
) -> bool {
    for envelope in registry.flush_queue(client_id) {
        if send_one(write, &envelope).await.is_err() {
            return false;
        }
    }
    true
}

async fn send_one(
    write: &mut (impl futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    envelope: &OutboundEnvelope,
) -> std::result::Result<(), ()> {
    let Ok(json) = serde_json::to_string(envelope) else {
        return Err(());
    };
    write.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_user_id_from_query_string() {
        let request = Request::builder()
            .uri("/ws?user_id=alice&other=1")
            .body(())
            .unwrap();
        assert_eq!(extract_user_id(&request), Some(UserId("alice".to_string())));
    }

    #[test]
    fn missing_user_id_is_none() {
        let request = Request::builder().uri("/ws").body(()).unwrap();
        assert_eq!(extract_user_id(&request), None);
    }
}
