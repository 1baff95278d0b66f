//! WebSocket relay between preview clients and dev servers.
//!
//! HMR rides on this: the browser's websocket terminates here and a second
//! connection is dialed to the dev server on loopback, with frames piped
//! both ways until either side closes.

use anyhow::{Context, Result};
use axum::extract::ws::{Message as ClientMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use log::debug;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;

/// Client frame → upstream frame.
fn to_upstream(msg: ClientMessage) -> UpstreamMessage {
    match msg {
        ClientMessage::Text(text) => UpstreamMessage::Text(text.to_string().into()),
        ClientMessage::Binary(data) => UpstreamMessage::Binary(data),
        ClientMessage::Ping(data) => UpstreamMessage::Ping(data),
        ClientMessage::Pong(data) => UpstreamMessage::Pong(data),
        ClientMessage::Close(_) => UpstreamMessage::Close(None),
    }
}

/// Upstream frame → client frame. Raw frames are an artifact of the wire
/// codec and are not relayed.
fn from_upstream(msg: UpstreamMessage) -> Option<ClientMessage> {
    match msg {
        UpstreamMessage::Text(text) => Some(ClientMessage::Text(text.to_string().into())),
        UpstreamMessage::Binary(data) => Some(ClientMessage::Binary(data)),
        UpstreamMessage::Ping(data) => Some(ClientMessage::Ping(data)),
        UpstreamMessage::Pong(data) => Some(ClientMessage::Pong(data)),
        UpstreamMessage::Close(_) => Some(ClientMessage::Close(None)),
        UpstreamMessage::Frame(_) => None,
    }
}

/// Pipe a client websocket to `ws://127.0.0.1:{port}/{path}`.
pub async fn relay_websocket(
    client_socket: WebSocket,
    port: u16,
    path: &str,
    query: Option<&str>,
    session_id: &str,
) -> Result<()> {
    let mut target = format!("ws://127.0.0.1:{}/{}", port, path);
    if let Some(query) = query {
        target.push('?');
        target.push_str(query);
    }

    debug!(
        "Proxying WebSocket for session {} -> port {}/{}",
        session_id, port, path
    );

    let (server_socket, _) = connect_async(&target)
        .await
        .with_context(|| format!("dialing upstream websocket {}", target))?;

    let (mut client_tx, mut client_rx) = client_socket.split();
    let (mut server_tx, mut server_rx) = server_socket.split();

    let client_to_server = async {
        while let Some(msg) = client_rx.next().await {
            server_tx.send(to_upstream(msg?)).await?;
        }
        Ok::<(), anyhow::Error>(())
    };

    let server_to_client = async {
        while let Some(msg) = server_rx.next().await {
            if let Some(forward) = from_upstream(msg?) {
                client_tx.send(forward).await?;
            }
        }
        Ok::<(), anyhow::Error>(())
    };

    tokio::select! {
        result = client_to_server => result?,
        result = server_to_client => result?,
    }

    Ok(())
}
