//! Whiteboard collaboration relay
//! Accepts WebSocket connections and hands every text frame to the room relay

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use whiteboard_sync::{CollaborationServer, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "collab-server", about = "Real-time whiteboard collaboration relay")]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "COLLAB_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Largest accepted text frame, in bytes
    #[arg(long, env = "COLLAB_MAX_MESSAGE_BYTES", default_value_t = ServerConfig::default().max_message_bytes)]
    max_message_bytes: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("collab_server=debug,whiteboard_sync=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let server = Arc::new(CollaborationServer::new(ServerConfig {
        max_message_bytes: cli.max_message_bytes,
    }));
    let ws_config = socket_config(cli.max_message_bytes);

    let listener = TcpListener::bind(cli.bind).await?;
    info!("Collaboration server listening on: {}", cli.bind);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("New connection from: {}", addr);
                tokio::spawn(handle_connection(stream, addr, server.clone(), ws_config));
            }
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Socket limits matching the relay's frame limit, so oversized messages are
/// refused before they are buffered
fn socket_config(max_message_bytes: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_message_bytes);
    config.max_frame_size = Some(max_message_bytes);
    config
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    server: Arc<CollaborationServer>,
    ws_config: WebSocketConfig,
) {
    let ws_stream = match tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (connection_id, mut events) = server.connect();
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Message>();
    info!("Connection {} established from {}", connection_id, addr);

    // Writes relay events and transport-level replies to the socket
    let send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                Some(event) = events.recv() => match event.to_json() {
                    Ok(json) => Message::Text(json),
                    Err(e) => {
                        error!("Failed to serialize event: {}", e);
                        continue;
                    }
                },
                Some(msg) = control_rx.recv() => msg,
                else => break,
            };

            if let Err(e) = ws_sender.send(msg).await {
                debug!("Failed to send message: {}", e);
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!("Error receiving message from {}: {}", connection_id, e);
                break;
            }
        };

        match msg {
            Message::Text(text) => server.handle_frame(connection_id, &text),
            Message::Ping(data) => {
                let _ = control_tx.send(Message::Pong(data));
            }
            Message::Close(_) => {
                debug!("Client {} requested close", connection_id);
                break;
            }
            _ => {}
        }
    }

    server.disconnect(connection_id);
    send_task.abort();
    info!("Connection closed: {} ({})", connection_id, addr);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_limits_follow_cli() {
        let cli = Cli::parse_from(["collab-server", "--max-message-bytes", "1024"]);
        let config = socket_config(cli.max_message_bytes);

        assert_eq!(config.max_message_size, Some(1024));
        assert_eq!(config.max_frame_size, Some(1024));
    }

    #[test]
    fn test_default_socket_limit_matches_relay() {
        let config = socket_config(ServerConfig::default().max_message_bytes);
        assert_eq!(config.max_message_size, Some(4 * 1024 * 1024));
    }
}
