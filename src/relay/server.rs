//! Websocket front end for relay sessions

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

use super::session::RelaySession;
use crate::config::RelaySettings;
use crate::listen;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::transport::{Connector, SshConnector};

/// Client events queued ahead of the session loop
const INBOUND_BUFFER: usize = 256;

/// Shared state for the relay server
#[derive(Clone)]
pub struct AppState {
    pub connector: Arc<dyn Connector>,
    pub settings: Arc<RelaySettings>,
}

impl AppState {
    pub fn new(connector: Arc<dyn Connector>, settings: RelaySettings) -> Self {
        Self {
            connector,
            settings: Arc::new(settings),
        }
    }
}

/// Builds the relay router: `/ws` plus the optional static client directory.
pub fn router(state: AppState) -> Router {
    let client_dir = state.settings.client_dir.clone();

    let mut app = Router::new().route("/ws", get(websocket_handler));
    if let Some(dir) = client_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the relay until ctrl-c
pub async fn run_relay_server(settings: RelaySettings) -> Result<()> {
    let connector: Arc<dyn Connector> = Arc::new(SshConnector::new(settings.keepalive()));
    let listener = listen::bind_with_fallback(settings.bind, settings.port)
        .await
        .with_context(|| format!("Failed to bind relay on {}:{}", settings.bind, settings.port))?;
    let addr = listener.local_addr()?;

    let app = router(AppState::new(connector, settings));

    tracing::info!(%addr, "Relay server listening");
    println!("Relay listening on ws://{}/ws", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(listen::shutdown_signal())
        .await
        .context("Relay server failed")?;

    tracing::info!("Relay server stopped");
    Ok(())
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Bridges one websocket to one [`RelaySession`].
///
/// The session runs on this task; socket reads and writes run beside it and
/// talk to it over channels.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let (inbound_tx, inbound_rx) = mpsc::channel::<ClientEvent>(INBOUND_BUFFER);

    let session = RelaySession::new(state.connector.clone(), state.settings.clone(), events_tx);
    let session_id = session.id().to_string();
    tracing::info!(session_id = %session_id, "Client connected");

    let send_task = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(event = event.name(), error = %e, "Failed to encode event");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let recv_session_id = session_id.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            let event = match msg {
                Message::Text(text) => serde_json::from_str::<ClientEvent>(text.as_str()),
                Message::Binary(bytes) => serde_json::from_slice::<ClientEvent>(&bytes),
                Message::Close(_) => break,
                _ => continue,
            };
            match event {
                Ok(event) => {
                    if inbound_tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(session_id = %recv_session_id, error = %e, "Ignoring malformed client frame");
                }
            }
        }
    });

    // ends once the socket closes (dropping inbound_tx) or the client says goodbye
    session.run(inbound_rx).await;

    recv_task.abort();
    let _ = send_task.await;
    tracing::info!(session_id = %session_id, "Client connection closed");
}
