//! Session orchestration for the Ripple server.
//!
//! Each WebSocket connection walks a small state machine: Connected
//! (registered, zero subscriptions), any number of concurrent
//! Subscribed(channel) states, then Disconnected (terminal). There is no
//! resume: a new transport connection always gets a fresh connection id
//! and must re-issue joins.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use ripple_core::{
    ConnectionId, ConnectionRegistry, Identity, MembershipResolver, MemoryStore, OpenMembership,
    Outbound, PresenceNotifier, RoomRouter, RouterConfig, StaticMembership,
};
use ripple_protocol::{codec, ClientEvent, ServerEvent};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Wire error code for malformed or unknown inbound events.
const CODE_MALFORMED: u16 = 1400;

/// Shared server state.
pub struct AppState {
    /// The room router.
    pub router: Arc<RoomRouter>,
    /// Typing relay over the router.
    pub notifier: PresenceNotifier,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state, wiring the router to the configured
    /// membership roster and an in-memory message log.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let membership: Arc<dyn MembershipResolver> = if config.membership.open {
            Arc::new(OpenMembership)
        } else {
            let roster = StaticMembership::new();
            for channel in &config.membership.channels {
                roster.insert_channel(&channel.id, channel.members.iter().cloned());
            }
            Arc::new(roster)
        };

        let router_config = RouterConfig {
            history_limit: config.limits.history_limit,
            max_subscriptions_per_connection: config.limits.max_subscriptions_per_connection,
            channel_capacity: config.limits.channel_capacity,
        };

        let router = Arc::new(RoomRouter::with_config(
            Arc::new(ConnectionRegistry::new()),
            membership,
            Arc::new(MemoryStore::with_retention(config.limits.message_retention)),
            router_config,
        ));

        Self {
            notifier: PresenceNotifier::new(Arc::clone(&router)),
            router,
            config,
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = Router::new()
        .route(&config.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Ripple server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, config.websocket_path);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection from accept to teardown.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = ConnectionId::generate();
    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // One forward task per subscription drains that channel's broadcast
    // receiver into this mpsc, filtering events not meant for us.
    let (sub_tx, mut sub_rx) = mpsc::unbounded_channel::<Arc<ServerEvent>>();
    let mut subscription_tasks: HashMap<String, tokio::task::JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            biased;

            Some(event) = sub_rx.recv() => {
                match codec::encode(event.as_ref()) {
                    Ok(text) => {
                        metrics::record_message("outbound");
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(connection = %connection_id, error = %e, "Encode failure");
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        metrics::record_message("inbound");
                        match codec::decode_client(&text) {
                            Ok(event) => {
                                if let Err(e) = handle_event(
                                    event,
                                    &connection_id,
                                    &state,
                                    &mut sender,
                                    &mut subscription_tasks,
                                    &sub_tx,
                                ).await {
                                    error!(connection = %connection_id, error = %e, "Event handling error");
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(connection = %connection_id, error = %e, "Rejected inbound event");
                                metrics::record_error("decode");
                                let reply = ServerEvent::error(CODE_MALFORMED, e.to_string());
                                if send_event(&mut sender, &reply).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Binary(_))) => {
                        warn!(connection = %connection_id, "Ignoring binary frame");
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    for (_, handle) in subscription_tasks {
        handle.abort();
    }

    // Unregister and cascade: every channel the connection was in gets
    // one user-disconnected broadcast.
    state.router.disconnect(&connection_id);
    metrics::set_active_channels(state.router.stats().channel_count);

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Handle a decoded client event.
async fn handle_event(
    event: ClientEvent,
    connection_id: &ConnectionId,
    state: &Arc<AppState>,
    sender: &mut SplitSink<WebSocket, Message>,
    subscription_tasks: &mut HashMap<String, tokio::task::JoinHandle<()>>,
    sub_tx: &mpsc::UnboundedSender<Arc<ServerEvent>>,
) -> Result<()> {
    match event {
        ClientEvent::UserConnect {
            user_id,
            username,
            avatar_url,
        } => {
            let mut identity = Identity::new(user_id, username);
            if let Some(url) = avatar_url {
                identity = identity.with_avatar(url);
            }
            state.router.registry().register(connection_id.clone(), identity);
        }

        ClientEvent::JoinChannel {
            channel_id,
            user_id,
            username,
            limit,
        } => {
            debug!(connection = %connection_id, channel = %channel_id, "Join request");

            // Clients may join without a prior user-connect; the join
            // event carries the identity in that case.
            if !state.router.registry().contains(connection_id) {
                state
                    .router
                    .registry()
                    .register(connection_id.clone(), Identity::new(user_id, username));
            }

            match state.router.subscribe(&channel_id, connection_id, limit).await {
                Ok(subscription) => {
                    // Replace any previous forward task for this channel so
                    // a double join never duplicates delivery.
                    if let Some(old) = subscription_tasks.remove(&channel_id) {
                        old.abort();
                    }
                    let handle = spawn_forward_task(
                        subscription.receiver,
                        connection_id.clone(),
                        sub_tx.clone(),
                    );
                    subscription_tasks.insert(channel_id.clone(), handle);

                    metrics::record_subscription();
                    metrics::record_history_replay();
                    metrics::set_active_channels(state.router.stats().channel_count);

                    // History goes to the joining connection alone.
                    send_event(sender, &ServerEvent::history(subscription.history)).await?;
                }
                Err(e) => {
                    warn!(connection = %connection_id, channel = %channel_id, error = %e, "Join failed");
                    metrics::record_error("join");
                    send_event(sender, &ServerEvent::error(e.code(), e.to_string())).await?;
                }
            }
        }

        ClientEvent::LeaveChannel { channel_id, .. } => {
            debug!(connection = %connection_id, channel = %channel_id, "Leave request");

            if let Some(handle) = subscription_tasks.remove(&channel_id) {
                handle.abort();
            }
            state.router.unsubscribe(&channel_id, connection_id);
            metrics::set_active_channels(state.router.stats().channel_count);
        }

        ClientEvent::SendMessage {
            channel_id,
            content,
            kind,
            ..
        } => {
            let start = Instant::now();
            match state
                .router
                .publish(&channel_id, connection_id, content, kind)
                .await
            {
                Ok(persisted) => {
                    metrics::record_publish_latency(start.elapsed().as_secs_f64());
                    debug!(
                        connection = %connection_id,
                        channel = %channel_id,
                        id = persisted.id,
                        "Published"
                    );
                }
                Err(e) => {
                    warn!(connection = %connection_id, channel = %channel_id, error = %e, "Publish failed");
                    metrics::record_error("publish");
                    send_event(sender, &ServerEvent::error(e.code(), e.to_string())).await?;
                }
            }
        }

        ClientEvent::Typing { channel_id, .. } => {
            if let Err(e) = state.notifier.notify_typing(&channel_id, connection_id) {
                // Unknown connection: no-op failure, never fatal.
                debug!(connection = %connection_id, error = %e, "Typing relay dropped");
            }
        }

        ClientEvent::StopTyping { channel_id, .. } => {
            if let Err(e) = state.notifier.notify_stop_typing(&channel_id, connection_id) {
                debug!(connection = %connection_id, error = %e, "Stop-typing relay dropped");
            }
        }
    }

    Ok(())
}

/// Forward a channel's broadcast stream into the connection's outbound
/// queue, dropping events the connection must not see.
fn spawn_forward_task(
    mut rx: broadcast::Receiver<Outbound>,
    connection_id: ConnectionId,
    sub_tx: mpsc::UnboundedSender<Arc<ServerEvent>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(outbound) => {
                    if !outbound.is_for(&connection_id) {
                        continue;
                    }
                    if sub_tx.send(Arc::clone(&outbound.event)).is_err() {
                        break; // Receiver dropped
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(connection = %connection_id, skipped, "Subscriber lagged");
                    continue;
                }
            }
        }
    })
}

/// Send a single event to the WebSocket.
async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> Result<()> {
    let text = codec::encode(event)?;
    metrics::record_message("outbound");
    sender.send(Message::Text(text)).await?;
    Ok(())
}
