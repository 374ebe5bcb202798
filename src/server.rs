use crate::frame::{self, ControlFrame, Inbound, OutboundFrame};
use crate::hub::{TrackingHub, SEND_QUEUE_CAPACITY};
use crate::store::summary;
use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use uuid::Uuid;

/// History replay batch size, matching what observer clients page on.
const HISTORY_BATCH_SIZE: usize = 100;

/// Minimal pacing between replay batches so a large history does not starve
/// the rest of the connection's work.
const REPLAY_PACING: Duration = Duration::from_millis(1);

/// Accept loop. One task per connection; a failed accept is logged and the
/// loop keeps serving.
pub async fn serve(port: u16, hub: TrackingHub) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "websocket server listening");

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let hub = hub.clone();
                tokio::spawn(async move {
                    tracing::info!(%addr, "client connecting");
                    if let Err(err) = handle_connection(stream, hub).await {
                        tracing::debug!(%addr, error = %err, "connection closed with error");
                    }
                    tracing::info!(%addr, "client connection closed");
                });
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to accept connection");
            }
        }
    }
}

/// Per-connection lifecycle: register with the hub, replay history, then run
/// the dispatch loop until the peer goes away. Teardown unconditionally
/// clears the follow indices.
async fn handle_connection(stream: TcpStream, hub: TrackingHub) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let ws_stream = accept_async(stream).await?;
    let (mut sink, mut source) = ws_stream.split();

    let (tx, mut rx) = mpsc::channel::<Message>(SEND_QUEUE_CAPACITY);
    let connection_id = Uuid::new_v4();

    // Writer task: drains the bounded outbound queue. The hub drops this
    // connection when the queue stays full; the reader below exits when the
    // writer goes away.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    hub.register(connection_id, tx.clone()).await;

    let result = async {
        send_history(&hub, &tx).await?;

        while let Some(message) = source.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    dispatch(&hub, connection_id, &tx, text.as_str()).await?;
                    hub.maybe_broadcast_active_users().await;
                }
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(connection = %connection_id, error = %err, "websocket receive error");
                    break;
                }
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    hub.unregister(connection_id).await;
    writer.abort();
    result
}

/// Routes one inbound text frame. Protocol errors are logged and never fatal;
/// only a dead outbound queue ends the connection.
async fn dispatch(
    hub: &TrackingHub,
    connection_id: Uuid,
    tx: &mpsc::Sender<Message>,
    raw: &str,
) -> Result<()> {
    // Transport-level heartbeat: the literal string, answered in kind.
    if raw == "ping" {
        tx.send(Message::text("pong")).await?;
        return Ok(());
    }

    let mut bytes = raw.as_bytes().to_vec();
    match frame::decode(&mut bytes) {
        Inbound::Control(control) => {
            handle_control(hub, connection_id, tx, control).await?;
        }
        Inbound::Telemetry(telemetry) => {
            let missing = telemetry.missing_required_fields();
            if !missing.is_empty() {
                tracing::error!(
                    connection = %connection_id,
                    missing = ?missing,
                    "telemetry frame missing required fields"
                );
                return Ok(());
            }
            hub.ingest(*telemetry).await;
        }
        Inbound::Unknown { frame_type } => {
            tracing::info!(connection = %connection_id, frame_type = %frame_type, "ignoring unknown frame type");
        }
        Inbound::Malformed { error } => {
            tracing::error!(connection = %connection_id, error = %error, "invalid frame");
        }
    }
    Ok(())
}

async fn handle_control(
    hub: &TrackingHub,
    connection_id: Uuid,
    tx: &mpsc::Sender<Message>,
    control: ControlFrame,
) -> Result<()> {
    match control {
        ControlFrame::Ping => {
            send_frame(tx, &OutboundFrame::Pong).await?;
        }
        ControlFrame::RequestHistory => {
            send_history(hub, tx).await?;
        }
        ControlFrame::CleanupMemory => {
            let sweep = hub.cleanup_memory().await;
            send_frame(
                tx,
                &OutboundFrame::CleanupResponse {
                    success: true,
                    message: format!(
                        "Removed {} expired points and {} sessions",
                        sweep.points_removed, sweep.sessions_removed
                    ),
                },
            )
            .await?;
        }
        ControlFrame::GetActiveUsers => {
            let users = hub.active_users().await;
            send_frame(tx, &OutboundFrame::ActiveUsers { users }).await?;
        }
        ControlFrame::FollowUsers { session_ids } => {
            let following = hub.follow(connection_id, session_ids).await;
            send_frame(
                tx,
                &OutboundFrame::FollowResponse {
                    success: true,
                    following: following.clone(),
                },
            )
            .await?;
            for session_id in &following {
                if let Some(update) = hub.latest_followed_update(session_id).await {
                    send_frame(tx, &update).await?;
                }
            }
        }
        ControlFrame::UnfollowUsers => {
            hub.unfollow(connection_id).await;
            send_frame(tx, &OutboundFrame::UnfollowResponse { success: true }).await?;
        }
        ControlFrame::RequestSessions => {
            let sessions = hub.session_list().await;
            send_frame(tx, &OutboundFrame::SessionList { sessions }).await?;
        }
        ControlFrame::DeleteSession { session_id } => {
            let Some(session_id) = session_id.filter(|id| !id.is_empty()) else {
                send_frame(
                    tx,
                    &OutboundFrame::DeleteResponse {
                        session_id: String::new(),
                        success: false,
                        reason: "sessionId is required".to_string(),
                    },
                )
                .await?;
                return Ok(());
            };
            let outcome = hub.delete_session(&session_id).await;
            send_frame(
                tx,
                &OutboundFrame::DeleteResponse {
                    session_id,
                    success: outcome.success,
                    reason: outcome.reason,
                },
            )
            .await?;
        }
        ControlFrame::GetWeather { session_id } => {
            let session_id = session_id.unwrap_or_default();
            let frame = match required_store(hub, &session_id) {
                Ok(store) => match summary::weather_series(store.pool(), &session_id).await {
                    Ok(data) => OutboundFrame::WeatherData {
                        session_id,
                        data: Some(data),
                        error: None,
                    },
                    Err(err) => OutboundFrame::WeatherData {
                        session_id,
                        data: None,
                        error: Some(err.to_string()),
                    },
                },
                Err(error) => OutboundFrame::WeatherData {
                    session_id,
                    data: None,
                    error: Some(error),
                },
            };
            send_frame(tx, &frame).await?;
        }
        ControlFrame::GetWeatherSummary { session_id } => {
            let session_id = session_id.unwrap_or_default();
            let frame = match required_store(hub, &session_id) {
                Ok(store) => match summary::weather_summary(store.pool(), &session_id).await {
                    Ok(data) => OutboundFrame::WeatherSummary {
                        session_id,
                        summary: Some(data),
                        error: None,
                    },
                    Err(err) => OutboundFrame::WeatherSummary {
                        session_id,
                        summary: None,
                        error: Some(err.to_string()),
                    },
                },
                Err(error) => OutboundFrame::WeatherSummary {
                    session_id,
                    summary: None,
                    error: Some(error),
                },
            };
            send_frame(tx, &frame).await?;
        }
        ControlFrame::GetBarometer { session_id } => {
            let session_id = session_id.unwrap_or_default();
            let frame = match required_store(hub, &session_id) {
                Ok(store) => match summary::barometer_series(store.pool(), &session_id).await {
                    Ok(data) => OutboundFrame::BarometerData {
                        session_id,
                        data: Some(data),
                        error: None,
                    },
                    Err(err) => OutboundFrame::BarometerData {
                        session_id,
                        data: None,
                        error: Some(err.to_string()),
                    },
                },
                Err(error) => OutboundFrame::BarometerData {
                    session_id,
                    data: None,
                    error: Some(error),
                },
            };
            send_frame(tx, &frame).await?;
        }
        ControlFrame::GetBarometerSummary { session_id } => {
            let session_id = session_id.unwrap_or_default();
            let frame = match required_store(hub, &session_id) {
                Ok(store) => match summary::barometer_summary(store.pool(), &session_id).await {
                    Ok(data) => OutboundFrame::BarometerSummary {
                        session_id,
                        summary: Some(data),
                        error: None,
                    },
                    Err(err) => OutboundFrame::BarometerSummary {
                        session_id,
                        summary: None,
                        error: Some(err.to_string()),
                    },
                },
                Err(error) => OutboundFrame::BarometerSummary {
                    session_id,
                    summary: None,
                    error: Some(error),
                },
            };
            send_frame(tx, &frame).await?;
        }
    }
    Ok(())
}

fn required_store<'a>(hub: &'a TrackingHub, session_id: &str) -> Result<&'a crate::store::Store, String> {
    if session_id.is_empty() {
        return Err("sessionId is required".to_string());
    }
    hub.store().ok_or_else(|| "store unavailable".to_string())
}

/// Streams the full in-memory history to one client: time-ordered batches,
/// then the session list, then a completion marker.
async fn send_history(hub: &TrackingHub, tx: &mpsc::Sender<Message>) -> Result<()> {
    let (points, sessions) = hub.history_snapshot().await;
    let total = points.len();

    for chunk in points.chunks(HISTORY_BATCH_SIZE) {
        send_frame(
            tx,
            &OutboundFrame::HistoryBatch {
                points: chunk.to_vec(),
            },
        )
        .await?;
        tokio::time::sleep(REPLAY_PACING).await;
    }

    send_frame(tx, &OutboundFrame::SessionList { sessions }).await?;
    send_frame(tx, &OutboundFrame::HistoryComplete).await?;
    tracing::info!(points = total, "sent history replay");
    Ok(())
}

async fn send_frame(tx: &mpsc::Sender<Message>, frame: &OutboundFrame) -> Result<()> {
    let text = match frame.encode() {
        Ok(text) => text,
        Err(err) => {
            tracing::error!(error = %err, "failed to encode outbound frame");
            return Ok(());
        }
    };
    tx.send(Message::text(text)).await?;
    Ok(())
}
