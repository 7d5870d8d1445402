//! The progress bridge: one long-lived SSE response per subscriber,
//! fed from the version's event-bus topic.
//!
//! The stream closes on the first terminal frame, on client disconnect,
//! or at the absolute duration ceiling. Heartbeat comments keep
//! intermediaries from reaping idle connections; the server itself
//! applies no write time-out to this response.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use events::{ProgressEvent, ProgressStatus, Subscription, progress_topic};
use serde::Deserialize;
use serde_json::json;
use state::VersionStatus;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::api::AppState;
use crate::auth::{extract_token, verify_token};

#[derive(Deserialize)]
pub struct ProgressQuery {
    /// EventSource clients cannot set headers, so the token may arrive in
    /// the query string instead.
    pub token: Option<String>,
}

pub async fn progress_stream(
    State(app): State<AppState>,
    Path(version_id): Path<String>,
    Query(query): Query<ProgressQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(token) = extract_token(&headers, query.token.as_deref()) else {
        return (StatusCode::UNAUTHORIZED, "Missing bearer token").into_response();
    };
    let claims = match verify_token(&app.config.jwt_secret, &token) {
        Ok(claims) => claims,
        Err(_) => return (StatusCode::UNAUTHORIZED, "Invalid token").into_response(),
    };

    let version = match app.db.get_version(&version_id).await {
        Ok(Some(version)) => version,
        Ok(None) => return (StatusCode::NOT_FOUND, "Version not found").into_response(),
        Err(e) => {
            warn!("Failed to load version {}: {}", version_id, e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response();
        }
    };
    match app.db.get_app_owned(&version.app_id, &claims.sub).await {
        Ok(Some(_)) => {}
        Ok(None) => return (StatusCode::NOT_FOUND, "App not found").into_response(),
        Err(e) => {
            warn!("Failed to load app {}: {}", version.app_id, e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response();
        }
    }

    let (tx, rx) = mpsc::channel::<String>(32);

    if version.status.is_terminal() {
        // The build finished before this subscriber arrived; reflect the
        // outcome in a single synthetic frame and close.
        let (status, label) = match version.status {
            VersionStatus::Failed => (ProgressStatus::Failed, "failed"),
            _ => (ProgressStatus::Completed, "completed"),
        };
        let frame = json!({
            "version_id": version_id,
            "status": status,
            "message": format!("Build {}", label),
        })
        .to_string();
        let _ = tx.send(frame).await;
        drop(tx);
        return sse_response(rx, app.config.sse_heartbeat_interval);
    }

    // Subscribe before returning so anything published after the response
    // starts is guaranteed to be seen.
    let subscription = match app.bus.subscribe(&progress_topic(&version_id)).await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!("Failed to subscribe for version {}: {}", version_id, e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to subscribe").into_response();
        }
    };

    if tx.send(json!({"status": "connected"}).to_string()).await.is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Stream closed").into_response();
    }

    info!("SSE client connected for version {}", version_id);
    let max_duration = app.config.sse_max_duration;
    tokio::spawn(forward_progress(subscription, tx, version_id, max_duration));

    sse_response(rx, app.config.sse_heartbeat_interval)
}

fn sse_response(rx: mpsc::Receiver<String>, heartbeat: Duration) -> Response {
    let stream = ReceiverStream::new(rx)
        .map(|data| Ok::<_, Infallible>(Event::default().data(data)));

    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(heartbeat).text("heartbeat"))
        .into_response();

    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        header::CONNECTION,
        header::HeaderValue::from_static("keep-alive"),
    );
    // Tell nginx-style proxies not to buffer the stream.
    headers.insert("X-Accel-Buffering", header::HeaderValue::from_static("no"));

    response
}

/// Forward topic messages for one version into an SSE channel until a
/// terminal event, the duration ceiling, or client disconnect.
pub(crate) async fn forward_progress(
    mut subscription: Subscription,
    tx: mpsc::Sender<String>,
    version_id: String,
    max_duration: Duration,
) {
    let deadline = tokio::time::sleep(max_duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                info!("SSE ceiling reached for version {}", version_id);
                break;
            }
            message = subscription.next() => {
                let Some(payload) = message else {
                    info!("Topic closed for version {}", version_id);
                    break;
                };
                let event: ProgressEvent = match serde_json::from_slice(&payload) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Discarding unparseable progress message: {}", e);
                        continue;
                    }
                };
                if event.version_id != version_id {
                    continue;
                }

                let terminal = event.status.is_terminal();
                let data = match serde_json::to_string(&event) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!("Failed to re-serialize progress event: {}", e);
                        continue;
                    }
                };
                if tx.send(data).await.is_err() {
                    // Client disconnected; unsubscribe by dropping.
                    info!("SSE client disconnected for version {}", version_id);
                    break;
                }
                if terminal {
                    info!("Build {} terminal event forwarded, closing stream", version_id);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use events::EventBus;

    async fn publish(bus: &EventBus, version_id: &str, status: ProgressStatus, message: &str) {
        let event = ProgressEvent::now(version_id, status, message);
        bus.publish(
            &progress_topic(version_id),
            serde_json::to_vec(&event).unwrap(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_forward_closes_after_terminal_event() {
        let bus = EventBus::in_memory();
        let sub = bus.subscribe(&progress_topic("v-1")).await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);

        let forwarder = tokio::spawn(forward_progress(
            sub,
            tx,
            "v-1".to_string(),
            Duration::from_secs(30),
        ));

        publish(&bus, "v-1", ProgressStatus::Building, "Packaging code...").await;
        publish(&bus, "v-1", ProgressStatus::Completed, "Build completed successfully!").await;
        publish(&bus, "v-1", ProgressStatus::Building, "late message").await;

        let first = rx.recv().await.unwrap();
        assert!(first.contains("\"building\""));
        let second = rx.recv().await.unwrap();
        assert!(second.contains("\"completed\""));

        // Exactly one terminal frame, then the channel closes.
        assert!(rx.recv().await.is_none());
        forwarder.await.unwrap();
    }

    #[tokio::test]
    async fn test_forward_filters_foreign_versions() {
        let bus = EventBus::in_memory();
        let sub = bus.subscribe(&progress_topic("v-1")).await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);

        tokio::spawn(forward_progress(
            sub,
            tx,
            "v-1".to_string(),
            Duration::from_secs(30),
        ));

        // An event for another version on this topic is ignored.
        let stray = ProgressEvent::now("v-2", ProgressStatus::Building, "other");
        bus.publish(
            &progress_topic("v-1"),
            serde_json::to_vec(&stray).unwrap(),
        )
        .await
        .unwrap();
        publish(&bus, "v-1", ProgressStatus::Failed, "boom").await;

        let only = rx.recv().await.unwrap();
        assert!(only.contains("\"failed\""));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_forward_stops_at_duration_ceiling() {
        let bus = EventBus::in_memory();
        let sub = bus.subscribe(&progress_topic("v-1")).await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);

        let forwarder = tokio::spawn(forward_progress(
            sub,
            tx,
            "v-1".to_string(),
            Duration::from_millis(50),
        ));

        forwarder.await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_forward_exits_when_client_disconnects() {
        let bus = EventBus::in_memory();
        let sub = bus.subscribe(&progress_topic("v-1")).await.unwrap();
        let (tx, rx) = mpsc::channel(8);

        let forwarder = tokio::spawn(forward_progress(
            sub,
            tx,
            "v-1".to_string(),
            Duration::from_secs(30),
        ));

        // Dropping the receiver is what a client disconnect looks like.
        drop(rx);
        publish(&bus, "v-1", ProgressStatus::Building, "still going").await;

        forwarder.await.unwrap();
    }
}
