//! Client-facing endpoints: stream bridging upgrade, session list, event
//! stream.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Extension, Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Response;
use axum::Json;
use futures::Stream;
use tracing::{debug, error, info};

use super::error::ApiError;
use super::forwarded::RemoteAddr;
use super::settings::ApiSettings;
use crate::carrier;
use crate::connman::ClientSessionList;

/// GET `/api/v1/connect/{callback_id}` — bridges a client stream to the
/// named agent over a websocket upgrade. Unknown ids are rejected before the
/// upgrade; the registration may still vanish in between, which the manager
/// reports on the session result instead.
pub async fn connect_get(
    State(settings): State<ApiSettings>,
    Path(callback_id): Path<String>,
    Extension(remote): Extension<RemoteAddr>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    match settings.connman.lookup_callback_session(&callback_id).await {
        None => {
            return Err(ApiError::NotFound(format!(
                "callback session does not exist: {callback_id}"
            )));
        }
        Some(agent) if !agent.is_live() => {
            return Err(ApiError::Conflict(format!(
                "callback session is disconnecting: {callback_id}"
            )));
        }
        Some(_) => {}
    }

    info!(callback_id, remote_addr = %remote.0, "client connection upgrade");
    Ok(ws
        .read_buffer_size(settings.read_buffer_size)
        .write_buffer_size(settings.write_buffer_size)
        .on_upgrade(move |socket| async move {
            let carrier = carrier::wrap_websocket(socket);
            let result_rx =
                settings
                    .connman
                    .client_connection(callback_id.clone(), remote.0, carrier);
            match result_rx.await {
                Ok(Ok(())) => info!(callback_id, "client session ended normally"),
                Ok(Err(err)) => error!(callback_id, error = %err, "client session error"),
                Err(_) => error!(callback_id, "client session ended without a result"),
            }
        }))
}

/// GET `/api/v1/connect` — snapshot of active client sessions.
pub async fn sessions_get(State(settings): State<ApiSettings>) -> Json<ClientSessionList> {
    Json(settings.connman.list_client_sessions().await)
}

/// GET `/api/v1/events/connect` — SSE stream of client session events.
pub async fn subscribe(
    State(settings): State<ApiSettings>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let subscription = settings
        .connman
        .subscribe_client_events(settings.subscriber_buffer);
    debug!(subscriber = subscription.id(), "new client event subscriber");
    let stream = futures::stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        Some((
            Event::default().event("boot").json_data(&event),
            subscription,
        ))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
