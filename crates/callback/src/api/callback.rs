//! Agent-facing endpoints: registration upgrade, session list, event stream.

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
use crate::connman::CallbackSessionList;

/// GET `/api/v1/callback/{callback_id}` — registers an agent over a
/// websocket upgrade. Refused with a conflict while a live session owns the
/// id; the same check is repeated under the registry lock after the upgrade,
/// which covers the race.
pub async fn callback_get(
    State(settings): State<ApiSettings>,
    Path(callback_id): Path<String>,
    Extension(remote): Extension<RemoteAddr>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    if let Some(existing) = settings.connman.lookup_callback_session(&callback_id).await {
        if existing.is_live() {
            return Err(ApiError::Conflict(format!(
                "callback session already exists: {callback_id}"
            )));
        }
    }

    info!(callback_id, remote_addr = %remote.0, "callback connection upgrade");
    Ok(ws
        .read_buffer_size(settings.read_buffer_size)
        .write_buffer_size(settings.write_buffer_size)
        .on_upgrade(move |socket| async move {
            let carrier = carrier::wrap_websocket(socket);
            let result_rx =
                settings
                    .connman
                    .callback_connection(callback_id.clone(), remote.0, carrier);
            match result_rx.await {
                Ok(Ok(())) => info!(callback_id, "callback session ended normally"),
                Ok(Err(err)) => error!(callback_id, error = %err, "callback session error"),
                Err(_) => error!(callback_id, "callback session ended without a result"),
            }
        }))
}

/// GET `/api/v1/callback` — snapshot of active callback sessions.
pub async fn sessions_get(State(settings): State<ApiSettings>) -> Json<CallbackSessionList> {
    Json(settings.connman.list_callback_sessions().await)
}

/// GET `/api/v1/events/callback` — SSE stream of agent session events.
pub async fn subscribe(
    State(settings): State<ApiSettings>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let subscription = settings
        .connman
        .subscribe_callback_events(settings.subscriber_buffer);
    debug!(subscriber = subscription.id(), "new callback event subscriber");
    let stream = futures::stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        Some((
            Event::default().event("boot").json_data(&event),
            subscription,
        ))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
