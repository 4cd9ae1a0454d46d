//! Server-sent stream of lifecycle events.

use crate::state::AppState;
use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Router,
};
use devenv_orchestrator::LifecycleEvent;
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use std::convert::Infallible;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub fn routes() -> Router<AppState> {
    Router::new().route("/api/v1/events", get(stream_events))
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub environment_id: Option<String>,
}

struct Subscription {
    receiver: broadcast::Receiver<LifecycleEvent>,
    environment_id: Option<String>,
    shutdown: CancellationToken,
}

impl Subscription {
    /// Next event for this subscriber, or `None` once the stream should end.
    async fn next(&mut self) -> Option<LifecycleEvent> {
        loop {
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                received = self.receiver.recv() => received,
            };
            match received {
                Ok(event) => {
                    let wanted = self
                        .environment_id
                        .as_deref()
                        .is_none_or(|id| id == event.environment_id);
                    if wanted {
                        return Some(event);
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "event subscriber lagged, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

async fn stream_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = Subscription {
        receiver: state.orchestrator.subscribe(),
        environment_id: query.environment_id,
        shutdown: state.shutdown.clone(),
    };
    debug!(filter = ?subscription.environment_id, "event subscriber connected");

    let events = stream::unfold(subscription, |mut subscription| async move {
        loop {
            let event = subscription.next().await?;
            match Event::default()
                .event("lifecycle")
                .json_data(&event)
            {
                Ok(frame) => return Some((Ok::<_, Infallible>(frame), subscription)),
                Err(e) => warn!(error = %e, "failed to encode lifecycle event"),
            }
        }
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}
