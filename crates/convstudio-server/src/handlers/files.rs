//! Directory tree updates over SSE

use crate::AppState;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use convstudio_core::FileTreeEvent;
use futures::stream::{self, Stream, StreamExt};
use std::convert::Infallible;
use tracing::warn;

/// Current tree of every root first, then one record per change
pub async fn stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // Subscribe before reading the snapshots so no change slips between them
    let subscription = state.watcher.subscribe();
    let primed = state.watcher.latest();

    let updates = stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        Some((event, subscription))
    });

    let events = stream::iter(primed)
        .chain(updates)
        .map(|event| Ok(to_sse(&event)));

    Sse::new(events).keep_alive(KeepAlive::new().interval(state.config.stream.keepalive_interval()))
}

fn to_sse(event: &FileTreeEvent) -> Event {
    Event::default().json_data(event).unwrap_or_else(|e| {
        warn!("Failed to encode file tree of {}: {}", event.folder_type(), e);
        Event::default().comment("encode error")
    })
}
