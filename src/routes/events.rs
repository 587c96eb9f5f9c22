//! Server-Sent Events (SSE) endpoint.
//!
//! `GET /events` — subscribes to the same [`crate::events::EventBus`]
//! that feeds the WS transport's global `Event` frames, so dashboards and
//! webhooks see the identical lifecycle/bell/command stream without needing
//! the binary frame protocol.

use std::convert::Infallible;
use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures_util::stream::Stream;
use tokio::sync::broadcast;

use crate::events::ServerEvent;
use crate::AppState;

/// Maximum concurrent SSE connections before rejecting with 429.
const MAX_SSE_CONNECTIONS: u32 = 64;

pub async fn event_stream(State(state): State<AppState>) -> impl IntoResponse {
    let current = state.sse_connections.load(Ordering::Relaxed);
    if current >= MAX_SSE_CONNECTIONS {
        return Err((StatusCode::TOO_MANY_REQUESTS, "too many SSE connections"));
    }
    state.sse_connections.fetch_add(1, Ordering::Relaxed);

    let rx = state.event_bus.subscribe();
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Ok(event) => Some((to_sse_event(&event), rx)),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                let event = Event::default().event("error").data(format!(r#"{{"code":"LAGGED","missed":{n}}}"#));
                Some((Ok(event), rx))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    });

    let stream = DropCounterStream { inner: Box::pin(stream), counter: state.sse_connections.clone(), decremented: false };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default().interval(std::time::Duration::from_secs(15))))
}

fn to_sse_event(event: &ServerEvent) -> Result<Event, Infallible> {
    let value = serde_json::to_value(event).unwrap_or_default();
    let event_type = value["type"].as_str().unwrap_or("message").to_string();
    Ok(Event::default().event(event_type).data(serde_json::to_string(event).unwrap_or_default()))
}

/// Decrements the SSE connection counter when the stream ends or is dropped,
/// whichever comes first — mirrors the at-most-once decrement discipline a
/// raw `Drop` impl alone can't guarantee once the stream ends cleanly.
struct DropCounterStream<S> {
    inner: std::pin::Pin<Box<S>>,
    counter: std::sync::Arc<std::sync::atomic::AtomicU32>,
    decremented: bool,
}

impl<S: Stream<Item = Result<Event, Infallible>>> Stream for DropCounterStream<S> {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Option<Self::Item>> {
        let result = self.inner.as_mut().poll_next(cx);
        if let std::task::Poll::Ready(None) = &result {
            if !self.decremented {
                self.counter.fetch_sub(1, Ordering::Relaxed);
                self.decremented = true;
            }
        }
        result
    }
}

impl<S> Drop for DropCounterStream<S> {
    fn drop(&mut self) {
        if !self.decremented {
            self.counter.fetch_sub(1, Ordering::Relaxed);
            self.decremented = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[test]
    fn to_sse_event_succeeds_for_every_variant() {
        let event = ServerEvent::Bell {
            session_id: "s1".into(),
            session_name: "shell".into(),
            bell_count: 3,
            process_info: None,
            timestamp: "2024-01-01T00:00:00Z".into(),
        };
        assert!(to_sse_event(&event).is_ok());
    }

    #[tokio::test]
    async fn drop_counter_stream_decrements_exactly_once_on_exhaustion() {
        let counter = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(1));
        let inner = stream::iter(vec![Ok::<Event, Infallible>(Event::default())]);
        let mut wrapped = DropCounterStream { inner: Box::pin(inner), counter: counter.clone(), decremented: false };

        use futures_util::StreamExt;
        assert!(wrapped.next().await.is_some());
        assert!(wrapped.next().await.is_none());
        assert_eq!(counter.load(Ordering::Relaxed), 0);

        drop(wrapped);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn drop_counter_stream_decrements_on_early_drop() {
        let counter = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(1));
        let inner = stream::pending::<Result<Event, Infallible>>();
        let wrapped = DropCounterStream { inner: Box::pin(inner), counter: counter.clone(), decremented: false };
        drop(wrapped);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }
}
