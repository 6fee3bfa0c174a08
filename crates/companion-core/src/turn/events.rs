//! Serialized event writer shared by the turn task and the speech relay.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use companion_types::event::TurnEvent;

/// The client went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event sink closed")]
pub struct SinkClosed;

/// Destination for a turn's push events.
pub trait EventSink: Send + 'static {
    fn emit(
        &mut self,
        event: TurnEvent,
    ) -> impl std::future::Future<Output = Result<(), SinkClosed>> + Send;
}

impl EventSink for mpsc::Sender<TurnEvent> {
    async fn emit(&mut self, event: TurnEvent) -> Result<(), SinkClosed> {
        self.send(event).await.map_err(|_| SinkClosed)
    }
}

/// Mutex-guarded handle to one sink. Cloned into every task that writes.
pub struct EventWriter<S: EventSink> {
    sink: Arc<Mutex<S>>,
}

impl<S: EventSink> Clone for EventWriter<S> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
        }
    }
}

impl<S: EventSink> EventWriter<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    /// Write one event. Returns false once the client is gone.
    pub async fn emit(&self, event: TurnEvent) -> bool {
        let name = event.name();
        let mut sink = self.sink.lock().await;
        match sink.emit(event).await {
            Ok(()) => true,
            Err(SinkClosed) => {
                debug!(event = name, "dropping event, client disconnected");
                false
            }
        }
    }
}
