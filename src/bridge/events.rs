use serde::Serialize;
use tokio::sync::{mpsc, watch};

/// Intermediate frame for an in-flight request. Zero or more of these
/// precede the terminal reply with the same id; nothing follows it.
#[derive(Debug, Clone, Serialize)]
pub struct EventFrame {
    pub id: i64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Progress,
    Log,
    Status,
}

/// Per-request event sink handed to streaming handlers. Frames are pushed
/// into the owning connection's ordered outbound queue, so they always
/// precede the terminal reply. The sink also carries the connection's
/// cancellation signal; handlers check it at yield points.
#[derive(Clone)]
pub struct EventSink {
    id: i64,
    frames: Option<mpsc::UnboundedSender<serde_json::Value>>,
    cancelled: watch::Receiver<bool>,
}

impl EventSink {
    pub fn new(
        id: i64,
        frames: mpsc::UnboundedSender<serde_json::Value>,
        cancelled: watch::Receiver<bool>,
    ) -> Self {
        EventSink { id, frames: Some(frames), cancelled }
    }

    /// Sink for transports without streaming (HTTP fallback): events are
    /// dropped, cancellation never fires.
    pub fn detached(id: i64) -> Self {
        let (_, rx) = watch::channel(false);
        EventSink { id, frames: None, cancelled: rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Resolve when the owning connection goes away. Never resolves for a
    /// detached sink.
    pub async fn cancelled(&self) {
        let mut rx = self.cancelled.clone();
        let signalled = rx.wait_for(|cancelled| *cancelled).await.is_ok();
        drop(rx);
        if !signalled {
            // Sender gone without signalling: nothing will ever cancel us.
            std::future::pending::<()>().await;
        }
    }

    pub fn emit(&self, event_type: EventType, data: serde_json::Value) {
        let Some(frames) = &self.frames else {
            return;
        };
        let frame = EventFrame { id: self.id, event_type, data };
        // A closed connection just drops frames; the dispatch layer deals
        // with cancellation.
        let _ = frames.send(serde_json::to_value(&frame).expect("frame serializes"));
    }

    pub fn progress(&self, progress: f64, message: impl Into<String>) {
        self.emit(
            EventType::Progress,
            serde_json::json!({ "progress": progress, "message": message.into() }),
        );
    }

    pub fn log(&self, message: impl Into<String>) {
        self.emit(EventType::Log, serde_json::json!({ "message": message.into() }));
    }

    pub fn status(&self, message: impl Into<String>) {
        self.emit(EventType::Status, serde_json::json!({ "message": message.into() }));
    }
}
