use tokio::sync::mpsc;

use crate::sse::Usage;

/// Ordered streaming events published to the front-end.
///
/// Events for one turn arrive in production order; the consumer may drop
/// kinds it does not render. `Cancelled` and `Error` are terminal for the
/// turn. The producer never awaits the consumer — the channel is unbounded
/// and rendering latency cannot stall the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    RawData { line: String },
    Debug { message: String },
    Warning { message: String },
    MessageStart,
    ContentBlockStart { index: usize, kind: String },
    ContentBlockDelta { index: usize, fragment: String },
    ContentBlockStop { index: usize },
    MessageDelta { stop_reason: Option<String> },
    MessageStop,
    Ping,
    Usage(Usage),
    Status { message: String },
    InteractionComplete,
    StopRequested,
    Cancelled,
    Error { code: String, detail: String },
}

pub type BusSender = mpsc::UnboundedSender<BusEvent>;
pub type BusReceiver = mpsc::UnboundedReceiver<BusEvent>;

/// Create the UI event channel.
pub fn channel() -> (BusSender, BusReceiver) {
    mpsc::unbounded_channel()
}
