//! Notifications pushed from the supervisor to whatever front-end is attached.

use std::fmt;

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// One engine stderr line, or a probe diagnostic.
    Log(String),
    /// Engine line that looks fatal.
    Error(String),
    /// The engine exited while the session was running.
    ConnectionLost(String),
    ConnectionStatus(ConnectionStatus),
    /// Raw telemetry payload, forwarded verbatim.
    Traffic(String),
}

impl Event {
    /// Topic name a UI bridge would publish this event under.
    #[must_use]
    pub fn topic(&self) -> &'static str {
        match self {
            Self::Log(_) => "log",
            Self::Error(_) => "error",
            Self::ConnectionLost(_) => "connection_lost",
            Self::ConnectionStatus(_) => "connection_status",
            Self::Traffic(_) => "traffic",
        }
    }
}

/// Receives supervisor notifications. Called from runtime tasks, so
/// implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Writes every event to the process log.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        match event {
            Event::Log(line) => tracing::info!(target: "engine", "{}", line),
            Event::Error(line) => tracing::error!(target: "engine", "{}", line),
            Event::ConnectionLost(reason) => tracing::warn!(reason = %reason, "connection_lost"),
            Event::ConnectionStatus(status) => {
                tracing::info!(status = %status, "connection_status")
            }
            Event::Traffic(payload) => tracing::trace!(payload = %payload, "traffic"),
        }
    }
}

/// Forwards events into an unbounded channel. Dropped receivers are ignored.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_match_event_kinds() {
        assert_eq!(Event::Log("x".into()).topic(), "log");
        assert_eq!(Event::ConnectionLost("x".into()).topic(), "connection_lost");
        assert_eq!(
            Event::ConnectionStatus(ConnectionStatus::Connected).topic(),
            "connection_status"
        );
        assert_eq!(ConnectionStatus::Disconnected.to_string(), "disconnected");
    }

    #[tokio::test]
    async fn channel_sink_survives_dropped_receiver() {
        let (sink, mut rx) = ChannelSink::new();
        sink.emit(Event::Traffic("{\"up\":1,\"down\":2}".into()));
        assert_eq!(
            rx.recv().await,
            Some(Event::Traffic("{\"up\":1,\"down\":2}".into()))
        );

        drop(rx);
        sink.emit(Event::Log("ignored".into()));
    }
}
