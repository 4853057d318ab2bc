//! Traffic telemetry from the engine's control API.
//!
//! The collector keeps a websocket open to `/traffic` for as long as a session
//! is running and forwards every frame to the event sink unchanged. The engine
//! often is not listening yet when the session starts, so connect failures and
//! disconnects are retried after a fixed backoff until cancelled.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::events::{Event, EventSink};

pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

#[must_use]
pub fn traffic_url(admin_addr: &str) -> String {
    format!("ws://{}/traffic?token=", admin_addr)
}

/// Read traffic frames until `cancel` flips to true or its sender is dropped.
pub async fn run(
    url: String,
    sink: Arc<dyn EventSink>,
    mut cancel: watch::Receiver<bool>,
    backoff: Duration,
) {
    loop {
        if *cancel.borrow() {
            return;
        }

        let connected = tokio::select! {
            res = tokio_tungstenite::connect_async(url.as_str()) => res,
            _ = cancel.changed() => return,
        };

        match connected {
            Ok((mut ws, _response)) => {
                debug!(url = %url, "telemetry_connected");
                loop {
                    tokio::select! {
                        frame = ws.next() => match frame {
                            Some(Ok(Message::Text(text))) => {
                                sink.emit(Event::Traffic(text.as_str().to_owned()));
                            }
                            Some(Ok(Message::Binary(bytes))) => {
                                sink.emit(Event::Traffic(String::from_utf8_lossy(&bytes).into_owned()));
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("telemetry_closed");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                debug!(error = ?e.to_string(), "telemetry_read_failed");
                                break;
                            }
                        },
                        _ = cancel.changed() => {
                            let _ = ws.close(None).await;
                            return;
                        }
                    }
                }
            }
            Err(e) => debug!(error = ?e.to_string(), "telemetry_connect_failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = cancel.changed() => return,
        }
    }
}

/// A running collector. One per session; dropping it without
/// [`TelemetryHandle::cancel_and_join`] also stops the task.
pub struct TelemetryHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TelemetryHandle {
    #[must_use]
    pub fn spawn(url: String, sink: Arc<dyn EventSink>, backoff: Duration) -> Self {
        let (cancel, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(run(url, sink, cancel_rx, backoff));
        Self { cancel, task }
    }

    pub async fn cancel_and_join(self) {
        let _ = self.cancel.send(true);
        if let Err(e) = self.task.await {
            debug!(error = ?e.to_string(), "telemetry_join_failed");
        }
    }
}
