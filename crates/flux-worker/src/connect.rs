//! The worker's SSE subscription loop (spec.md §4.7 steps 2, 6):
//! opens `/workers/{name}/connect`, turns the byte stream into
//! [`ControlEvent`]s via `eventsource-stream`, and reconnects with
//! exponential backoff on disconnect, re-registering if the session
//! token is rejected. Adapted from the teacher's
//! `everruns-worker::client` reconnect logic and the backoff constants
//! `control-plane::api::events::stream_sse` uses for its own
//! (server-side) retry loop.

use std::time::Duration;

use eventsource_stream::Eventsource;
use flux_core::workflow::WorkerResources;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::client::{ControlEvent, ServerClient};

const MIN_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Drives the reconnect loop in a background task and returns a stream
/// of [`ControlEvent`]s the caller can consume with `while let Some`.
/// The returned client handle is the one the caller should use for
/// claim/checkpoint calls — its session token is kept current across
/// re-registrations.
pub fn subscribe(
    client: ServerClient,
    bootstrap_token: String,
    resources: WorkerResources,
) -> (ReceiverStream<ControlEvent>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(256);

    let handle = tokio::spawn(async move {
        let mut backoff = MIN_BACKOFF;
        loop {
            if !client.has_session().await {
                if let Err(e) = client.register(&bootstrap_token, resources.clone()).await {
                    tracing::warn!(error = %e, "worker registration failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
                tracing::info!("worker registered with control plane");
            }

            match client.connect_stream().await {
                Ok(resp) => {
                    backoff = MIN_BACKOFF;
                    let mut events = resp.bytes_stream().eventsource();
                    while let Some(frame) = events.next().await {
                        match frame {
                            Ok(frame) if frame.data.is_empty() => continue,
                            Ok(frame) => match parse_control_event(&frame.event, &frame.data) {
                                Ok(Some(event)) => {
                                    if tx.send(event).await.is_err() {
                                        return;
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => tracing::warn!(error = %e, "malformed control event frame"),
                            },
                            Err(e) => {
                                tracing::warn!(error = %e, "control stream interrupted");
                                break;
                            }
                        }
                    }
                    tracing::info!("control stream closed, reconnecting");
                }
                Err(crate::client::ClientError::Unauthorized) => {
                    tracing::warn!("session token rejected, re-registering");
                    client.forget_session().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to open control stream");
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    });

    (ReceiverStream::new(rx), handle)
}

/// `eventsource-stream` hands us the event name and raw data segment
/// separately (it does not know our frames are tagged JSON); re-wrap
/// as `{"event": name, ...data}` so `ControlEvent`'s internally tagged
/// `#[serde(tag = "event")]` deserializes it directly.
fn parse_control_event(event_name: &str, data: &str) -> Result<Option<ControlEvent>, serde_json::Error> {
    if event_name.is_empty() || event_name == "message" {
        return Ok(None);
    }
    let mut value: serde_json::Value = serde_json::from_str(data)?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("event".to_string(), serde_json::Value::String(event_name.to_string()));
    }
    Ok(Some(serde_json::from_value(value)?))
}
