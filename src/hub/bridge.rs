//! Delivers frames from the durable bus to the log store and the hub.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures_util::FutureExt;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::model::BusConfig;
use crate::orchestrator::dispatcher::panic_message;
use crate::workspace::store::{BusMessage, LogStore, MessageBus};

use super::{EventFrame, HubHandle, LOG_EVENT};

#[derive(Debug, Deserialize)]
struct LogData {
    workspace_id: u64,
    #[serde(default)]
    time: String,
    #[serde(rename = "type", default)]
    log_type: String,
    #[serde(default)]
    text: String,
}

pub struct BusBridge {
    rx: broadcast::Receiver<BusMessage>,
    logs: Arc<dyn LogStore>,
    hub: HubHandle,
    config: BusConfig,
}

impl BusBridge {
    /// Subscribe immediately so nothing published after this call is missed.
    pub fn new(
        bus: &dyn MessageBus,
        logs: Arc<dyn LogStore>,
        hub: HubHandle,
        config: BusConfig,
    ) -> Self {
        Self {
            rx: bus.subscribe(),
            logs,
            hub,
            config,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = self.rx.recv() => msg,
            };
            match msg {
                Ok(msg) => {
                    if msg.routing_key != self.config.routing_key {
                        continue;
                    }
                    if let Err(panic) = AssertUnwindSafe(self.deliver(&msg.payload))
                        .catch_unwind()
                        .await
                    {
                        error!(
                            "bus message handler panicked: {}\n{}",
                            panic_message(panic.as_ref()),
                            std::backtrace::Backtrace::force_capture()
                        );
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("bus bridge lagged, {} message(s) skipped", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("bus bridge stopped");
    }

    async fn deliver(&self, payload: &[u8]) {
        let frame: EventFrame = match serde_json::from_slice(payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("skipping malformed bus payload: {}", e);
                return;
            }
        };

        if frame.event_type == LOG_EVENT {
            match LogData::deserialize(&frame.data) {
                Ok(log) if !log.text.trim().is_empty() => {
                    if let Err(e) = self
                        .logs
                        .append_log(log.workspace_id, &log.text, &log.log_type, &log.time, Utc::now())
                        .await
                    {
                        warn!(workspace_id = log.workspace_id, "failed to store log line: {}", e);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(channel = %frame.channel, "log frame without workspace data: {}", e),
            }
        }

        self.hub.broadcast(frame);
    }
}
