//! Forwarding of function-authored log lines to the log topic.
//!
//! The execution loop attaches the forwarder right before invoking user code
//! and the returned guard detaches it when dropped, on every exit path. Lines
//! logged while detached only reach `tracing`. Attached lines are queued on a
//! bounded channel and published by a background task, so a slow bus never
//! blocks the function.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use fnhost_api::context::LogLevel;
use fnhost_api::error::PluginError;

use crate::messaging::{MessagingClient, OutgoingMessage, Producer, ProducerOptions};
use crate::stats::now_ms;
use crate::sync::lock;

#[derive(Debug, Serialize)]
struct LogLine<'a> {
    ts: i64,
    level: &'static str,
    function: &'a str,
    instance: u32,
    message: &'a str,
}

pub struct LogForwarder {
    topic: String,
    function: String,
    instance_id: u32,
    attached: AtomicBool,
    sender: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LogForwarder {
    /// Create the log topic producer and spawn the publishing task.
    pub async fn start(
        client: &dyn MessagingClient,
        topic: &str,
        function: &str,
        instance_id: u32,
        capacity: usize,
    ) -> Result<Arc<Self>, PluginError> {
        let producer = client
            .create_producer(ProducerOptions::new(topic, format!("{function}:{instance_id}:log")))
            .await
            .map_err(|e| e.with_context(format!("log topic '{topic}'")))?;

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(publish_loop(producer, rx));

        Ok(Arc::new(Self {
            topic: topic.to_string(),
            function: function.to_string(),
            instance_id,
            attached: AtomicBool::new(false),
            sender: Mutex::new(Some(tx)),
            task: Mutex::new(Some(task)),
        }))
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Route lines to the log topic until the guard is dropped.
    pub fn attach(&self) -> AttachGuard<'_> {
        self.attached.store(true, Ordering::Release);
        AttachGuard { forwarder: self }
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Queue one line if attached. Returns whether it was queued.
    pub fn forward(&self, level: LogLevel, message: &str) -> bool {
        if !self.is_attached() {
            return false;
        }
        let line = LogLine {
            ts: now_ms(),
            level: level.as_str(),
            function: &self.function,
            instance: self.instance_id,
            message,
        };
        let payload = match serde_json::to_vec(&line) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode log line");
                return false;
            }
        };

        let sender = lock(&self.sender);
        let Some(tx) = sender.as_ref() else {
            return false;
        };
        match tx.try_send(payload) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(topic = %self.topic, "log queue full, dropping line");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Stop accepting lines, flush the queue and close the producer.
    pub async fn close(&self) {
        self.attached.store(false, Ordering::Release);
        drop(lock(&self.sender).take());
        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "log forwarding task failed");
            }
        }
    }
}

/// Detaches the forwarder when dropped.
pub struct AttachGuard<'a> {
    forwarder: &'a LogForwarder,
}

impl Drop for AttachGuard<'_> {
    fn drop(&mut self) {
        self.forwarder.attached.store(false, Ordering::Release);
    }
}

async fn publish_loop(producer: Arc<dyn Producer>, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(payload) = rx.recv().await {
        if let Err(e) = producer.send(OutgoingMessage::new(payload)).await {
            tracing::warn!(topic = %producer.topic(), error = %e, "failed to publish log line");
        }
    }
    if let Err(e) = producer.close().await {
        tracing::warn!(topic = %producer.topic(), error = %e, "failed to close log producer");
    }
}
