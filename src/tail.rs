// Copyright 2021 Datafuse Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Live tail subscriptions.
//!
//! Each subscription path (`<requestId>/<refId>`) owns a bounded frame
//! channel. One producer decodes the upstream tail response into that
//! channel and one dispatcher drains it into a [`StreamSink`]. Unsubscribing
//! cancels both sides through the subscription's token; frames already in
//! the channel are still delivered.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use log::{debug, error, info};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    error::AppError,
    frame::{Frame, FrameSchema},
};

pub const CHANNEL_CAPACITY: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    Subscribed,
    Streaming,
    Terminated,
}

impl SubscriptionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SubscriptionState::Subscribed,
            2 => SubscriptionState::Streaming,
            3 => SubscriptionState::Terminated,
            _ => SubscriptionState::Idle,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct StateCell(Arc<AtomicU8>);

impl StateCell {
    fn get(&self) -> SubscriptionState {
        SubscriptionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: SubscriptionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("consumer cancelled the stream")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}

impl SinkError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            SinkError::Cancelled => true,
            SinkError::Failed(message) => message.contains("context canceled"),
        }
    }
}

/// Consumer side of a live subscription.
#[async_trait]
pub trait StreamSink: Send {
    /// Sends a frame including its schema.
    async fn send_frame(&mut self, frame: &Frame) -> Result<(), SinkError>;

    /// Sends the serialised data of a frame whose schema matches the previous one.
    async fn send_bytes(&mut self, payload: Vec<u8>) -> Result<(), SinkError>;
}

struct Entry {
    id: u64,
    tx: mpsc::Sender<Frame>,
    rx: Option<mpsc::Receiver<Frame>>,
    cancel: CancellationToken,
    state: StateCell,
}

/// Producer handle for one subscription.
#[derive(Debug, Clone)]
pub struct FrameSender {
    path: String,
    id: u64,
    tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    state: StateCell,
}

impl FrameSender {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> SubscriptionState {
        self.state.get()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Blocks while the channel is full. Returns `false` once the subscription
    /// is gone; the frame is dropped in that case.
    pub async fn send(&self, frame: Frame) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(frame) => sent.is_ok(),
        }
    }
}

#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    next_id: Arc<AtomicU64>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates the channel for `path`. Subscribing again to a live path
    /// returns the existing subscription.
    pub fn subscribe(&self, path: &str) -> FrameSender {
        let mut entries = self.lock();
        let entry = entries.entry(path.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
            let state = StateCell::default();
            state.set(SubscriptionState::Subscribed);
            debug!("subscribed to {path}");
            Entry {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                tx,
                rx: Some(rx),
                cancel: CancellationToken::new(),
                state,
            }
        });
        entry.sender(path)
    }

    pub fn sender(&self, path: &str) -> Option<FrameSender> {
        self.lock().get(path).map(|entry| entry.sender(path))
    }

    pub fn state(&self, path: &str) -> SubscriptionState {
        self.lock()
            .get(path)
            .map_or(SubscriptionState::Idle, |entry| entry.state.get())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Starts the single dispatcher for `path`, draining its channel into `sink`.
    pub fn run_stream<S>(&self, path: &str, sink: S) -> Result<JoinHandle<()>, AppError>
    where
        S: StreamSink + 'static,
    {
        let (rx, cancel) = {
            let mut entries = self.lock();
            let entry = entries.get_mut(path).ok_or_else(|| {
                AppError::Internal(format!("failed to find the channel for the query: {path}"))
            })?;
            let rx = entry.rx.take().ok_or_else(|| {
                AppError::Internal(format!("stream for {path} is already running"))
            })?;
            entry.state.set(SubscriptionState::Streaming);
            (rx, entry.cancel.clone())
        };
        let path = path.to_string();
        Ok(tokio::spawn(dispatch(rx, sink, cancel, path)))
    }

    /// Removes `path` and stops its producer and dispatcher. Returns `false`
    /// when the path was not subscribed.
    pub fn unsubscribe(&self, path: &str) -> bool {
        let removed = self.lock().remove(path);
        match removed {
            Some(entry) => {
                close(&entry);
                debug!("unsubscribed from {path}");
                true
            }
            None => false,
        }
    }

    /// Like [`unsubscribe`](Self::unsubscribe), but only when `path` still
    /// holds the subscription `sender` was created for. A later subscription
    /// on the same path is left alone.
    pub fn release(&self, sender: &FrameSender) -> bool {
        let removed = {
            let mut entries = self.lock();
            let owned = entries
                .get(&sender.path)
                .is_some_and(|entry| entry.id == sender.id);
            if owned {
                entries.remove(&sender.path)
            } else {
                None
            }
        };
        match removed {
            Some(entry) => {
                close(&entry);
                debug!("released {}", sender.path);
                true
            }
            None => false,
        }
    }

    /// Closes every subscription.
    pub fn dispose(&self) {
        let entries: Vec<Entry> = self.lock().drain().map(|(_, entry)| entry).collect();
        if !entries.is_empty() {
            info!("closing {} live subscriptions", entries.len());
        }
        for entry in &entries {
            close(entry);
        }
    }
}

impl Entry {
    fn sender(&self, path: &str) -> FrameSender {
        FrameSender {
            path: path.to_string(),
            id: self.id,
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
            state: self.state.clone(),
        }
    }
}

fn close(entry: &Entry) {
    entry.state.set(SubscriptionState::Terminated);
    entry.cancel.cancel();
}

/// Forwards frames to `sink` until the channel closes or the subscription is
/// cancelled. A frame whose schema matches its predecessor is sent as a data
/// payload only. Frames already queued are sent before a cancellation is
/// honoured.
pub async fn dispatch<S>(
    mut rx: mpsc::Receiver<Frame>,
    mut sink: S,
    cancel: CancellationToken,
    path: String,
) where
    S: StreamSink,
{
    let mut previous: Option<FrameSchema> = None;
    loop {
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };
        let schema = frame.schema();
        let result = if previous.as_ref() == Some(&schema) {
            match serde_json::to_vec(&frame.data()) {
                Ok(payload) => sink.send_bytes(payload).await,
                Err(err) => Err(SinkError::Failed(format!("failed to encode frame: {err}"))),
            }
        } else {
            sink.send_frame(&frame).await
        };
        previous = Some(schema);

        if let Err(err) = result {
            if err.is_cancelled() {
                debug!("client has cancelled the stream {path}");
                break;
            }
            error!("failed to send frame for {path}: {err}");
        }
    }
    debug!("dispatcher for {path} stopped");
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::frame::{ParsedLogRecord, log_frame};

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Sent {
        Frame(Frame),
        Bytes(serde_json::Value),
    }

    /// Records everything it is sent; scripted failures are returned first.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingSink {
        pub(crate) sent: Arc<Mutex<Vec<Sent>>>,
        failures: Arc<Mutex<VecDeque<SinkError>>>,
    }

    impl RecordingSink {
        pub(crate) fn failing(failures: Vec<SinkError>) -> Self {
            Self {
                sent: Arc::default(),
                failures: Arc::new(Mutex::new(failures.into())),
            }
        }

        pub(crate) fn sent(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().clone()
        }

        fn next_failure(&self) -> Option<SinkError> {
            self.failures.lock().unwrap().pop_front()
        }
    }

    #[async_trait]
    impl StreamSink for RecordingSink {
        async fn send_frame(&mut self, frame: &Frame) -> Result<(), SinkError> {
            if let Some(err) = self.next_failure() {
                return Err(err);
            }
            self.sent.lock().unwrap().push(Sent::Frame(frame.clone()));
            Ok(())
        }

        async fn send_bytes(&mut self, payload: Vec<u8>) -> Result<(), SinkError> {
            if let Some(err) = self.next_failure() {
                return Err(err);
            }
            let value = serde_json::from_slice(&payload).unwrap();
            self.sent.lock().unwrap().push(Sent::Bytes(value));
            Ok(())
        }
    }

    fn line(message: &str, labels: &[(&str, &str)]) -> Frame {
        let record = ParsedLogRecord {
            message: Some(message.to_string()),
            timestamp: Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap()),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        log_frame([record], Utc.timestamp_opt(0, 0).unwrap())
    }

    #[test]
    fn registry_tracks_lifecycle() {
        let registry = SubscriptionRegistry::new();
        assert_eq!(registry.state("1/A"), SubscriptionState::Idle);

        let sender = registry.subscribe("1/A");
        assert_eq!(registry.state("1/A"), SubscriptionState::Subscribed);
        assert_eq!(registry.len(), 1);

        assert!(registry.unsubscribe("1/A"));
        assert!(!registry.unsubscribe("1/A"));
        assert_eq!(registry.state("1/A"), SubscriptionState::Idle);
        assert_eq!(sender.state(), SubscriptionState::Terminated);
        assert!(sender.is_closed());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn run_stream_requires_subscription() {
        let registry = SubscriptionRegistry::new();
        let err = registry
            .run_stream("1/A", RecordingSink::default())
            .unwrap_err();
        assert_eq!(err.to_string(), "failed to find the channel for the query: 1/A");

        registry.subscribe("1/A");
        let handle = registry.run_stream("1/A", RecordingSink::default()).unwrap();
        assert_eq!(registry.state("1/A"), SubscriptionState::Streaming);
        assert!(registry.run_stream("1/A", RecordingSink::default()).is_err());

        registry.dispose();
        handle.await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn sends_data_only_while_schema_is_unchanged() {
        let registry = SubscriptionRegistry::new();
        let sender = registry.subscribe("1/A");
        let sink = RecordingSink::default();
        let handle = registry.run_stream("1/A", sink.clone()).unwrap();

        assert!(sender.send(line("a", &[])).await);
        assert!(sender.send(line("b", &[("k", "v")])).await);
        registry.unsubscribe("1/A");
        handle.await.unwrap();

        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[0], Sent::Frame(_)));
        assert!(matches!(&sent[1], Sent::Bytes(payload) if payload["values"][1] == serde_json::json!(["b"])));
        assert_eq!(sender.state(), SubscriptionState::Terminated);
    }

    #[tokio::test]
    async fn dispatcher_switches_between_frames_and_payloads() {
        let (tx, rx) = mpsc::channel(4);
        let sink = RecordingSink::default();
        let first = line("a", &[]);
        let mut renamed = line("b", &[]);
        renamed.name = "other".to_string();

        tx.send(first.clone()).await.unwrap();
        tx.send(line("c", &[])).await.unwrap();
        tx.send(renamed.clone()).await.unwrap();
        drop(tx);
        dispatch(rx, sink.clone(), CancellationToken::new(), "1/A".into()).await;

        let sent = sink.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], Sent::Frame(first));
        assert!(matches!(&sent[1], Sent::Bytes(payload) if payload["values"][1] == serde_json::json!(["c"])));
        assert_eq!(sent[2], Sent::Frame(renamed));
    }

    #[tokio::test]
    async fn dispatcher_survives_send_failures_and_stops_on_cancel() {
        let (tx, rx) = mpsc::channel(4);
        let sink = RecordingSink::failing(vec![SinkError::Failed("socket hiccup".into())]);
        tx.send(line("a", &[])).await.unwrap();
        tx.send(line("b", &[])).await.unwrap();
        drop(tx);
        dispatch(rx, sink.clone(), CancellationToken::new(), "1/A".into()).await;
        // first send failed but the loop went on
        assert_eq!(sink.sent().len(), 1);

        let (tx, rx) = mpsc::channel(4);
        let sink = RecordingSink::failing(vec![SinkError::Failed(
            "rpc error: code = Canceled desc = context canceled".into(),
        )]);
        tx.send(line("a", &[])).await.unwrap();
        tx.send(line("b", &[])).await.unwrap();
        dispatch(rx, sink.clone(), CancellationToken::new(), "1/A".into()).await;
        assert!(sink.sent().is_empty());
        drop(tx);
    }

    #[tokio::test]
    async fn queued_frame_survives_unsubscribe() {
        for _ in 0..50 {
            let registry = SubscriptionRegistry::new();
            let sender = registry.subscribe("1/A");
            let sink = RecordingSink::default();
            let handle = registry.run_stream("1/A", sink.clone()).unwrap();

            assert!(sender.send(line("a", &[])).await);
            assert!(sender.send(line("b", &[])).await);
            drop(sender);
            registry.unsubscribe("1/A");
            handle.await.unwrap();
            assert_eq!(sink.sent().len(), 2);
        }
    }

    #[tokio::test]
    async fn duplicate_subscriber_leaves_live_stream_alone() {
        let registry = SubscriptionRegistry::new();
        let first = registry.subscribe("r/A");
        let sink = RecordingSink::default();
        let handle = registry.run_stream("r/A", sink.clone()).unwrap();

        let second = registry.subscribe("r/A");
        assert!(registry.run_stream("r/A", RecordingSink::default()).is_err());
        drop(second);
        assert_eq!(registry.state("r/A"), SubscriptionState::Streaming);
        assert!(!first.is_closed());
        assert!(first.send(line("a", &[])).await);

        assert!(registry.release(&first));
        handle.await.unwrap();
        assert_eq!(sink.sent().len(), 1);
    }

    #[test]
    fn release_ignores_newer_subscription_on_same_path() {
        let registry = SubscriptionRegistry::new();
        let stale = registry.subscribe("r/A");
        registry.dispose();
        let current = registry.subscribe("r/A");

        assert!(!registry.release(&stale));
        assert_eq!(registry.state("r/A"), SubscriptionState::Subscribed);
        assert!(!current.is_closed());

        assert!(registry.release(&current));
        assert_eq!(registry.state("r/A"), SubscriptionState::Idle);
        assert!(current.is_closed());
    }

    #[tokio::test]
    async fn sender_refuses_after_dispose() {
        let registry = SubscriptionRegistry::new();
        let sender = registry.subscribe("1/A");
        // capacity one: the first frame fills the channel
        assert!(sender.send(line("a", &[])).await);

        let blocked = {
            let sender = sender.clone();
            tokio::spawn(async move { sender.send(line("b", &[])).await })
        };
        registry.dispose();
        assert!(!blocked.await.unwrap());
        assert!(!sender.send(line("c", &[])).await);
    }
}
