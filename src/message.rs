// ABOUTME: Typed output messages (RECORD, STATE, LOG) and the ordered message stream
// ABOUTME: Serialized as newline-delimited JSON envelopes for the downstream writer

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::catalog::StreamDescriptor;
use crate::error::{Result, SourceError};
use crate::state::{CursorValue, FlushReceipt};
use crate::wal::{ChangeRecord, Lsn};

/// Source-defined key a consumer uses to merge per-stream outputs deterministically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderingKey {
    /// Incremental rows, ordered by cursor then sort key
    Cursor {
        value: CursorValue,
        key: Vec<serde_json::Value>,
    },
    /// Log changes: commit position then intra-transaction sequence
    LogPosition { lsn: Lsn, seq: u32 },
    /// Full-refresh and initial-scan rows, ordered by sort key
    SortKey { key: Vec<serde_json::Value> },
}

/// Payload of a RECORD message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordData {
    Change(ChangeRecord),
    Row(serde_json::Map<String, serde_json::Value>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMessage {
    pub stream: String,
    pub namespace: String,
    pub data: RecordData,
    /// Milliseconds since the Unix epoch
    pub emitted_at: i64,
    pub ordering_key: OrderingKey,
}

impl RecordMessage {
    pub fn new(stream: &StreamDescriptor, data: RecordData, ordering_key: OrderingKey) -> Self {
        Self {
            stream: stream.name.clone(),
            namespace: stream.namespace.clone(),
            data,
            emitted_at: chrono::Utc::now().timestamp_millis(),
            ordering_key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMessage {
    pub data: serde_json::Value,
}

impl From<&FlushReceipt> for StateMessage {
    fn from(receipt: &FlushReceipt) -> Self {
        Self {
            data: receipt.data().clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    pub level: LogLevel,
    pub message: String,
}

/// One element of the output sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum Message {
    Record { record: RecordMessage },
    State { state: StateMessage },
    Log { log: LogMessage },
}

impl Message {
    pub fn record(record: RecordMessage) -> Self {
        Message::Record { record }
    }

    pub fn state(receipt: &FlushReceipt) -> Self {
        Message::State {
            state: StateMessage::from(receipt),
        }
    }

    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Message::Log {
            log: LogMessage {
                level,
                message: message.into(),
            },
        }
    }

    pub fn is_record(&self) -> bool {
        matches!(self, Message::Record { .. })
    }

    pub fn is_state(&self) -> bool {
        matches!(self, Message::State { .. })
    }

    /// Single-line JSON, as written to stdout by the CLI
    pub fn to_json_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A message plus, for STATE, the flush sequence it certifies.
struct Envelope {
    message: Message,
    state_sequence: Option<u64>,
}

/// Producer half of the output sequence.
///
/// Sending awaits when the bounded channel is full, so a slow consumer stalls
/// the log reader instead of growing a buffer. A sent message is only queued;
/// [`MessageSink::delivered`] waits until the consumer is done with a STATE.
#[derive(Clone)]
pub struct MessageSink {
    tx: mpsc::Sender<Envelope>,
    delivered: watch::Receiver<u64>,
}

impl MessageSink {
    pub async fn send(&self, message: Message) -> Result<()> {
        self.enqueue(Envelope {
            message,
            state_sequence: None,
        })
        .await
    }

    /// Queue the STATE for a flushed checkpoint.
    pub async fn send_state(&self, receipt: &FlushReceipt) -> Result<()> {
        self.enqueue(Envelope {
            message: Message::state(receipt),
            state_sequence: Some(receipt.sequence()),
        })
        .await
    }

    async fn enqueue(&self, envelope: Envelope) -> Result<()> {
        self.tx.send(envelope).await.map_err(|_| SourceError::Cancelled)
    }

    /// Wait until the consumer has finished with the STATE sent for `receipt`.
    ///
    /// Fails with `Cancelled` when the consumer goes away first.
    pub async fn delivered(&self, receipt: &FlushReceipt) -> Result<()> {
        let sequence = receipt.sequence();
        let mut delivered = self.delivered.clone();
        delivered
            .wait_for(|confirmed| *confirmed >= sequence)
            .await
            .map(|_| ())
            .map_err(|_| SourceError::Cancelled)
    }

    pub async fn log(&self, level: LogLevel, message: impl Into<String>) -> Result<()> {
        self.send(Message::log(level, message)).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half: messages arrive exactly in emission order.
///
/// Asking for the next message confirms the previous one. A consumer must
/// finish durably handling a STATE (and every record before it) before it
/// calls [`MessageStream::next`] again; only then may the slot be
/// acknowledged up to that STATE.
pub struct MessageStream {
    rx: mpsc::Receiver<Envelope>,
    delivered: watch::Sender<u64>,
    unconfirmed: Option<u64>,
}

impl MessageStream {
    pub async fn next(&mut self) -> Option<Message> {
        if let Some(sequence) = self.unconfirmed.take() {
            self.delivered.send_replace(sequence);
        }
        let envelope = self.rx.recv().await?;
        self.unconfirmed = envelope.state_sequence;
        Some(envelope.message)
    }

    /// Drain every remaining message; the producer must finish for this to return.
    ///
    /// Each STATE counts as handled once the following message is taken.
    pub async fn collect(mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Some(message) = self.next().await {
            messages.push(message);
        }
        messages
    }
}

pub fn channel(capacity: usize) -> (MessageSink, MessageStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (confirm, delivered) = watch::channel(0);
    (
        MessageSink { tx, delivered },
        MessageStream {
            rx,
            delivered: confirm,
            unconfirmed: None,
        },
    )
}
