// ABOUTME: Log reader state machine over one replication connection
// ABOUTME: Reconnects with backoff from the confirmed position; acks only flushed state

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::time::{sleep, timeout_at, Instant};

use crate::config::LogReaderConfig;
use crate::error::{Result, SourceError};
use crate::slot::SlotHandle;
use crate::state::FlushReceipt;
use crate::utils::BackoffPolicy;
use crate::wal::change::CommittedTransaction;
use crate::wal::pgoutput::PgOutputDecoder;
use crate::wal::protocol::{parse_server_message, ServerMessage};
use crate::wal::Lsn;

/// Opens the CopyBoth replication stream for a slot.
#[async_trait]
pub trait ReplicationConnector: Send + Sync {
    async fn start_replication(
        &self,
        slot: &str,
        publication: &str,
        start: Lsn,
    ) -> Result<Box<dyn ReplicationStream>>;
}

/// An open replication stream.
///
/// `recv` must be cancel-safe: the reader races it against the status timer
/// and drops it when the timer wins.
#[async_trait]
pub trait ReplicationStream: Send {
    /// Next CopyData payload, or `None` when the server ended the copy
    async fn recv(&mut self) -> Result<Option<Bytes>>;

    /// Send a standby status update reporting `confirmed` as flushed
    async fn send_status(&mut self, confirmed: Lsn, reply_requested: bool) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    Transaction(CommittedTransaction),
    /// No data, but the server reports its current position
    Heartbeat { wal_end: Lsn, in_transaction: bool },
}

/// Single consumer of a replication slot.
///
/// Owns the [`SlotHandle`] for its lifetime, so no second reader can stream
/// the same slot from this process.
pub struct LogReader {
    connector: Arc<dyn ReplicationConnector>,
    slot: SlotHandle,
    publication: String,
    keepalive_interval: std::time::Duration,
    idle_timeout: std::time::Duration,
    backoff: BackoffPolicy,
    state: ConnectionState,
    stream: Option<Box<dyn ReplicationStream>>,
    decoder: PgOutputDecoder,
    confirmed: Lsn,
    next_status_at: Instant,
    last_activity: Instant,
    failed_attempts: u32,
    reconnects: u32,
}

impl LogReader {
    /// Create a reader that will resume streaming at `start`.
    ///
    /// `start` must be a position already made durable downstream.
    pub fn new(
        connector: Arc<dyn ReplicationConnector>,
        slot: SlotHandle,
        publication: impl Into<String>,
        config: &LogReaderConfig,
        start: Lsn,
    ) -> Self {
        Self {
            connector,
            slot,
            publication: publication.into(),
            keepalive_interval: config.keepalive_interval(),
            idle_timeout: config.idle_timeout(),
            backoff: config.backoff(),
            state: ConnectionState::Disconnected,
            stream: None,
            decoder: PgOutputDecoder::new(),
            confirmed: start,
            next_status_at: Instant::now(),
            last_activity: Instant::now(),
            failed_attempts: 0,
            reconnects: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Last position acknowledged to the server
    pub fn confirmed_position(&self) -> Lsn {
        self.confirmed
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    pub fn slot(&self) -> &SlotHandle {
        &self.slot
    }

    /// Wait for the next committed transaction or server heartbeat.
    pub async fn next_event(&mut self) -> Result<LogEvent> {
        loop {
            if let Some(event) = self.next_event_before(None).await? {
                return Ok(event);
            }
        }
    }

    /// Like [`LogReader::next_event`], but returns `None` once `deadline`
    /// passes.
    ///
    /// Only the cancel-safe frame read races the deadline; a status update
    /// that has started is always written in full.
    pub async fn next_event_before(&mut self, deadline: Option<Instant>) -> Result<Option<LogEvent>> {
        loop {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(None);
            }
            if self.state == ConnectionState::Closed {
                return Err(SourceError::transient(format!(
                    "log reader for slot '{}' is closed",
                    self.slot.name()
                )));
            }
            if self.stream.is_none() {
                self.connect().await?;
            }

            let status_due = self.next_status_at;
            let idle = self.idle_timeout;
            let idle_deadline = self.last_activity + idle;
            let received = match self.stream.as_mut() {
                Some(stream) => {
                    tokio::select! {
                        biased;
                        _ = until(deadline) => return Ok(None),
                        _ = tokio::time::sleep_until(status_due) => None,
                        frame = timeout_at(idle_deadline, stream.recv()) => Some(frame),
                    }
                }
                None => continue,
            };

            let frame = match received {
                None => match self.send_status(false).await {
                    Ok(()) => continue,
                    Err(e) => Err(e),
                },
                Some(Err(_)) => Err(SourceError::transient(format!(
                    "no data or keepalive from server for {:?}",
                    idle
                ))),
                Some(Ok(result)) => result,
            };

            let payload = match frame {
                Ok(Some(payload)) => {
                    self.last_activity = Instant::now();
                    payload
                }
                Ok(None) => {
                    self.disconnected(SourceError::transient("server ended the replication stream"))
                        .await?;
                    continue;
                }
                Err(e) if e.is_transient() => {
                    self.disconnected(e).await?;
                    continue;
                }
                Err(e) => {
                    self.close_with(&e);
                    return Err(e);
                }
            };

            match self.handle_payload(payload).await {
                Ok(Some(event)) => return Ok(Some(event)),
                Ok(None) => continue,
                Err(e) if e.is_transient() => {
                    self.disconnected(e).await?;
                }
                Err(e) => {
                    self.close_with(&e);
                    return Err(e);
                }
            }
        }
    }

    async fn handle_payload(&mut self, payload: Bytes) -> Result<Option<LogEvent>> {
        match parse_server_message(payload)? {
            ServerMessage::XLogData { data, .. } => {
                let committed = self.decoder.decode(&data)?;
                self.failed_attempts = 0;
                Ok(committed.map(LogEvent::Transaction))
            }
            ServerMessage::PrimaryKeepalive {
                wal_end,
                reply_requested,
                ..
            } => {
                if reply_requested {
                    self.send_status(false).await?;
                }
                self.failed_attempts = 0;
                Ok(Some(LogEvent::Heartbeat {
                    wal_end,
                    in_transaction: self.decoder.in_transaction(),
                }))
            }
        }
    }

    /// Report the receipt's log position as flushed.
    ///
    /// A receipt only exists once [`StateManager::flush`](crate::state::StateManager::flush)
    /// succeeded. Callers hand it over only after the downstream consumer has
    /// handled the matching STATE (see [`MessageSink::delivered`](crate::message::MessageSink::delivered)).
    pub async fn acknowledge(&mut self, receipt: &FlushReceipt) -> Result<()> {
        let Some(lsn) = receipt.log_position() else {
            return Ok(());
        };
        if lsn <= self.confirmed {
            return Ok(());
        }
        self.confirmed = lsn;
        tracing::debug!("Acknowledging {} on slot '{}'", lsn, self.slot.name());
        if self.stream.is_some() {
            if let Err(e) = self.send_status(false).await {
                if !e.is_transient() {
                    return Err(e);
                }
                tracing::warn!(
                    "Could not send acknowledgement for {}: {}. It is resent after reconnect.",
                    lsn,
                    e
                );
                self.drop_connection();
            }
        }
        Ok(())
    }

    /// Close the connection and hand back the slot lease.
    pub fn close(mut self) -> SlotHandle {
        self.drop_connection();
        self.state = ConnectionState::Closed;
        tracing::info!(
            "Closed log reader for slot '{}' at confirmed position {}",
            self.slot.name(),
            self.confirmed
        );
        self.slot
    }

    async fn send_status(&mut self, reply_requested: bool) -> Result<()> {
        self.next_status_at = Instant::now() + self.keepalive_interval;
        match self.stream.as_mut() {
            Some(stream) => stream.send_status(self.confirmed, reply_requested).await,
            None => Ok(()),
        }
    }

    async fn connect(&mut self) -> Result<()> {
        loop {
            self.state = if self.reconnects == 0 && self.failed_attempts == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            };
            tracing::info!(
                "Starting replication on slot '{}' from {}",
                self.slot.name(),
                self.confirmed
            );
            match self
                .connector
                .start_replication(self.slot.name(), &self.publication, self.confirmed)
                .await
            {
                Ok(stream) => {
                    self.stream = Some(stream);
                    self.state = ConnectionState::Streaming;
                    self.next_status_at = Instant::now() + self.keepalive_interval;
                    self.last_activity = Instant::now();
                    return Ok(());
                }
                Err(e) if e.is_transient() => self.backoff_or_fail(e).await?,
                Err(e) => {
                    self.close_with(&e);
                    return Err(e);
                }
            }
        }
    }

    async fn disconnected(&mut self, error: SourceError) -> Result<()> {
        tracing::warn!(
            "Replication connection for slot '{}' lost: {}",
            self.slot.name(),
            error
        );
        self.drop_connection();
        self.reconnects += 1;
        self.backoff_or_fail(error).await
    }

    async fn backoff_or_fail(&mut self, error: SourceError) -> Result<()> {
        if self.failed_attempts >= self.backoff.max_retries {
            self.close_with(&error);
            return Err(error);
        }
        let delay = self.backoff.delay_for(self.failed_attempts);
        self.failed_attempts += 1;
        self.state = ConnectionState::Reconnecting;
        tracing::warn!(
            "Reconnecting to slot '{}' in {:?} (attempt {}/{}), resuming from {}",
            self.slot.name(),
            delay,
            self.failed_attempts,
            self.backoff.max_retries,
            self.confirmed
        );
        sleep(delay).await;
        Ok(())
    }

    fn drop_connection(&mut self) {
        self.stream = None;
        self.decoder.reset();
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Disconnected;
        }
    }

    fn close_with(&mut self, error: &SourceError) {
        tracing::error!("Log reader for slot '{}' stopped: {}", self.slot.name(), error.report());
        self.drop_connection();
        self.state = ConnectionState::Closed;
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
