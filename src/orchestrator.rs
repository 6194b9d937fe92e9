// ABOUTME: Record Emitter / Orchestrator: drives each stream from snapshot to streaming to done
// ABOUTME: Merges snapshot and log output into one message sequence; flushes state before acking the slot

use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::catalog::{ConfiguredCatalog, ConfiguredStream, StreamDescriptor, SyncMode};
use crate::config::{CheckpointConfig, SourceConfig};
use crate::error::{Result, SourceError};
use crate::message::{self, LogLevel, Message, MessageSink, MessageStream, OrderingKey, RecordData, RecordMessage};
use crate::postgres::connect_with_retry;
use crate::slot::{PgSlotCatalog, SlotCatalog, SlotHandle, SlotManager};
use crate::snapshot::{PgTableSource, ScanMode, ScanPlan, SnapshotReader, TableSource};
use crate::state::{CursorState, CursorValue, FlushReceipt, SnapshotProgress, StateManager};
use crate::wal::{CommittedTransaction, LogEvent, LogReader, Lsn, PgReplicationConnector, ReplicationConnector};

/// Per-stream lifecycle within one sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamStatus {
    #[default]
    NotStarted,
    Snapshotting,
    Streaming,
    /// Streaming, with everything emitted so far flushed
    Checkpointed,
    Done,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub status: StreamStatus,
    pub records: u64,
}

/// Statistics from one sync run.
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    pub streams: BTreeMap<StreamDescriptor, StreamSummary>,
    pub records_emitted: u64,
    pub checkpoints: u64,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl SyncSummary {
    /// Check if every stream finished without errors.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn records_for(&self, stream: &StreamDescriptor) -> u64 {
        self.streams.get(stream).map(|s| s.records).unwrap_or(0)
    }
}

/// The three points where the engine touches the source database.
#[derive(Clone)]
pub struct SourceSeams {
    pub slots: Arc<dyn SlotCatalog>,
    pub tables: Arc<dyn TableSource>,
    pub replication: Arc<dyn ReplicationConnector>,
}

impl SourceSeams {
    /// PostgreSQL implementations sharing one control connection.
    pub async fn connect(config: &SourceConfig) -> Result<Self> {
        let client = Arc::new(connect_with_retry(&config.url).await?);
        Ok(Self {
            slots: Arc::new(PgSlotCatalog::new(client.clone())),
            tables: Arc::new(PgTableSource::new(client)),
            replication: Arc::new(PgReplicationConnector::new(&config.url)?),
        })
    }
}

#[derive(Default)]
struct StatusBoard {
    streams: StdMutex<BTreeMap<StreamDescriptor, StreamSummary>>,
}

impl StatusBoard {
    fn new(streams: &[ScanPlan]) -> Self {
        let board = Self::default();
        {
            let mut map = board.lock();
            for plan in streams {
                map.insert(plan.stream.clone(), StreamSummary::default());
            }
        }
        board
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<StreamDescriptor, StreamSummary>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, stream: &StreamDescriptor, status: StreamStatus) {
        let mut map = self.lock();
        let entry = map.entry(stream.clone()).or_default();
        if entry.status != status {
            tracing::debug!("{}: {:?} -> {:?}", stream, entry.status, status);
            entry.status = status;
        }
    }

    fn add_records(&self, stream: &StreamDescriptor, count: u64) {
        self.lock().entry(stream.clone()).or_default().records += count;
    }

    fn records(&self, stream: &StreamDescriptor) -> u64 {
        self.lock().get(stream).map(|s| s.records).unwrap_or(0)
    }

    fn snapshot(&self) -> BTreeMap<StreamDescriptor, StreamSummary> {
        self.lock().clone()
    }
}

/// Decides when emitted output is checkpointed: after N records or T elapsed.
struct CheckpointTrigger {
    every_records: u64,
    interval: Option<Duration>,
    records: u64,
    dirty: bool,
    last: Instant,
}

impl CheckpointTrigger {
    fn new(config: &CheckpointConfig) -> Self {
        Self {
            every_records: config.every_records,
            interval: config.interval(),
            records: 0,
            dirty: false,
            last: Instant::now(),
        }
    }

    fn record(&mut self, count: u64) {
        self.records += count;
        self.dirty = true;
    }

    fn is_due(&self) -> bool {
        if !self.dirty {
            return false;
        }
        let by_count = self.every_records > 0 && self.records >= self.every_records;
        let by_time = self.interval.is_some_and(|i| self.last.elapsed() >= i);
        by_count || by_time
    }

    fn reset(&mut self) {
        self.records = 0;
        self.dirty = false;
        self.last = Instant::now();
    }
}

/// Runs one sync: every configured stream, in its configured mode.
pub struct Orchestrator {
    config: SourceConfig,
    catalog: ConfiguredCatalog,
    seams: SourceSeams,
    slots: SlotManager,
    snapshot: SnapshotReader,
}

impl Orchestrator {
    pub fn new(config: SourceConfig, catalog: ConfiguredCatalog, seams: SourceSeams) -> Self {
        let slots = SlotManager::new(seams.slots.clone(), config.replication.auto_create);
        let snapshot = SnapshotReader::new(seams.tables.clone(), config.snapshot.page_size);
        Self {
            config,
            catalog,
            seams,
            slots,
            snapshot,
        }
    }

    /// Run on a background task, returning the consumer side of the output.
    pub fn spawn(
        self,
        state: StateManager,
        shutdown: broadcast::Receiver<()>,
    ) -> (MessageStream, JoinHandle<Result<SyncSummary>>) {
        let (sink, messages) = message::channel(self.config.output.channel_capacity);
        let handle = tokio::spawn(async move { self.run(state, sink, shutdown).await });
        (messages, handle)
    }

    /// Drive the sync to completion, emitting into `sink`.
    ///
    /// Configuration, permission and slot-busy errors are returned before
    /// any record is emitted. A shutdown signal stops the run between
    /// messages; the slot is left at the last flushed checkpoint.
    pub async fn run(
        &self,
        state: StateManager,
        sink: MessageSink,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<SyncSummary> {
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => {
                tracing::info!("Shutdown signal received, stopping sync at the last checkpoint");
                Err(SourceError::Cancelled)
            }
            result = self.sync(state, &sink, started) => result,
        };
        if let Err(e) = &result {
            if !matches!(e, SourceError::Cancelled) {
                tracing::error!("Sync failed: {}", e.report());
                let _ = sink.log(LogLevel::Error, format!("Sync failed: {}", e.report())).await;
            }
        }
        result
    }

    async fn sync(&self, mut state: StateManager, sink: &MessageSink, started: Instant) -> Result<SyncSummary> {
        sink.log(LogLevel::Info, "Starting sync").await?;
        self.catalog.validate()?;

        let slot = if self.catalog.has_cdc() {
            Some(self.prepare_cdc().await?)
        } else {
            None
        };
        let plans = self.plan_streams(&mut state).await?;

        let (cdc_plans, table_plans): (Vec<ScanPlan>, Vec<ScanPlan>) = plans
            .into_iter()
            .partition(|p| p.mode == ScanMode::CdcInitial);
        let mut all = cdc_plans.clone();
        all.extend(table_plans.iter().cloned());
        let board = StatusBoard::new(&all);
        let state = Mutex::new(state);

        let table_work = async {
            stream::iter(table_plans)
                .map(|plan| {
                    let stream = plan.stream.clone();
                    let (state, board) = (&state, &board);
                    async move {
                        let result = self.run_table_stream(plan, state, sink, board).await;
                        self.scoped(std::slice::from_ref(&stream), result, board, sink).await
                    }
                })
                .buffer_unordered(self.config.snapshot.max_concurrent_streams)
                .collect::<Vec<Result<Option<String>>>>()
                .await
        };
        let cdc_work = async {
            match slot {
                Some(slot) => {
                    let streams: Vec<StreamDescriptor> = cdc_plans.iter().map(|p| p.stream.clone()).collect();
                    let result = self.run_cdc(slot, cdc_plans, &state, sink, &board).await;
                    self.scoped(&streams, result, &board, sink).await
                }
                None => Ok(None),
            }
        };
        let (table_results, cdc_result) = tokio::join!(table_work, cdc_work);

        let mut errors = Vec::new();
        for result in table_results.into_iter().chain(std::iter::once(cdc_result)) {
            if let Some(error) = result? {
                errors.push(error);
            }
        }

        let streams = board.snapshot();
        let summary = SyncSummary {
            records_emitted: streams.values().map(|s| s.records).sum(),
            streams,
            checkpoints: state.lock().await.flush_count(),
            errors,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            "Sync finished: {} stream(s), {} records, {} checkpoint(s), {} error(s) in {}ms",
            summary.streams.len(),
            summary.records_emitted,
            summary.checkpoints,
            summary.errors.len(),
            summary.duration_ms
        );
        sink.log(LogLevel::Info, "Finished sync").await?;
        Ok(summary)
    }

    /// Slot, publication and replica identity checks for CDC streams.
    async fn prepare_cdc(&self) -> Result<SlotHandle> {
        let replication = &self.config.replication;
        let tables: Vec<StreamDescriptor> = self.catalog.cdc_streams().map(|s| s.stream.clone()).collect();
        let slot = self
            .slots
            .verify_or_create(&replication.slot_name, &replication.plugin)
            .await?;
        self.slots
            .ensure_publication_covers(&replication.publication, &tables)
            .await?;
        for table in &tables {
            self.slots.ensure_replica_identity(table).await?;
        }
        Ok(slot)
    }

    /// Resolve every stream's scan before anything is emitted. Stored
    /// positions that do not fit the configured mode are reset only once
    /// all plans succeeded.
    async fn plan_streams(&self, state: &mut StateManager) -> Result<Vec<ScanPlan>> {
        let mut plans = Vec::with_capacity(self.catalog.streams.len());
        let mut resets = Vec::new();
        for configured in &self.catalog.streams {
            let stored = state.cursor(&configured.stream);
            if !position_fits(configured, stored) {
                resets.push(configured.stream.clone());
            }
            let stored_cursor = match stored {
                Some(CursorState::Cursor { field, value })
                    if configured.cursor_field.as_deref() == Some(field.as_str()) =>
                {
                    Some(value.clone())
                }
                _ => None,
            };
            plans.push(self.snapshot.plan(configured, stored_cursor).await?);
        }
        for stream in resets {
            state.reset_stream(&stream);
        }
        Ok(plans)
    }

    /// Turn a stream-scoped failure into a summary error; only cancellation
    /// aborts the whole sync.
    async fn scoped(
        &self,
        streams: &[StreamDescriptor],
        result: Result<()>,
        board: &StatusBoard,
        sink: &MessageSink,
    ) -> Result<Option<String>> {
        match result {
            Ok(()) => Ok(None),
            Err(SourceError::Cancelled) => Err(SourceError::Cancelled),
            Err(e) => {
                let names = streams.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(", ");
                let message = format!("Failed to sync {}: {}", names, e.report());
                tracing::error!("{}", message);
                for stream in streams {
                    board.transition(stream, StreamStatus::Failed);
                }
                sink.log(LogLevel::Error, message.clone()).await?;
                Ok(Some(message))
            }
        }
    }

    /// Run `update`, flush, then queue the STATE, all under the state lock so
    /// STATE messages leave in flush order.
    async fn flush_and_emit<F>(&self, state: &Mutex<StateManager>, sink: &MessageSink, update: F) -> Result<FlushReceipt>
    where
        F: FnOnce(&mut StateManager),
    {
        let mut guard = state.lock().await;
        update(&mut guard);
        let receipt = guard.flush().await?;
        sink.send_state(&receipt).await?;
        Ok(receipt)
    }

    async fn emit_row(&self, sink: &MessageSink, stream: &StreamDescriptor, row: RecordData, key: OrderingKey) -> Result<()> {
        sink.send(Message::record(RecordMessage::new(stream, row, key))).await
    }

    async fn run_table_stream(
        &self,
        plan: ScanPlan,
        state: &Mutex<StateManager>,
        sink: &MessageSink,
        board: &StatusBoard,
    ) -> Result<()> {
        let stream = plan.stream.clone();
        board.transition(&stream, StreamStatus::Snapshotting);
        let cursor_field = match &plan.mode {
            ScanMode::Incremental { cursor_field, .. } => Some(cursor_field.clone()),
            _ => None,
        };
        let resume_after = match cursor_field {
            Some(_) => None,
            None => state
                .lock()
                .await
                .stream_state(&stream)
                .and_then(|s| s.snapshot.as_ref())
                .and_then(|p| p.last_key.clone()),
        };
        if resume_after.is_some() {
            tracing::info!("Resuming interrupted full refresh of {}", stream);
        }

        let mut scan = self.snapshot.scan(plan, resume_after);
        let mut trigger = CheckpointTrigger::new(&self.config.checkpoint);
        while let Some(page) = scan.next_page().await? {
            let count = page.rows.len() as u64;
            for row in page.rows {
                self.emit_row(sink, &stream, RecordData::Row(row.data), row.ordering_key).await?;
            }
            board.add_records(&stream, count);
            trigger.record(count);

            match &cursor_field {
                Some(field) => {
                    if let Some(value) = page.checkpoint {
                        self.checkpoint_cursor(state, sink, &stream, field, value).await?;
                        trigger.reset();
                    }
                }
                None if !page.is_last && trigger.is_due() => {
                    let progress = SnapshotProgress {
                        last_key: page.last_key,
                        resume_lsn: None,
                    };
                    self.flush_and_emit(state, sink, |s| s.record_snapshot_progress(&stream, progress))
                        .await?;
                    trigger.reset();
                }
                None => {}
            }
        }

        let full_refresh = cursor_field.is_none();
        self.flush_and_emit(state, sink, |s| {
            if full_refresh {
                s.complete_snapshot(&stream);
            }
        })
        .await?;
        self.finish_stream(sink, board, &stream).await
    }

    async fn checkpoint_cursor(
        &self,
        state: &Mutex<StateManager>,
        sink: &MessageSink,
        stream: &StreamDescriptor,
        field: &str,
        value: CursorValue,
    ) -> Result<()> {
        self.flush_and_emit(state, sink, |s| {
            s.checkpoint(stream, CursorState::cursor(field, value));
        })
        .await?;
        Ok(())
    }

    async fn finish_stream(&self, sink: &MessageSink, board: &StatusBoard, stream: &StreamDescriptor) -> Result<()> {
        board.transition(stream, StreamStatus::Done);
        let records = board.records(stream);
        tracing::info!("Read {} records from {} stream", records, stream);
        sink.log(LogLevel::Info, format!("Read {} records from {} stream", records, stream.name))
            .await
    }

    /// Initial passes for CDC streams without a log position, then one
    /// sequential log consumer for all CDC streams on the slot.
    async fn run_cdc(
        &self,
        slot: SlotHandle,
        plans: Vec<ScanPlan>,
        state: &Mutex<StateManager>,
        sink: &MessageSink,
        board: &StatusBoard,
    ) -> Result<()> {
        let streams: Vec<StreamDescriptor> = plans.iter().map(|p| p.stream.clone()).collect();
        for plan in plans {
            let has_position = state
                .lock()
                .await
                .cursor(&plan.stream)
                .and_then(CursorState::as_lsn)
                .is_some();
            if !has_position {
                self.initial_pass(plan, state, sink, board).await?;
            }
        }

        let mut positions = BTreeMap::new();
        let start = {
            let guard = state.lock().await;
            for stream in &streams {
                if let Some(lsn) = guard.cursor(stream).and_then(CursorState::as_lsn) {
                    positions.insert(stream.clone(), lsn);
                }
            }
            guard
                .state()
                .log_position
                .or(slot.confirmed_flush())
                .unwrap_or(Lsn::ZERO)
        };
        for stream in &streams {
            board.transition(stream, StreamStatus::Streaming);
        }

        let target = self.snapshot.current_wal_lsn().await?;
        let max_streaming = self.config.log_reader.max_streaming();
        tracing::info!(
            "Streaming {} CDC stream(s) from {} (server at {})",
            streams.len(),
            start,
            target
        );

        let mut log = LogStreamer {
            positions,
            pending: None,
            trigger: CheckpointTrigger::new(&self.config.checkpoint),
        };
        if max_streaming.is_none() && start >= target {
            tracing::info!("Slot '{}' is already caught up at {}", slot.name(), start);
            self.flush_and_emit(state, sink, |_| {}).await?;
        } else {
            let mut reader = LogReader::new(
                self.seams.replication.clone(),
                slot,
                self.config.replication.publication.clone(),
                &self.config.log_reader,
                start,
            );
            let deadline = max_streaming.map(|d| Instant::now() + d);
            self.stream_log(&mut reader, &mut log, target, deadline, state, sink, board)
                .await?;
            match log.pending.take() {
                Some(lsn) => self.checkpoint_log(&mut reader, &mut log, lsn, state, sink).await?,
                None => {
                    self.flush_and_emit(state, sink, |_| {}).await?;
                }
            }
            reader.close();
        }

        for stream in &streams {
            self.finish_stream(sink, board, stream).await?;
        }
        Ok(())
    }

    /// Scan one CDC table, recording the log position visible before the
    /// scan so streaming resumes from there.
    async fn initial_pass(
        &self,
        plan: ScanPlan,
        state: &Mutex<StateManager>,
        sink: &MessageSink,
        board: &StatusBoard,
    ) -> Result<()> {
        let stream = plan.stream.clone();
        board.transition(&stream, StreamStatus::Snapshotting);
        let progress = state
            .lock()
            .await
            .stream_state(&stream)
            .and_then(|s| s.snapshot.clone());
        let (resume_lsn, resume_after) = match progress {
            Some(SnapshotProgress {
                resume_lsn: Some(lsn),
                last_key,
            }) => {
                tracing::info!("Resuming initial scan of {} (log position {})", stream, lsn);
                (lsn, last_key)
            }
            _ => {
                let lsn = self.snapshot.current_wal_lsn().await?;
                tracing::info!("Initial scan of {} starts at log position {}", stream, lsn);
                let progress = SnapshotProgress {
                    last_key: None,
                    resume_lsn: Some(lsn),
                };
                self.flush_and_emit(state, sink, |s| s.record_snapshot_progress(&stream, progress))
                    .await?;
                (lsn, None)
            }
        };

        let mut scan = self.snapshot.scan(plan, resume_after);
        let mut trigger = CheckpointTrigger::new(&self.config.checkpoint);
        while let Some(page) = scan.next_page().await? {
            let count = page.rows.len() as u64;
            for row in page.rows {
                self.emit_row(sink, &stream, RecordData::Row(row.data), row.ordering_key).await?;
            }
            board.add_records(&stream, count);
            trigger.record(count);
            if !page.is_last && trigger.is_due() {
                let progress = SnapshotProgress {
                    last_key: page.last_key,
                    resume_lsn: Some(resume_lsn),
                };
                self.flush_and_emit(state, sink, |s| s.record_snapshot_progress(&stream, progress))
                    .await?;
                trigger.reset();
            }
        }

        self.flush_and_emit(state, sink, |s| {
            s.checkpoint(&stream, CursorState::log_position(resume_lsn));
            s.complete_snapshot(&stream);
        })
        .await?;
        tracing::info!(
            "Initial scan of {} done: {} records, streaming from {}",
            stream,
            board.records(&stream),
            resume_lsn
        );
        Ok(())
    }

    /// Consume the log until caught up with `target` or past `deadline`.
    #[allow(clippy::too_many_arguments)]
    async fn stream_log(
        &self,
        reader: &mut LogReader,
        log: &mut LogStreamer,
        target: Lsn,
        deadline: Option<Instant>,
        state: &Mutex<StateManager>,
        sink: &MessageSink,
        board: &StatusBoard,
    ) -> Result<()> {
        let max_unacknowledged = self.config.checkpoint.max_unacknowledged_bytes;
        loop {
            let Some(event) = reader.next_event_before(deadline).await? else {
                tracing::info!("Reached max streaming duration");
                return Ok(());
            };

            let caught_up = match event {
                LogEvent::Transaction(txn) => {
                    let end_lsn = txn.end_lsn;
                    let emitted = self.emit_transaction(txn, &log.positions, sink, board).await?;
                    if end_lsn > reader.confirmed_position() {
                        log.pending = Some(end_lsn);
                    }
                    log.trigger.record(emitted);
                    if emitted > 0 {
                        for stream in log.positions.keys() {
                            board.transition(stream, StreamStatus::Streaming);
                        }
                    }
                    deadline.is_none() && end_lsn >= target
                }
                LogEvent::Heartbeat {
                    wal_end,
                    in_transaction,
                } => deadline.is_none() && !in_transaction && wal_end >= target,
            };

            if let Some(lsn) = log.pending {
                let span = lsn.distance_from(reader.confirmed_position());
                let over_window = max_unacknowledged > 0 && span >= max_unacknowledged;
                if caught_up || over_window || log.trigger.is_due() {
                    log.pending = None;
                    self.checkpoint_log(reader, log, lsn, state, sink).await?;
                    for stream in log.positions.keys() {
                        board.transition(stream, StreamStatus::Checkpointed);
                    }
                }
            }
            if caught_up {
                tracing::info!("Caught up with server position {}", target);
                return Ok(());
            }
        }
    }

    /// Emit a committed transaction's changes for configured streams whose
    /// stored position it is past. Returns the number of records emitted.
    async fn emit_transaction(
        &self,
        txn: CommittedTransaction,
        positions: &BTreeMap<StreamDescriptor, Lsn>,
        sink: &MessageSink,
        board: &StatusBoard,
    ) -> Result<u64> {
        let mut emitted = 0u64;
        for (seq, change) in txn.changes.into_iter().enumerate() {
            let stream = change.stream().clone();
            match positions.get(&stream) {
                Some(position) if txn.end_lsn > *position => {}
                Some(_) => continue,
                None => {
                    tracing::debug!("Skipping change for unselected table {}", stream);
                    continue;
                }
            }
            let key = OrderingKey::LogPosition {
                lsn: txn.commit_lsn,
                seq: seq as u32,
            };
            self.emit_row(sink, &stream, RecordData::Change(change), key).await?;
            board.add_records(&stream, 1);
            emitted += 1;
        }
        Ok(emitted)
    }

    /// Checkpoint every CDC stream at `lsn`, flush and emit the STATE, then
    /// ack once the consumer has handled that STATE.
    async fn checkpoint_log(
        &self,
        reader: &mut LogReader,
        log: &mut LogStreamer,
        lsn: Lsn,
        state: &Mutex<StateManager>,
        sink: &MessageSink,
    ) -> Result<()> {
        let positions = &log.positions;
        let receipt = self
            .flush_and_emit(state, sink, |s| {
                for (stream, position) in positions {
                    if lsn > *position {
                        s.checkpoint(stream, CursorState::log_position(lsn));
                    }
                }
                s.set_log_position(lsn);
            })
            .await?;
        for position in log.positions.values_mut() {
            if lsn > *position {
                *position = lsn;
            }
        }
        log.trigger.reset();
        sink.delivered(&receipt).await?;
        reader.acknowledge(&receipt).await
    }
}

struct LogStreamer {
    positions: BTreeMap<StreamDescriptor, Lsn>,
    /// End of the last consumed transaction not yet checkpointed
    pending: Option<Lsn>,
    trigger: CheckpointTrigger,
}

/// Whether a stored position can be resumed under the configured mode.
fn position_fits(configured: &ConfiguredStream, stored: Option<&CursorState>) -> bool {
    match (configured.sync_mode, stored) {
        (_, None) | (SyncMode::FullRefresh, _) => true,
        (SyncMode::Incremental, Some(CursorState::Cursor { field, .. })) => {
            configured.cursor_field.as_deref() == Some(field.as_str())
        }
        (SyncMode::Cdc, Some(CursorState::LogPosition { .. })) => true,
        _ => false,
    }
}

async fn wait_for_shutdown(shutdown: &mut broadcast::Receiver<()>) {
    match shutdown.recv().await {
        Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {}
        // Sender gone: nobody can ask for shutdown any more.
        Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
    }
}
