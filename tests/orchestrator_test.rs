// ABOUTME: End-to-end sync tests over in-memory slot, table and replication fakes
// ABOUTME: Covers each sync mode, resume from STATE, CDC handoff, cancellation and failure scoping

mod common;

use common::wire::{self, t1_relation, INT4, TEXT};
use common::{
    records, row, seams, states, stream_entry, test_config, EventLog, FakeConnector, FakeSlotCatalog,
    FakeTableSource, RecordingStore, Step,
};
use database_extractor::catalog::{ConfiguredCatalog, ConfiguredStream, StreamDescriptor, SyncMode};
use database_extractor::config::SourceConfig;
use database_extractor::message::{LogLevel, Message, MessageStream, OrderingKey, RecordData, RecordMessage};
use database_extractor::slot::ReplicaIdentity;
use database_extractor::state::StateManager;
use database_extractor::wal::{Lsn, Operation};
use database_extractor::{Orchestrator, SourceError, StreamStatus, SyncSummary};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const SLOT_CONFIRMED: u64 = 0x100;
const P0: u64 = 0x500;

fn t1() -> StreamDescriptor {
    StreamDescriptor::new("public", "t1")
}

fn t2() -> StreamDescriptor {
    StreamDescriptor::new("public", "t2")
}

struct Harness {
    config: SourceConfig,
    slots: Arc<FakeSlotCatalog>,
    tables: Arc<FakeTableSource>,
    log: EventLog,
    connector: FakeConnector,
    store: Arc<RecordingStore>,
}

impl Harness {
    fn new() -> Self {
        let log = EventLog::default();
        Self {
            config: test_config(),
            slots: Arc::new(replication_ready_catalog()),
            tables: Arc::new(source_tables()),
            connector: FakeConnector::new(log.clone()),
            store: Arc::new(RecordingStore::new(log.clone())),
            log,
        }
    }

    fn with_sessions(mut self, f: impl FnOnce(FakeConnector) -> FakeConnector) -> Self {
        self.connector = f(self.connector);
        self
    }

    /// Start the sync without reading any output. The shutdown sender is
    /// dropped, which never cancels the run.
    fn spawn(
        self,
        catalog: Vec<ConfiguredStream>,
        prior: Option<&str>,
    ) -> (MessageStream, JoinHandle<Result<SyncSummary, SourceError>>, EventLog) {
        let state = StateManager::load(prior, self.store.clone()).unwrap();
        let orchestrator = Orchestrator::new(
            self.config,
            ConfiguredCatalog::new(catalog),
            seams(self.slots.clone(), self.tables.clone(), Arc::new(self.connector)),
        );
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (messages, handle) = orchestrator.spawn(state, shutdown_rx);
        (messages, handle, self.log)
    }

    async fn run(self, catalog: Vec<ConfiguredStream>, prior: Option<&str>) -> Outcome {
        let state = StateManager::load(prior, self.store.clone()).unwrap();
        let orchestrator = Orchestrator::new(
            self.config,
            ConfiguredCatalog::new(catalog),
            seams(self.slots.clone(), self.tables.clone(), Arc::new(self.connector)),
        );
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (messages, handle) = orchestrator.spawn(state, shutdown_rx);
        let messages = messages.collect().await;
        let result = handle.await.unwrap();
        Outcome {
            result,
            messages,
            log: self.log,
            store: self.store,
            slots: self.slots,
            tables: self.tables,
        }
    }
}

struct Outcome {
    result: Result<SyncSummary, SourceError>,
    messages: Vec<Message>,
    log: EventLog,
    store: Arc<RecordingStore>,
    slots: Arc<FakeSlotCatalog>,
    tables: Arc<FakeTableSource>,
}

impl Outcome {
    fn summary(&self) -> &SyncSummary {
        self.result.as_ref().expect("sync succeeded")
    }

    fn records_of(&self, stream: &StreamDescriptor) -> Vec<&RecordMessage> {
        records(&self.messages)
            .into_iter()
            .filter(|r| r.stream == stream.name && r.namespace == stream.namespace)
            .collect()
    }

    fn last_state(&self) -> &serde_json::Value {
        states(&self.messages).last().copied().expect("at least one STATE")
    }

    fn last_state_blob(&self) -> String {
        self.last_state().to_string()
    }

    fn logs(&self) -> Vec<(LogLevel, String)> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                Message::Log { log } => Some((log.level, log.message.clone())),
                _ => None,
            })
            .collect()
    }
}

fn replication_ready_catalog() -> FakeSlotCatalog {
    FakeSlotCatalog::new()
        .with_slot("s1", "pgoutput", Some(Lsn::new(SLOT_CONFIRMED)), false)
        .with_publication("p1", &[t1()])
        .with_identity(t1(), ReplicaIdentity::Default, true)
}

fn source_tables() -> FakeTableSource {
    let t1_rows = vec![
        row(&[("id", json!(1)), ("name", json!("a"))]),
        row(&[("id", json!(2)), ("name", json!("b"))]),
    ];
    let t2_rows = vec![
        row(&[("id", json!(1)), ("updated_at", json!(10))]),
        row(&[("id", json!(2)), ("updated_at", json!(20))]),
        row(&[("id", json!(3)), ("updated_at", json!(20))]),
        row(&[("id", json!(4)), ("updated_at", json!(20))]),
        row(&[("id", json!(5)), ("updated_at", json!(30))]),
    ];
    FakeTableSource::new(Lsn::new(P0))
        .with_table(t1(), &["id", "name"], &["id"], t1_rows)
        .with_table(t2(), &["id", "updated_at"], &["id"], t2_rows)
}

fn row_id(record: &RecordMessage) -> serde_json::Value {
    match &record.data {
        RecordData::Row(row) => row["id"].clone(),
        RecordData::Change(change) => change
            .after()
            .or(change.before())
            .map(|image| image["id"].clone())
            .unwrap_or_default(),
    }
}

fn change_op(record: &RecordMessage) -> Option<Operation> {
    match &record.data {
        RecordData::Change(change) => Some(change.op()),
        RecordData::Row(_) => None,
    }
}

fn cdc_state(lsn: &str) -> String {
    json!({
        "version": 1,
        "streams": [{
            "stream": {"namespace": "public", "name": "t1"},
            "cursor": {"type": "log_position", "lsn": lsn}
        }],
        "log_position": lsn
    })
    .to_string()
}

fn cdc() -> ConfiguredStream {
    ConfiguredStream::new(t1(), SyncMode::Cdc)
}

fn incremental_t2() -> ConfiguredStream {
    ConfiguredStream::new(t2(), SyncMode::Incremental).with_cursor_field("updated_at")
}

// ---------------------------------------------------------------------------
// Full refresh and incremental
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_full_refresh_emits_all_rows_then_one_state() {
    let outcome = Harness::new()
        .run(vec![ConfiguredStream::new(t2(), SyncMode::FullRefresh)], None)
        .await;

    let ids: Vec<_> = outcome.records_of(&t2()).iter().map(|r| row_id(r)).collect();
    assert_eq!(ids, vec![json!(1), json!(2), json!(3), json!(4), json!(5)]);
    assert_eq!(states(&outcome.messages).len(), 1);
    assert!(outcome.messages.last().is_some_and(|m| matches!(m, Message::Log { .. })));

    let logs = outcome.logs();
    assert_eq!(logs.first().map(|l| l.1.as_str()), Some("Starting sync"));
    assert!(logs.iter().any(|(_, m)| m == "Read 5 records from t2 stream"));

    let summary = outcome.summary();
    assert!(summary.is_success());
    assert_eq!(summary.records_for(&t2()), 5);
    assert_eq!(summary.streams[&t2()].status, StreamStatus::Done);
    // Nothing talks to the slot without a CDC stream
    assert!(outcome.log.starts().is_empty());
}

#[tokio::test]
async fn test_full_refresh_records_progress_and_resumes() {
    let mut harness = Harness::new();
    harness.config.checkpoint.every_records = 2;
    let outcome = harness
        .run(vec![ConfiguredStream::new(t2(), SyncMode::FullRefresh)], None)
        .await;

    let all_states = states(&outcome.messages);
    assert_eq!(all_states.len(), 3);
    assert_eq!(stream_entry(all_states[0], "t2").unwrap()["snapshot"]["last_key"], json!([2]));
    assert_eq!(stream_entry(all_states[1], "t2").unwrap()["snapshot"]["last_key"], json!([4]));
    assert!(stream_entry(all_states[2], "t2").unwrap()["snapshot"].is_null());

    // An interrupted run restarts after the recorded key
    let interrupted = all_states[0].to_string();
    let resumed = Harness::new()
        .run(vec![ConfiguredStream::new(t2(), SyncMode::FullRefresh)], Some(&interrupted))
        .await;
    let ids: Vec<_> = resumed.records_of(&t2()).iter().map(|r| row_id(r)).collect();
    assert_eq!(ids, vec![json!(3), json!(4), json!(5)]);
}

#[tokio::test]
async fn test_incremental_checkpoints_per_page_and_resumes_exclusively() {
    let outcome = Harness::new().run(vec![incremental_t2()], None).await;

    assert_eq!(outcome.records_of(&t2()).len(), 5);
    let cursors: Vec<serde_json::Value> = states(&outcome.messages)
        .iter()
        .map(|s| stream_entry(s, "t2").unwrap()["cursor"]["value"].clone())
        .collect();
    // Page one ends among the 20s, so only 10 is recorded for it
    assert_eq!(cursors, vec![json!(10), json!(20), json!(30), json!(30)]);

    // Every STATE follows the records it covers
    let mut seen_30 = false;
    for message in &outcome.messages {
        match message {
            Message::Record { record } if row_id(record) == json!(5) => seen_30 = true,
            Message::State { state } if stream_entry(&state.data, "t2").unwrap()["cursor"]["value"] == json!(30) => {
                assert!(seen_30, "checkpoint 30 emitted before its record");
            }
            _ => {}
        }
    }

    let prior = outcome.last_state_blob();
    let again = Harness::new().run(vec![incremental_t2()], Some(&prior)).await;
    assert!(again.records_of(&t2()).is_empty());
    assert!(!states(&again.messages).is_empty());
    assert_eq!(stream_entry(again.last_state(), "t2").unwrap()["cursor"]["value"], json!(30));
}

#[tokio::test]
async fn test_cursor_beyond_data_yields_no_records_but_state() {
    let prior = json!({
        "version": 1,
        "streams": [{
            "stream": {"namespace": "public", "name": "t2"},
            "cursor": {"type": "cursor", "field": "updated_at", "value": 1_000_000}
        }]
    })
    .to_string();
    let outcome = Harness::new().run(vec![incremental_t2()], Some(&prior)).await;
    assert!(records(&outcome.messages).is_empty());
    assert_eq!(states(&outcome.messages).len(), 1);
    assert_eq!(
        stream_entry(outcome.last_state(), "t2").unwrap()["cursor"]["value"],
        json!(1_000_000)
    );
}

#[tokio::test]
async fn test_stored_position_of_other_mode_is_reset() {
    let prior = json!({
        "version": 1,
        "streams": [{
            "stream": {"namespace": "public", "name": "t2"},
            "cursor": {"type": "log_position", "lsn": "0/900"}
        }]
    })
    .to_string();
    let outcome = Harness::new().run(vec![incremental_t2()], Some(&prior)).await;
    assert_eq!(outcome.records_of(&t2()).len(), 5);
    assert_eq!(stream_entry(outcome.last_state(), "t2").unwrap()["cursor"]["type"], "cursor");
}

// ---------------------------------------------------------------------------
// CDC
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cdc_first_sync_snapshots_then_streams_from_p0() {
    let harness = Harness::new().with_sessions(|c| {
        let mut steps = wire::transaction(
            10,
            0x300,
            0x310,
            vec![t1_relation(), wire::insert(16384, &[Some("9"), Some("before-p0")])],
        );
        steps.extend(wire::transaction(
            11,
            0x600,
            0x610,
            vec![
                t1_relation(),
                wire::insert(16384, &[Some("3"), Some("c")]),
                wire::update(16384, &[Some("1"), Some("a2")]),
            ],
        ));
        c.accept(steps)
    });
    let outcome = harness.run(vec![cdc()], None).await;

    let t1_records = outcome.records_of(&t1());
    let ids: Vec<_> = t1_records.iter().map(|r| row_id(r)).collect();
    // Snapshot rows, then only the changes committed after P0
    assert_eq!(ids, vec![json!(1), json!(2), json!(3), json!(1)]);
    assert_eq!(change_op(t1_records[0]), None);
    assert_eq!(change_op(t1_records[2]), Some(Operation::Insert));
    assert_eq!(change_op(t1_records[3]), Some(Operation::Update));
    assert_eq!(
        t1_records[3].ordering_key,
        OrderingKey::LogPosition {
            lsn: Lsn::new(0x600),
            seq: 1
        }
    );

    // P0 is made durable before the scan starts
    let all_states = states(&outcome.messages);
    assert_eq!(
        stream_entry(all_states[0], "t1").unwrap()["snapshot"]["resume_lsn"],
        json!("0/500")
    );
    let first_record = outcome.messages.iter().position(Message::is_record).unwrap();
    let first_state = outcome.messages.iter().position(Message::is_state).unwrap();
    assert!(first_state < first_record);

    let last = outcome.last_state();
    assert_eq!(last["log_position"], json!("0/610"));
    assert_eq!(stream_entry(last, "t1").unwrap()["cursor"]["lsn"], json!("0/610"));

    assert_eq!(outcome.log.starts(), vec![Lsn::new(SLOT_CONFIRMED)]);
    assert_eq!(outcome.log.statuses(), vec![Lsn::new(0x610)]);
    outcome.log.assert_acks_follow_flushes(Lsn::new(SLOT_CONFIRMED));
    assert_eq!(outcome.summary().records_for(&t1()), 4);
}

#[tokio::test]
async fn test_cdc_resume_skips_snapshot_and_already_emitted_changes() {
    let harness = Harness::new().with_sessions(|c| {
        // Redelivery of the last checkpointed transaction, then new work
        let mut steps = wire::transaction(11, 0x600, 0x610, vec![t1_relation(), wire::insert(16384, &[Some("3"), Some("c")])]);
        steps.extend(wire::transaction(12, 0x680, 0x690, vec![wire::delete_key(16384, &[Some("2"), None])]));
        steps.push(Step::Frame(wire::keepalive(0x700, false)));
        c.accept(steps)
    });
    harness.tables.set_wal_lsn(Lsn::new(0x700));
    let outcome = harness.run(vec![cdc()], Some(&cdc_state("0/610"))).await;

    let t1_records = outcome.records_of(&t1());
    assert_eq!(t1_records.len(), 1);
    assert_eq!(change_op(t1_records[0]), Some(Operation::Delete));
    assert_eq!(row_id(t1_records[0]), json!(2));
    assert!(outcome.tables.requests().is_empty());
    assert_eq!(outcome.log.starts(), vec![Lsn::new(0x610)]);
    assert_eq!(outcome.last_state()["log_position"], json!("0/690"));
    outcome.log.assert_acks_follow_flushes(Lsn::new(0x610));
}

#[tokio::test]
async fn test_cdc_state_ahead_of_server_does_not_connect() {
    let outcome = Harness::new().run(vec![cdc()], Some(&cdc_state("0/9000"))).await;
    assert!(records(&outcome.messages).is_empty());
    assert_eq!(states(&outcome.messages).len(), 1);
    assert_eq!(outcome.last_state()["log_position"], json!("0/9000"));
    assert!(outcome.log.starts().is_empty());
    assert!(outcome.summary().is_success());
}

#[tokio::test]
async fn test_relation_change_mid_stream_uses_new_columns() {
    let harness = Harness::new().with_sessions(|c| {
        let mut steps = wire::transaction(20, 0x600, 0x610, vec![t1_relation(), wire::insert(16384, &[Some("3"), Some("c")])]);
        steps.extend(wire::transaction(
            21,
            0x620,
            0x630,
            vec![
                wire::relation(
                    16384,
                    "public",
                    "t1",
                    &[("id", INT4, true), ("name", TEXT, false), ("email", TEXT, false)],
                ),
                wire::insert(16384, &[Some("4"), Some("d"), Some("d@example.com")]),
            ],
        ));
        c.accept(steps)
    });
    harness.tables.set_wal_lsn(Lsn::new(0x630));
    let outcome = harness.run(vec![cdc()], Some(&cdc_state("0/500"))).await;

    let images: Vec<serde_json::Value> = outcome
        .records_of(&t1())
        .iter()
        .map(|r| match &r.data {
            RecordData::Change(change) => serde_json::Value::Object(change.after().unwrap().clone()),
            RecordData::Row(_) => panic!("no snapshot expected"),
        })
        .collect();
    assert_eq!(images[0], json!({"id": 3, "name": "c"}));
    assert_eq!(images[1], json!({"id": 4, "name": "d", "email": "d@example.com"}));
}

#[tokio::test]
async fn test_cdc_checkpoints_every_n_records_before_catching_up() {
    let mut harness = Harness::new().with_sessions(|c| {
        let mut steps = Vec::new();
        for (i, lsn) in [0x600u64, 0x700, 0x800].into_iter().enumerate() {
            let id = (10 + i).to_string();
            let body = vec![t1_relation(), wire::insert(16384, &[Some(id.as_str()), Some("x")])];
            steps.extend(wire::transaction(30 + i as u32, lsn, lsn + 0x10, body));
        }
        c.accept(steps)
    });
    harness.config.checkpoint.every_records = 1;
    harness.tables.set_wal_lsn(Lsn::new(0x810));
    let outcome = harness.run(vec![cdc()], Some(&cdc_state("0/500"))).await;

    assert_eq!(outcome.records_of(&t1()).len(), 3);
    assert_eq!(
        outcome.log.statuses(),
        vec![Lsn::new(0x610), Lsn::new(0x710), Lsn::new(0x810)]
    );
    outcome.log.assert_acks_follow_flushes(Lsn::new(0x500));
}

fn two_spaced_transactions(c: FakeConnector) -> FakeConnector {
    let mut steps = wire::transaction(70, 0x600, 0x610, vec![t1_relation(), wire::insert(16384, &[Some("11"), Some("k")])]);
    steps.extend(wire::transaction(71, 0x700, 0x710, vec![wire::insert(16384, &[Some("12"), Some("l")])]));
    steps.push(Step::Frame(wire::keepalive(0x900, false)));
    c.accept(steps)
}

fn state_positions(messages: &[Message]) -> Vec<serde_json::Value> {
    states(messages).iter().map(|s| s["log_position"].clone()).collect()
}

#[tokio::test]
async fn test_unacknowledged_window_forces_checkpoint_before_catch_up() {
    let mut harness = Harness::new().with_sessions(two_spaced_transactions);
    harness.config.checkpoint.every_records = 1000;
    harness.config.checkpoint.max_unacknowledged_bytes = 0x100;
    harness.tables.set_wal_lsn(Lsn::new(0x900));
    let outcome = harness.run(vec![cdc()], Some(&cdc_state("0/500"))).await;

    assert!(outcome.summary().is_success());
    assert_eq!(outcome.records_of(&t1()).len(), 2);
    // Each transaction reaches the window on its own; the final STATE
    // after catch-up repeats the last position
    assert_eq!(
        state_positions(&outcome.messages),
        vec![json!("0/610"), json!("0/710"), json!("0/710")]
    );
    assert_eq!(outcome.log.statuses(), vec![Lsn::new(0x610), Lsn::new(0x710)]);
    outcome.log.assert_acks_follow_flushes(Lsn::new(0x500));

    // The first STATE lands between the two transactions' records
    let first_state = outcome.messages.iter().position(Message::is_state).unwrap();
    let second_record = outcome
        .messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.is_record())
        .nth(1)
        .map(|(i, _)| i)
        .unwrap();
    assert!(first_state < second_record);
}

#[tokio::test]
async fn test_default_window_checkpoints_only_at_catch_up() {
    let mut harness = Harness::new().with_sessions(two_spaced_transactions);
    harness.config.checkpoint.every_records = 1000;
    harness.tables.set_wal_lsn(Lsn::new(0x900));
    let outcome = harness.run(vec![cdc()], Some(&cdc_state("0/500"))).await;

    assert_eq!(state_positions(&outcome.messages), vec![json!("0/710")]);
    assert_eq!(outcome.log.statuses(), vec![Lsn::new(0x710)]);
}

#[tokio::test]
async fn test_unselected_tables_in_log_are_skipped() {
    let harness = Harness::new().with_sessions(|c| {
        c.accept(wire::transaction(
            40,
            0x600,
            0x610,
            vec![
                wire::relation(16400, "public", "audit", &[("id", INT4, true)]),
                wire::insert(16400, &[Some("77")]),
                t1_relation(),
                wire::insert(16384, &[Some("5"), Some("e")]),
            ],
        ))
    });
    harness.tables.set_wal_lsn(Lsn::new(0x610));
    let outcome = harness.run(vec![cdc()], Some(&cdc_state("0/500"))).await;
    let all = records(&outcome.messages);
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].stream, "t1");
    // Sequence numbers index the whole transaction
    assert_eq!(
        all[0].ordering_key,
        OrderingKey::LogPosition {
            lsn: Lsn::new(0x600),
            seq: 1
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_max_streaming_duration_streams_past_catch_up() {
    let mut harness = Harness::new().with_sessions(|c| {
        let mut steps = wire::transaction(50, 0x600, 0x610, vec![t1_relation(), wire::insert(16384, &[Some("6"), Some("f")])]);
        steps.push(Step::Hang);
        c.accept(steps)
    });
    harness.config.log_reader.max_streaming_secs = 30;
    let outcome = harness.run(vec![cdc()], Some(&cdc_state("0/500"))).await;

    assert_eq!(outcome.records_of(&t1()).len(), 1);
    assert_eq!(outcome.last_state()["log_position"], json!("0/610"));
    assert_eq!(outcome.log.statuses().last(), Some(&Lsn::new(0x610)));
    outcome.log.assert_acks_follow_flushes(Lsn::new(0x500));
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_busy_slot_aborts_before_any_record_or_state() {
    let mut harness = Harness::new();
    harness.slots = Arc::new(
        FakeSlotCatalog::new()
            .with_slot("s1", "pgoutput", Some(Lsn::new(SLOT_CONFIRMED)), true)
            .with_publication("p1", &[t1()])
            .with_identity(t1(), ReplicaIdentity::Default, true),
    );
    let outcome = harness
        .run(vec![ConfiguredStream::new(t2(), SyncMode::FullRefresh), cdc()], None)
        .await;

    assert!(matches!(outcome.result, Err(SourceError::SlotBusy { .. })));
    assert!(records(&outcome.messages).is_empty());
    assert!(states(&outcome.messages).is_empty());
    assert!(outcome.store.persisted().is_empty());
    assert!(outcome.log.starts().is_empty());
    assert!(outcome.slots.state().slots["s1"].active);
    assert!(outcome
        .logs()
        .iter()
        .any(|(level, m)| *level == LogLevel::Error && m.contains("in use by another consumer")));
}

#[tokio::test]
async fn test_unknown_stream_is_config_error_before_records() {
    let outcome = Harness::new()
        .run(
            vec![
                ConfiguredStream::new(t2(), SyncMode::FullRefresh),
                ConfiguredStream::new(StreamDescriptor::new("public", "ghost"), SyncMode::FullRefresh),
            ],
            None,
        )
        .await;
    assert!(matches!(outcome.result, Err(SourceError::Config { .. })));
    assert!(records(&outcome.messages).is_empty());
    assert!(outcome.store.persisted().is_empty());
}

#[tokio::test]
async fn test_duplicate_stream_in_catalog_is_rejected() {
    let outcome = Harness::new()
        .run(
            vec![
                ConfiguredStream::new(t2(), SyncMode::FullRefresh),
                incremental_t2(),
            ],
            None,
        )
        .await;
    assert!(matches!(outcome.result, Err(SourceError::Config { .. })));
    assert!(records(&outcome.messages).is_empty());
}

#[tokio::test]
async fn test_publication_gap_is_config_error_without_side_effects() {
    let mut harness = Harness::new();
    harness.slots = Arc::new(
        FakeSlotCatalog::new()
            .with_slot("s1", "pgoutput", Some(Lsn::new(SLOT_CONFIRMED)), false)
            .with_publication("p1", &[t2()])
            .with_identity(t1(), ReplicaIdentity::Default, true),
    );
    harness.config.replication.auto_create = true;
    let outcome = harness.run(vec![cdc()], None).await;
    assert!(matches!(outcome.result, Err(SourceError::Config { .. })));
    assert!(records(&outcome.messages).is_empty());
    assert!(outcome.slots.state().created_publications.is_empty());
}

#[tokio::test]
async fn test_log_failure_is_scoped_to_cdc_streams() {
    let harness = Harness::new().with_sessions(|c| c.accept(vec![Step::Corrupt]));
    harness.tables.set_wal_lsn(Lsn::new(0x700));
    let outcome = harness
        .run(
            vec![ConfiguredStream::new(t2(), SyncMode::FullRefresh), cdc()],
            Some(&cdc_state("0/500")),
        )
        .await;

    let summary = outcome.summary();
    assert!(!summary.is_success());
    assert_eq!(summary.errors.len(), 1);
    assert!(summary.errors[0].contains("public.t1"));
    assert_eq!(summary.streams[&t1()].status, StreamStatus::Failed);
    assert_eq!(summary.streams[&t2()].status, StreamStatus::Done);
    assert_eq!(outcome.records_of(&t2()).len(), 5);
    assert!(outcome
        .logs()
        .iter()
        .any(|(level, m)| *level == LogLevel::Error && m.contains("decode error")));
    // Nothing was acknowledged past the stored position
    assert!(outcome.log.statuses().is_empty());
}

#[tokio::test]
async fn test_unpersisted_state_is_never_emitted() {
    let harness = Harness::new();
    harness.store.fail_from_now_on();
    let outcome = harness
        .run(vec![ConfiguredStream::new(t2(), SyncMode::FullRefresh)], None)
        .await;
    assert!(states(&outcome.messages).is_empty());
    let summary = outcome.summary();
    assert_eq!(summary.errors.len(), 1);
    assert!(summary.errors[0].contains("disk full"));
}

#[tokio::test]
async fn test_shutdown_stops_streaming_at_last_checkpoint() {
    let harness = Harness::new().with_sessions(|c| {
        let mut steps = wire::transaction(60, 0x600, 0x610, vec![t1_relation(), wire::insert(16384, &[Some("7"), Some("g")])]);
        steps.push(Step::Hang);
        c.accept(steps)
    });
    harness.tables.set_wal_lsn(Lsn::new(0x9000));
    let state = StateManager::load(Some(&cdc_state("0/500")), harness.store.clone()).unwrap();
    let orchestrator = Orchestrator::new(
        harness.config,
        ConfiguredCatalog::new(vec![cdc()]),
        seams(harness.slots.clone(), harness.tables.clone(), Arc::new(harness.connector)),
    );
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let (mut messages, handle) = orchestrator.spawn(state, shutdown_rx);

    let mut seen = Vec::new();
    while let Some(message) = messages.next().await {
        let is_record = message.is_record();
        seen.push(message);
        if is_record {
            shutdown_tx.send(()).unwrap();
        }
    }
    let result = handle.await.unwrap();
    assert!(matches!(result, Err(SourceError::Cancelled)));
    assert_eq!(records(&seen).len(), 1);
    // The change was never checkpointed, so it is neither stated nor acknowledged
    assert!(states(&seen).is_empty());
    assert!(harness.log.statuses().is_empty());
    assert!(harness.store.persisted().is_empty());
}

// ---------------------------------------------------------------------------
// Delivery to the consumer
// ---------------------------------------------------------------------------

async fn let_sync_run() {
    for _ in 0..200 {
        tokio::task::yield_now().await;
    }
}

fn resume_with_one_change(c: FakeConnector) -> FakeConnector {
    let mut steps = wire::transaction(12, 0x680, 0x690, vec![t1_relation(), wire::insert(16384, &[Some("8"), Some("h")])]);
    steps.push(Step::Hang);
    c.accept(steps)
}

#[tokio::test]
async fn test_slot_ack_waits_for_consumer_to_take_state() {
    let harness = Harness::new().with_sessions(resume_with_one_change);
    harness.tables.set_wal_lsn(Lsn::new(0x690));
    let store = harness.store.clone();
    let (mut messages, handle, log) = harness.spawn(vec![cdc()], Some(&cdc_state("0/610")));

    // The STATE is queued and persisted, but the consumer has read nothing
    let_sync_run().await;
    assert!(log.statuses().is_empty());
    assert!(!handle.is_finished());
    assert_eq!(store.persisted().last().unwrap()["log_position"], json!("0/690"));

    let mut seen = Vec::new();
    while let Some(message) = messages.next().await {
        seen.push(message);
        if state_positions(&seen) == vec![json!("0/690")] {
            break;
        }
    }
    assert_eq!(records(&seen).len(), 1);

    // Holding the STATE is not yet handling it
    let_sync_run().await;
    assert!(log.statuses().is_empty());

    seen.extend(messages.collect().await);
    assert!(handle.await.unwrap().is_ok());
    assert_eq!(log.statuses(), vec![Lsn::new(0x690)]);
    log.assert_acks_follow_flushes(Lsn::new(0x610));
}

#[tokio::test]
async fn test_dropped_consumer_leaves_slot_unacknowledged() {
    let harness = Harness::new().with_sessions(resume_with_one_change);
    harness.tables.set_wal_lsn(Lsn::new(0x690));
    let (messages, handle, log) = harness.spawn(vec![cdc()], Some(&cdc_state("0/610")));

    let_sync_run().await;
    drop(messages);
    let result = handle.await.unwrap();
    assert!(matches!(result, Err(SourceError::Cancelled)));
    assert!(log.statuses().is_empty());
}
