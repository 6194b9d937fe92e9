// ABOUTME: Log Reader/Decoder: WAL positions, wire framing, pgoutput decoding and streaming
// ABOUTME: Exposes the LogReader and the seams it uses to reach the server

pub mod change;
pub mod client;
pub mod lsn;
pub mod pgoutput;
pub mod protocol;
pub mod reader;

pub use change::{ChangeRecord, CommittedTransaction, Operation, RowImage};
pub use client::PgReplicationConnector;
pub use lsn::Lsn;
pub use pgoutput::PgOutputDecoder;
pub use reader::{ConnectionState, LogEvent, LogReader, ReplicationConnector, ReplicationStream};
