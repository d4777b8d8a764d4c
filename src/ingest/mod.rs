//! Carrier reply ingestion: mailbox polling and ETA extraction.

pub mod extract;
pub mod patterns;
pub mod poller;

pub use extract::{EtaExtractor, Extraction};
pub use poller::{IngestPipeline, PollSummary, PollerHandle, spawn_email_poller};
