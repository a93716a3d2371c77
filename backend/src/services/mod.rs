pub mod engine;
pub mod ingestion;
pub mod liveness;
pub mod runtime;
