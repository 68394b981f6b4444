pub mod engine;
pub mod errors;
pub mod local_store;
pub mod meta_sync;
pub mod sse;
pub mod transport;
