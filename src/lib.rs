pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod core;
pub mod infrastructure;

pub use crate::client::engine::{ClientConfig, SyncEngine};
pub use crate::core::services::BudgetService;
pub use crate::infrastructure::storage::{in_memory::InMemoryStorage, json_file::JsonFileStorage};

#[cfg(test)]
mod tests; // Include integration tests
