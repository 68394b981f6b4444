pub mod errors;
pub mod fingerprint;
pub mod models;
pub mod notifier;
pub mod services;
