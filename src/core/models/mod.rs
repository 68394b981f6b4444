pub mod budget;
pub mod event;
pub mod invitation;
pub mod meta;
pub mod settings;
pub mod sync;
pub mod transaction;
pub mod user;
