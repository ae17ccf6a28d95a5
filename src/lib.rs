pub mod config;
pub mod errors;
pub mod git;
pub mod job;
pub mod keys;
pub mod logging;
pub mod notify;
pub mod queue;
pub mod resolver;
pub mod server;
pub mod sync;
pub mod verify;
