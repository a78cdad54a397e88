pub mod callback;
pub mod catalog;
pub mod config;
pub mod credentials;
pub mod error;
pub mod lifecycle;
pub mod normalize;
pub mod orchestrator;
pub mod providers;
pub mod runtime;
pub mod sanitize;
pub mod scheduler;
pub mod storage;
pub mod store;
pub mod terminal;
pub mod vault;

#[cfg(test)]
pub mod testing;
