//! Engine facade tying storage, transactions, schema and indexes together.

mod config;
mod engine;

#[cfg(test)]
mod tests;

pub use config::EngineConfig;
pub use engine::{Engine, GcStats};
