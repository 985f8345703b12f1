//! Host agent that keeps an instance converged with its assigned associations.
pub mod association;
pub mod command;
pub mod config;
pub mod engine;
pub mod logger;
pub mod retry;
pub mod store;
