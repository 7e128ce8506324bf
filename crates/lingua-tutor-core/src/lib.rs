//! Core types, config, errors, and transcript storage for Lingua Tutor.

pub mod config;
pub mod error;
pub mod history_store;
pub mod types;
