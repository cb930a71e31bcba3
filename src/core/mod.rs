//! Shared primitives: storage plumbing, configuration, errors and the
//! document model.

pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod schemas;
pub mod time;
pub mod workspace;
pub mod xml;
