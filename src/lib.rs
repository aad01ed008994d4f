//! Local mirror of a remote dashboard dataset, encrypted at rest and kept
//! in a size-limited key/value store.

pub mod cache;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod logging;
pub mod remote;

#[cfg(test)]
mod testing;
