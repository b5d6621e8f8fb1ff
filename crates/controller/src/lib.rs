//! Runtime wiring of the capacity overlay controller: configuration, the
//! health/metrics API and the NodePool watcher

pub mod api;
pub mod config;
pub mod watch;
