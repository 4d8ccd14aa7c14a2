//! Core library for the `squaled` job-dispatch daemon: pools of worker
//! threads fronting a pluggable database backend, talking a small
//! length-prefixed wire protocol over a unix socket.

pub mod client;
pub mod config;
pub mod listener;
pub mod logging;
pub mod server;
pub mod types;
pub mod wire;
