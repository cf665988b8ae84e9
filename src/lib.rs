//! Offline-first content cache: keeps units, lessons and assets available
//! locally, reconciles them with the server through an incremental pull
//! protocol and delivers local writes through a durable outbox.
pub mod assets;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod outbox;
pub mod remote;
pub mod service;
pub mod sync;

pub use error::{Error, ErrorKind, Result};
