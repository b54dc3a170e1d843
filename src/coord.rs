//! Coordination subsystem: the client collaborator interface, the watch
//! channel, and the watch-driven cache over hierarchical coordination paths.

pub mod cache;
pub mod client;
pub mod watch;

pub use cache::{CacheRegistry, CoordCache};
pub use client::{CoordClient, CoordClientFactory, CoordError, NodeStat};
pub use watch::{NodeEventKind, SessionEventKind, WatchChannel, WatchEvent, Watcher};
