//! Local implementation of the murmur platform: SQLite-backed records,
//! password auth with signed sessions, a realtime change hub, a bucketed
//! object store and the HTTP/WebSocket surface over all of it.

pub mod api;
pub mod auth;
pub mod config;
pub mod conversations;
pub mod db;
pub mod housekeeping;
pub mod local;
pub mod messages;
pub mod posts;
pub mod profiles;
pub mod realtime;
pub mod service;
pub mod storage;

pub use local::LocalPlatform;
pub use service::Service;
