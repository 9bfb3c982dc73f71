//! Read/write splitting MySQL proxy
//!
//! Clients connect to a service listener; each client gets a
//! [`session::RouterSession`] holding one primary and a set of replica
//! connections. Writes and session commands go to the primary, reads to a
//! replica, and session commands are replayed on every backend before it
//! serves the client. Replies are spliced backend -> client through a shared
//! [`transport::PipePool`].

pub mod backend;
pub mod classifier;
pub mod config;
pub mod metrics;
pub mod protocol;
pub mod proxy;
pub mod router;
pub mod session;
pub mod transport;
