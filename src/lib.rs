//! Role-aware load-balancing proxy for PostgreSQL clusters.
//!
//! Clients speak the ordinary v3 wire protocol to the proxy. The startup
//! packet decides where a session lands: a database (or user) name ending
//! in `_replica` routes to one of the streaming replicas, round-robin;
//! everything else goes to the current master. Once a backend is chosen
//! the proxy replays the startup packet and turns into a transparent byte
//! pump, so authentication and queries pass through unchanged.
//!
//! Backend roles are discovered by probing each configured server with
//! `SELECT pg_is_in_recovery()`. CancelRequest connections are matched
//! against the BackendKeyData each session handed out and relayed to the
//! backend that owns the session.

pub mod config;
pub mod dsn;
pub mod logging;
pub mod monitor;
pub mod oracle;
pub mod pqproto;
pub mod proxy;
pub mod registry;
pub mod stream;
