//! Transparent TCP proxy for Redis-protocol (RESP) traffic.
//!
//! The proxy sits between many clients and a single uplink server. Each
//! client gets its own stateful uplink connection (authentication and
//! selected database are replayed on redial), and every uplink call passes
//! through a central coordinator that can quiesce traffic, swap the uplink
//! live, and resume without dropping client sessions.

pub mod proxy;
pub mod resp;
