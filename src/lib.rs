//! SSH proxy fronting a fleet of ephemeral workload containers.
//!
//! Clients connect to one well-known endpoint and encode their destination
//! in the SSH username. The proxy authenticates them against a pluggable set
//! of realms, resolves the target container through the cluster state
//! service, and bridges the session to the in-container SSH daemon with the
//! daemon's host key pinned by fingerprint.

pub mod apps;
pub mod auth;
pub mod bridge;
pub mod cluster;
pub mod config;
pub mod keys;
pub mod locations;
pub mod realm;
pub mod ssh;
pub mod tokens;
