//! # cinder-server: the master-side replication endpoint
//!
//! This crate is the glue between the replication core and a server
//! process. On the master side it runs a listener serving the replication
//! wire commands (`AUTH`, `_db_name`, `REPLCONF`, `PSYNC`, `_fetch_meta`,
//! `_fetch_file`), attaching a [`cinder_repl::Feeder`] per accepted slave
//! and reaping feeders that die. On the slave side it provides
//! [`ServerHost`], the [`cinder_repl::ReplicaHost`] implementation that
//! wires a storage engine, the loading flag, the restore swap, and the
//! fetch-thread gauge into a replication client.
//!
//! Command dispatch for regular clients, pubsub fan-out, and cron live in
//! the outer server; only the replication surface lives here.

pub mod config;
pub mod error;
pub mod handler;
pub mod host;
pub mod listener;
pub mod service;

pub use config::MasterConfig;
pub use error::{ServerError, ServerResult};
pub use host::ServerHost;
pub use listener::ReplicationListener;
pub use service::MasterService;
