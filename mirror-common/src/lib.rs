pub mod auth;
pub mod bloom;
pub mod config;
pub mod cursor;
pub mod decoder;
pub mod env;
pub mod event;
pub mod health;
pub mod idl;
pub mod metrics;
pub mod metrics_consts;
pub mod pipeline;
pub mod plugins;
pub mod reconcile;
pub mod retry;
pub mod rpc;
pub mod sanitize;
pub mod schema;
pub mod single_flight;
pub mod transactions;
pub mod upsert;
