pub mod config;
pub mod error;
pub mod geyser;
pub mod kafka;
pub mod router;
pub mod source;
pub mod substreams;
