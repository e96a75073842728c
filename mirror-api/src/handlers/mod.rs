mod admin;
mod app;
mod webhook;

pub use app::{app, AppState};
