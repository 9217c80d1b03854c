mod app;
mod enqueue;
mod jobs;

pub use app::{app, AppState};
