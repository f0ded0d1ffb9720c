mod app;
mod inference;
mod routes;
mod server;
mod telemetry;

pub mod config;
pub mod frames;
pub mod mask;
pub mod models;
pub mod multipart;
pub mod ort_predictor;
pub mod predictor;
pub mod session;
pub mod video;

#[cfg(test)]
mod test_support;

pub use app::start_app;
pub use inference::{InferenceError, InferenceService};
