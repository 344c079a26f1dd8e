mod annotate;
mod ort_service;
mod routes;
mod server;

pub mod app;
pub mod config;
pub mod labels;
pub mod model_cache;
pub mod model_service;
pub mod postprocess;
pub mod prediction;
pub mod preprocess;
pub mod telemetry;

pub use app::start_app;
