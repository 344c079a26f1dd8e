mod health;
mod index;
mod metrics;
mod predict_image;

use crate::{model_service::SegmentationModel, server::SharedState};
use axum::{
    routing::{get, post},
    Router,
};

pub use health::healthcheck;
pub use index::{index_page, logo, render_index_page};
pub use metrics::metrics_handler;
pub use predict_image::predict_image;

pub fn api_routes<M: SegmentationModel>() -> Router<SharedState<M>> {
    Router::new()
        .route("/", get(index_page::<M>))
        .route("/logo.png", get(logo::<M>))
        .route("/predict", post(predict_image::<M>))
        .route("/health", get(healthcheck::<M>))
        .route("/metrics", get(metrics_handler::<M>))
}
