use crate::{model_service::SegmentationModel, server::SharedState};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct Status {
    status: String,
}

/// Reports `Available` once the model handle is loaded, `Loading` before that.
pub async fn healthcheck<M: SegmentationModel>(
    State(state): State<SharedState<M>>,
) -> impl IntoResponse {
    if state.models.is_loaded() {
        (
            StatusCode::OK,
            Json(Status {
                status: "Available".into(),
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(Status {
                status: "Loading".into(),
            }),
        )
    }
}
