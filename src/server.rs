use crate::{
    config::ServerConfig, model_cache::ModelCache, model_service::SegmentationModel,
    prediction::Predictor, routes::api_routes, telemetry::Metrics,
};
use axum::{extract::DefaultBodyLimit, Router};
use axum_otel_metrics::HttpMetricsLayerBuilder;
use bytes::Bytes;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};

pub struct SharedState<M: SegmentationModel> {
    pub predictor: Predictor<M>,
    pub models: Arc<ModelCache<M>>,
    pub index_page: Arc<String>,
    pub logo: Bytes,
    pub metrics: Arc<Metrics>,
}

impl<M: SegmentationModel> Clone for SharedState<M> {
    fn clone(&self) -> Self {
        Self {
            predictor: self.predictor.clone(),
            models: self.models.clone(),
            index_page: self.index_page.clone(),
            logo: self.logo.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

pub fn build_router<M: SegmentationModel>(
    app_state: SharedState<M>,
    config: &ServerConfig,
) -> Router {
    let metrics_layer = HttpMetricsLayerBuilder::new().build();

    Router::new()
        .merge(api_routes::<M>())
        .with_state(app_state)
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(metrics_layer)
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new<M: SegmentationModel>(
        app_state: SharedState<M>,
        config: &ServerConfig,
    ) -> anyhow::Result<Self> {
        let addr = config.get_address();
        let router = build_router(app_state, config);

        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(
        self,
        shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn({
            let mut shutdown_rx = shutdown_rx.resubscribe();
            async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        shutdown_rx.recv().await.ok();
                    })
                    .await?;
                Ok(())
            }
        });

        Ok(server_handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        labels::ClassLabels,
        model_service::{ModelError, ModelOutput},
        postprocess::PostprocessParams,
        routes::render_index_page,
    };
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
        response::Response,
    };
    use ndarray::{Array, Array4, IxDyn};
    use tower::ServiceExt;

    struct EmptyModelService {}

    impl SegmentationModel for EmptyModelService {
        fn run(&self, _input: &Array4<f32>) -> Result<ModelOutput, ModelError> {
            Ok(ModelOutput {
                detections: Array::zeros(IxDyn(&[1, 5, 1])),
                prototypes: None,
            })
        }
    }

    fn state(models: Arc<ModelCache<EmptyModelService>>) -> SharedState<EmptyModelService> {
        let params = PostprocessParams {
            input_size: 640,
            min_probability: 0.25,
            iou_threshold: 0.7,
            mask_threshold: 0.5,
        };
        SharedState {
            predictor: Predictor::new(
                Arc::new(EmptyModelService {}),
                Arc::new(ClassLabels::default()),
                params,
                None,
            ),
            models,
            index_page: Arc::new(render_index_page("Lung Cancer Detection")),
            logo: Bytes::from_static(b"\x89PNG"),
            metrics: Arc::new(Metrics::new().unwrap()),
        }
    }

    fn config(max_upload_bytes: usize) -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_upload_bytes,
        }
    }

    async fn router(max_upload_bytes: usize) -> Router {
        let models = Arc::new(ModelCache::new(|| Ok(EmptyModelService {})));
        models.get_or_load().await.unwrap();

        build_router(state(models), &config(max_upload_bytes))
    }

    async fn get(router: Router, uri: &str) -> Response {
        router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8_lossy(&body).into_owned()
    }

    #[tokio::test]
    async fn test_router_serves_static_routes() {
        let response = get(router(1024).await, "/health").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, r#"{"status":"Available"}"#);

        let response = get(router(1024).await, "/metrics").await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = get(router(1024).await, "/logo.png").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");

        let response = get(router(1024).await, "/").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response)
            .await
            .contains("<title>Lung Cancer Detection</title>"));
    }

    #[tokio::test]
    async fn test_health_reports_unloaded_model() {
        let models = Arc::new(ModelCache::new(|| Ok(EmptyModelService {})));
        let router = build_router(state(models.clone()), &config(1024));

        let response = get(router.clone(), "/health").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_text(response).await, r#"{"status":"Loading"}"#);

        models.get_or_load().await.unwrap();
        let response = get(router, "/health").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_router_rejects_oversized_upload() {
        let request = Request::builder()
            .method("POST")
            .uri("/predict")
            .header(header::CONTENT_TYPE, "image/png")
            .body(Body::from(vec![0u8; 100]))
            .unwrap();

        let response = router(10).await.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_router_unknown_route() {
        let response = get(router(1024).await, "/video_feed").await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
