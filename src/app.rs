use crate::{
    annotate::load_font,
    config::Config,
    labels::ClassLabels,
    model_cache::ModelCache,
    ort_service::OrtModelService,
    postprocess::PostprocessParams,
    prediction::Predictor,
    routes::render_index_page,
    server::{HttpServer, SharedState},
    telemetry::Metrics,
};

use bytes::Bytes;
use std::{error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let labels = match ClassLabels::load(&config.labels) {
        Ok(labels) => Arc::new(labels),
        Err(e) => {
            tracing::error!("Failed to load class labels: {:?}", e);
            return Err(Box::new(e));
        }
    };

    let model_config = config.model.clone();
    let models = Arc::new(ModelCache::new(move || OrtModelService::new(&model_config)));
    let model = match models.get_or_load().await {
        Ok(model) => model,
        Err(e) => {
            tracing::error!("Failed to initialize model: {:?}", e);
            return Err(Box::new(e));
        }
    };

    let font = match &config.ui.font_path {
        Some(path) => Some(Arc::new(load_font(path)?)),
        None => {
            tracing::info!("No font configured, detections will be drawn without captions");
            None
        }
    };

    let logo = Bytes::from(std::fs::read(&config.ui.logo_path)?);

    let predictor = Predictor::new(
        model,
        labels,
        PostprocessParams::from(&config.model),
        font,
    );

    let app_state = SharedState {
        predictor,
        models,
        index_page: Arc::new(render_index_page(&config.ui.page_title)),
        logo,
        metrics: Arc::new(Metrics::new()?),
    };

    let server = HttpServer::new(app_state, &config.server).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_shutdown_rx = shutdown_tx.subscribe();

    let server_handle = server.run(server_shutdown_rx).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    let _ = server_handle.await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
