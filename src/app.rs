use crate::{
    config::Config,
    frames::FrameExtractor,
    inference::InferenceService,
    ort_predictor::OrtPredictor,
    predictor::Predictor,
    server::HttpServer,
    session::SessionStore,
    telemetry::Metrics,
    video::VideoResolver,
};
use std::{error::Error, sync::Arc, time::Duration};
use tokio::{
    signal,
    sync::broadcast::{self, Receiver},
    task::JoinHandle,
};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let frames = FrameExtractor::new();
    let predictor = match OrtPredictor::new(&config.model, frames.clone()) {
        Ok(predictor) => predictor,
        Err(e) => {
            tracing::error!("Failed to initialize predictor: {:?}", e);
            return Err(e.into());
        }
    };

    let video_dir = config.video.get_video_dir();
    tracing::info!("Serving videos from {:?}", video_dir);

    let inference_service = InferenceService::new(
        predictor,
        SessionStore::with_idle_ttl(config.inference.get_session_idle_ttl()),
        frames,
        VideoResolver::new(video_dir),
        config.inference.mask_threshold,
    );
    let metrics = Arc::new(Metrics::new()?);

    let server = HttpServer::new(inference_service.clone(), metrics.clone(), &config).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_shutdown_rx = shutdown_tx.subscribe();

    let reaper_handle = config.inference.get_session_idle_ttl().map(|ttl| {
        tracing::info!("Evicting sessions idle for more than {:?}", ttl);
        start_session_reaper(
            inference_service.clone(),
            metrics.clone(),
            config.inference.get_reaper_interval(),
            shutdown_tx.subscribe(),
        )
    });

    let server_handle = server.run(server_shutdown_rx).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    let _ = server_handle.await;
    if let Some(handle) = reaper_handle {
        let _ = handle.await;
    }

    Ok(())
}

fn start_session_reaper<P: Predictor>(
    inference_service: InferenceService<P>,
    metrics: Arc<Metrics>,
    interval: Duration,
    mut shutdown_rx: Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match inference_service.evict_idle_sessions().await {
                        Ok(evicted) if !evicted.is_empty() => {
                            tracing::info!("Evicted {} idle sessions", evicted.len());
                            metrics.record_open_sessions(inference_service.session_count());
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!("Session reaper failed: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
