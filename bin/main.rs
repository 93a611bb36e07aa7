use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use whisper_rs::{WhisperContext, WhisperContextParameters};

use whisper_stream::config::server_config::ServerConfig;
use whisper_stream::engine::pool::ContextPool;
use whisper_stream::engine::speech::{DecodeOptions, SpeechEngine, WhisperSpeechEngine};
use whisper_stream::error::ServerError;
use whisper_stream::server::ws::StreamServer;
use whisper_stream::session::registry::SessionRegistry;
use whisper_stream::vad::engine::{VadEngine, VoiceDetector};
use whisper_stream::worker::inference_worker::InferenceWorker;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "whisper_stream=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::parse();

    if let Err(e) = run(config).await {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

async fn run(config: ServerConfig) -> Result<(), ServerError> {
    config.validate()?;

    // Route whisper.cpp's own logging (including the very chatty VAD
    // path) through tracing instead of raw stderr.
    whisper_rs::install_whisper_tracing_trampoline();

    tracing::info!(
        model = %config.model,
        contexts = config.contexts,
        gpu = config.use_gpu(),
        "loading transcription contexts"
    );

    let mut ctx_params = WhisperContextParameters::default();
    ctx_params.use_gpu(config.use_gpu());
    ctx_params.flash_attn(config.flash_attn());
    let ctx = WhisperContext::new_with_params(&config.model, ctx_params)
        .map_err(|e| ServerError::ModelLoad(format!("{}: {e}", config.model)))?;

    let decode = Arc::new(DecodeOptions {
        language: config.language.clone(),
        n_threads: config.threads,
        translate: config.translate,
    });

    let mut engines: Vec<Box<dyn SpeechEngine>> = Vec::with_capacity(config.contexts);
    for i in 0..config.contexts {
        let state = ctx
            .create_state()
            .map_err(|e| ServerError::ModelLoad(format!("context {i}: {e}")))?;
        engines.push(Box::new(WhisperSpeechEngine::new(state, decode.clone())));
        tracing::info!("loaded context {}/{}", i + 1, config.contexts);
    }
    let pool = Arc::new(ContextPool::new(engines));

    let vad: Option<Arc<dyn VoiceDetector>> = match &config.vad_model {
        Some(path) => {
            let engine = VadEngine::load(path)?;
            tracing::info!(
                model = %path,
                threshold = config.vad_threshold,
                silence_ms = config.silence_trigger_ms,
                "VAD enabled"
            );
            Some(Arc::new(engine))
        }
        None => {
            tracing::info!("VAD disabled, no final transcripts will be emitted");
            None
        }
    };

    let registry = Arc::new(SessionRegistry::new());
    let running = Arc::new(AtomicBool::new(true));
    let worker = InferenceWorker::new(
        registry.clone(),
        pool.clone(),
        vad,
        config.worker_config(),
        running.clone(),
    );
    let worker_handle = worker.spawn();

    let addr = std::net::SocketAddr::from((config.bind, config.port));
    let server = Arc::new(StreamServer::new(
        Arc::new(config),
        registry.clone(),
        pool.clone(),
    ));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {addr}");

    axum::serve(listener, server.router())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Teardown order matters: stop ticking first, then reclaim every
    // leased slot, and only then drop the pool (contexts freed last).
    running.store(false, Ordering::Release);
    if worker_handle.join().is_err() {
        tracing::warn!("inference worker panicked during shutdown");
    }
    for session in registry.drain_all() {
        session.set_inactive();
        let mut ut = session.utterance.lock().expect("utterance lock poisoned");
        if let Some(slot) = ut.slot.take() {
            pool.release(slot);
        }
    }
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => tracing::info!("Ctrl+C pressed, shutting down"),
            Err(err) => tracing::error!("failed to listen for Ctrl+C: {err}"),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                tracing::info!("received terminate signal");
            }
            Err(err) => tracing::error!("failed to install signal handler: {err}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
