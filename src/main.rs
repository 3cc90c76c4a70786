use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use retinoscan::cli::{Cli, Command, PredictArgs, ServeArgs};
use retinoscan::preprocess::PreprocessMethod;
use retinoscan::visualize::load_font;
use retinoscan::{DiagnosisService, cors_layer, logging, router};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Predict(args) => tokio::task::spawn_blocking(move || predict(args)).await?,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = args.model.classifier_config();
    config.validate().context("invalid GRADCAM_LAYER")?;
    let service = Arc::new(DiagnosisService::new(config));
    let cors = cors_layer(&args.frontend_origin)
        .with_context(|| format!("invalid FRONTEND_ORIGIN {:?}", args.frontend_origin))?;
    let app = router(service.clone(), cors);

    let listener = TcpListener::bind((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", args.host, args.port))?;
    info!("retinoscan v{}", env!("CARGO_PKG_VERSION"));
    info!("Listening on http://{}", listener.local_addr()?);

    // requests are answered with 503 until this finishes
    let path = args.model.model.clone();
    let loader = service.clone();
    tokio::task::spawn_blocking(move || {
        if let Err(e) = loader.load(&path) {
            error!("Model load failed: {e}");
            warn!("Serving without a model, predictions will return 503");
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

fn predict(args: PredictArgs) -> Result<()> {
    let config = args.model.classifier_config();
    config.validate().context("invalid GRADCAM_LAYER")?;
    let mut service = DiagnosisService::new(config);
    if let Some(font) = &args.font {
        service = service.with_font(load_font(font)?);
    }
    service.load(&args.model.model)?;

    let method: PreprocessMethod = args.preprocessing.parse()?;
    let image = image::open(&args.source)
        .with_context(|| format!("failed to open {:?}", args.source))?;

    let t = Instant::now();
    let diagnosis = service.diagnose_image(&image, method, args.gradcam)?;
    println!("[model]: {:?}", t.elapsed());

    println!(
        "Diagnosis: {}, Confidence: {:.2}%",
        diagnosis.label(),
        diagnosis.prediction.confidence * 100.0
    );
    println!("Risk level: {:?}", diagnosis.risk);
    println!("Recommendation: {}", diagnosis.recommendation);

    if let Some(png) = diagnosis.gradcam_png {
        std::fs::create_dir_all(&args.output)?;
        let path = args
            .output
            .join(format!("gradcam_{}.png", Local::now().format("%Y%m%d_%H%M%S")));
        std::fs::write(&path, png)?;
        println!("Grad-CAM saved to {}", path.display());
    }
    Ok(())
}
