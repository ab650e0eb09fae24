use clap::Parser;
use speechd_gate::config_loader::Settings;
use speechd_gate::control_plane::ControlPlane;
use speechd_gate::overload::OverloadMonitor;
use speechd_gate::service::GateService;
use speechd_gate::telemetry::SystemSampler;
use std::error::Error;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::info;
use tracing_subscriber::EnvFilter;
use zbus::connection::Builder;

/// Admission, routing and local-backend guard for the speech assistant
#[derive(Parser)]
#[command(name = "speechd-gate")]
#[command(version)]
struct Args {
    /// Load settings from this file instead of the default search path
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("speechd_gate=info")),
        )
        .init();

    let args = Args::parse();
    let settings = match &args.config {
        Some(path) => Settings::from_file(path)?,
        None => Settings::new()?,
    };

    let plane = Arc::new(ControlPlane::from_settings(&settings));
    let sampler = Arc::new(Mutex::new(SystemSampler::new()));

    let _conn = Builder::session()?
        .name("org.speech.Gate")?
        .serve_at(
            "/org/speech/Gate",
            GateService {
                plane: plane.clone(),
                sampler: sampler.clone(),
            },
        )?
        .build()
        .await?;

    info!(
        backend = %settings.ollama_url,
        model = %settings.ollama_model,
        max_concurrent = settings.max_concurrent,
        guardian = !settings.guardian_url.is_empty(),
        "Gate service running at org.speech.Gate"
    );

    let monitor = OverloadMonitor::new(
        plane.dispatcher().clone(),
        sampler,
        settings.overload_config(),
    )
    .spawn();

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    monitor.abort();
    plane.shutdown();

    Ok(())
}
