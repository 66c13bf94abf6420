//! Binary entry point: loads configuration, builds an [`streamcore::app::App`], connects the
//! configured OBS session, and runs until `Ctrl-C`.

use std::sync::Arc;

use streamcore::activity_log::NullActivityLogSink;
use streamcore::app::{spawn_ctrl_c_watcher, App};
use streamcore::Config;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,streamcore=info".into()))
        .init();

    let config = Config::from_env()?;

    // The persistence sink (activity-log storage) is an external collaborator out of scope for
    // this crate (§1); a real deployment wires a sink here backed by `config.database_url`.
    let activity_log = Arc::new(NullActivityLogSink);

    let app = App::new(config.clone(), activity_log).await?;
    spawn_ctrl_c_watcher(&app);

    if let Err(e) = app.start_default_obs_session(&config).await {
        error!(error = %e, "failed to start default obs session; continuing without it");
    }

    info!("streamcore started");
    app.run().await;

    Ok(())
}
