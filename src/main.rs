//! Lifeline daemon
//!
//! ## Usage
//!
//! ```bash
//! # Defaults: listen on 0.0.0.0:8088, evidence under the local data dir
//! lifeline
//!
//! # Policy file plus identity fixtures
//! lifeline --config /etc/lifeline.toml --identity-file users.json
//!
//! # Throwaway in-memory evidence store
//! lifeline --memory-storage --log-level debug
//! ```

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lifeline::collaborators::{
    AuthorityNotifier, FsObjectStore, IdentityDirectory, InMemoryIdentity, InMemoryObjectStore,
    LoggingAuthority, ObjectStore,
};
use lifeline::config::{ChannelEndpoints, StorageBackend};
use lifeline::dispatch::{ChannelSet, WebhookChannel};
use lifeline::ids::UuidIds;
use lifeline::{Args, Collaborators, HttpServer, Lifeline, LifelineConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("lifeline={},info", args.log_level).into());
    let registry = tracing_subscriber::registry().with(filter);
    if args.log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    let mut config = match &args.config {
        Some(path) => LifelineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => LifelineConfig::default(),
    };
    config.apply_args(&args);
    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Lifeline - incident fan-out core");
    info!("======================================");
    info!("Listen: {}", config.listen);
    info!(
        "Dispatch: fanout {} / deadline {} ms / max tier {}",
        config.dispatch.fanout_size, config.dispatch.tier_deadline_ms, config.dispatch.max_tier
    );

    let object_store: Arc<dyn ObjectStore> = match config.storage.backend {
        StorageBackend::Memory => {
            warn!("Evidence kept in memory only; it will be lost on exit");
            Arc::new(InMemoryObjectStore::new())
        }
        StorageBackend::Filesystem => {
            let dir = config.blobs_dir();
            info!("Evidence storage: {}", dir.display());
            Arc::new(
                FsObjectStore::new(&dir)
                    .await
                    .with_context(|| format!("opening evidence store {}", dir.display()))?,
            )
        }
    };

    let identity: Arc<dyn IdentityDirectory> = match &args.identity_file {
        Some(path) => Arc::new(
            InMemoryIdentity::from_json_file(path)
                .await
                .with_context(|| format!("loading identity file {}", path.display()))?,
        ),
        None => {
            warn!("No identity file; every incident will fail user lookup");
            Arc::new(InMemoryIdentity::new())
        }
    };

    let send_timeout = Duration::from_millis(config.dispatch.send_timeout_ms);
    let (channels, authority) = build_channels(&config.channels, send_timeout)?;

    let app = Lifeline::build(
        config.clone(),
        Collaborators {
            ids: Arc::new(UuidIds),
            identity,
            object_store,
            authority,
            channels,
        },
    )
    .context("wiring services")?;
    let app = Arc::new(app);
    let _background = app.spawn_background_tasks();

    let server = Arc::new(HttpServer::new(app, config.listen));
    tokio::select! {
        result = server.run() => {
            result.context("HTTP server")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }
    Ok(())
}

fn build_channels(
    endpoints: &ChannelEndpoints,
    timeout: Duration,
) -> anyhow::Result<(ChannelSet, Arc<dyn AuthorityNotifier>)> {
    let webhook = |url: &String| -> anyhow::Result<Arc<WebhookChannel>> {
        let channel = WebhookChannel::new(url.clone(), timeout)
            .with_context(|| format!("webhook {url}"))?;
        info!("Webhook channel: {}", url);
        Ok(Arc::new(channel))
    };

    let mut channels = ChannelSet::default();
    if let Some(url) = &endpoints.push_url {
        channels.push = Some(webhook(url)?);
    }
    if let Some(url) = &endpoints.sms_url {
        channels.sms = Some(webhook(url)?);
    }
    if let Some(url) = &endpoints.mesh_url {
        channels.mesh = Some(webhook(url)?);
    }
    if channels.push.is_none() && channels.sms.is_none() && channels.mesh.is_none() {
        warn!("No notification channels configured; responders will not be reached");
    }

    let authority: Arc<dyn AuthorityNotifier> = match &endpoints.authority_url {
        Some(url) => webhook(url)?,
        None => Arc::new(LoggingAuthority),
    };
    Ok((channels, authority))
}
