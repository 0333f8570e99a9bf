use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pix2pix_service::{AppConfig, InferencePipeline, build_router, config::device_label};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!(
        ?config.listen_addr,
        device = %device_label(config.device),
        image_size = config.image_size,
        "starting pix2pix service"
    );

    let pipeline = Arc::new(InferencePipeline::new(config.as_ref()));
    if config.eager_init {
        let warm = Arc::clone(&pipeline);
        let iterations = config.warmup_iters;
        tokio::task::spawn_blocking(move || warm.warm_up(iterations)).await??;
    }

    let router = build_router(config.clone(), pipeline);

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "REST server ready");

    axum::serve(listener, router).await?;

    Ok(())
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
