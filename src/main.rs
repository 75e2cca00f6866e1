use clap::Parser;
use kubepulse::config::ServeArgs;
use kubepulse::engine::Engine;
use kubepulse::k8s::client_manager::KubeClientFactory;
use kubepulse::k8s::credentials::FileConfigStore;
use kubepulse::k8s::kinds::KindTable;
use kubepulse::server;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube's TLS stack needs a process-wide rustls provider
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let args = ServeArgs::parse();
    info!(
        "⚙️  {} v{}: tenant configs in {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        args.config_dir.display()
    );

    let engine = Engine::new(
        args.sync_config(),
        Arc::new(FileConfigStore::new(&args.config_dir)),
        Arc::new(KubeClientFactory::default()),
        KindTable::standard(),
    );

    server::serve(engine, args.listen).await?;
    Ok(())
}
