use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use service::Service;

mod config;
mod http_objects;
mod poller;
mod routes;
mod service;
mod tracing;
use tracing::setup_tracing;

#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,

    /// Print the OpenAPI document and exit
    #[arg(long)]
    print_openapi: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.print_openapi {
        use utoipa::OpenApi;

        let spec = routes::ApiDoc::openapi()
            .to_pretty_json()
            .context("generating openapi document")?;
        println!("{}", spec);
        return Ok(());
    }

    let mut config = config::ServerConfig::load(cli.config.as_deref())
        .context("loading server configuration")?;
    let instance_id = config.instance_id();
    config.instance_id = Some(instance_id.clone());

    let tracing_guard = setup_tracing(&config, &instance_id)?;
    ::tracing::info!(
        instance_id = instance_id.as_str(),
        exporting_spans = tracing_guard.exporting(),
        "tracing initialized"
    );

    let result = start_thopter(config).await;
    tracing_guard.shutdown();
    result
}

#[::tracing::instrument(name = "thopter", skip(config), fields(env = config.env, instance = config.instance_id()))]
async fn start_thopter(config: config::ServerConfig) -> anyhow::Result<()> {
    let service = Service::new(config).context("Failed to create service")?;
    service.start().await.context("Failed to start service")
}
