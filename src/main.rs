//! redis-proxy entry point.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use redis_proxy::proxy::{watch_signals, ConfigLoader, FileConfigLoader, Proxy, StaticConfigLoader};

#[derive(Parser)]
#[command(
    name = "redis-proxy",
    version,
    about = "Transparent RESP proxy with live uplink switching"
)]
struct Args {
    /// Config file path, or "-" to read the config from stdin
    #[arg(short = 'f', long = "config", default_value = "config.json")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("redis_proxy=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let loader: Arc<dyn ConfigLoader> = if args.config == "-" {
        // Stdin can only be consumed once; reloads re-validate the same
        // document.
        Arc::new(StaticConfigLoader::from_reader(std::io::stdin())?)
    } else {
        Arc::new(FileConfigLoader::new(&args.config))
    };

    let mut proxy = Proxy::new(loader).await?;
    proxy.start().await?;

    tokio::spawn(watch_signals(proxy.handle()));

    proxy.join().await;
    info!("proxy stopped");
    Ok(())
}
