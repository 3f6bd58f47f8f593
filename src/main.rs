use jemallocator::Jemalloc;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use meshway::config::Config;
use meshway::server;

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化 tracing
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = Config::load_or_default();
    tracing::info!("Starting gateway server...");
    server::start(config).await?;
    Ok(())
}
