mod api;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use slowpost_core::config::Config;
use slowpost_core::service::LetterService;
use slowpost_core::store::{CloudStore, LetterStore, LocalStore, S3ObjectStore};
use tracing::{error, info};

/// slowpost server — delayed-letter API over local or cloud storage.
#[derive(Parser)]
#[command(name = "slowpost-server")]
struct Args {
    /// Directory for the local letter store and uploaded assets.
    #[arg(long, default_value = "./data", env = "SLOWPOST_DATA_DIR")]
    data_dir: PathBuf,

    /// Port for the HTTP API.
    #[arg(long, default_value = "3001", env = "SLOWPOST_PORT")]
    port: u16,

    /// Address to bind the server to.
    #[arg(long, default_value = "0.0.0.0", env = "SLOWPOST_BIND")]
    bind: String,
}

fn configure_logging() {
    use tracing_subscriber::prelude::*;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_line_number(true)
        .with_target(false)
        .with_file(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    configure_logging();
    let args = Args::parse();
    let config = Config::from_env();

    info!("slowpost-server starting");

    // Storage realization is chosen here, once. A cloud configuration
    // that turns out to be unusable is fatal rather than a silent
    // downgrade to local storage.
    let store: Arc<dyn LetterStore> = match &config.cloud {
        Some(cloud) => {
            info!("Cloud credentials present; using cloud storage");
            let objects = S3ObjectStore::connect(cloud.s3.clone())
                .await
                .unwrap_or_else(|e| {
                    error!("Object store unusable: {e}");
                    std::process::exit(1);
                });
            let store = CloudStore::connect(&cloud.database_url, Arc::new(objects))
                .await
                .unwrap_or_else(|e| {
                    error!("Cloud database unusable: {e}");
                    std::process::exit(1);
                });
            Arc::new(store)
        }
        None => {
            info!(
                "No cloud credentials; using local storage at {}",
                args.data_dir.display()
            );
            let store = LocalStore::open(&args.data_dir).await.unwrap_or_else(|e| {
                error!(
                    "Failed to open local store at {}: {e}",
                    args.data_dir.display()
                );
                std::process::exit(1);
            });
            Arc::new(store)
        }
    };

    let service = Arc::new(LetterService::new(store, config.limits));
    let app = api::build_router(service, &args.data_dir, config.limits);

    let addr = format!("{}:{}", args.bind, args.port);
    info!("Binding to {addr}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {addr}: {e}");
            std::process::exit(1);
        });

    info!("slowpost-server listening on http://{addr}");
    let app = app.into_make_service_with_connect_info::<std::net::SocketAddr>();
    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {e}");
        std::process::exit(1);
    }
}
