use clap::Parser;
use hyper::Server;
use krin::api::{self, AppState};
use krin::auth::AuthService;
use krin::config::Config;
use krin::crypto::{Algorithm, MasterKey};
use krin::db::Db;
use routerify::RouterService;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::parse();
    let passphrase = match config.read_passphrase() {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "no usable passphrase");
            std::process::exit(1);
        }
    };

    std::fs::create_dir_all(&config.data_dir).expect("data directory");
    let master_path = config.data_dir.join(krin::MASTER_KEY_FILE);
    // Refuse to serve without the master key; nothing is readable.
    let master = match MasterKey::create_or_open(&master_path, &passphrase, Algorithm::Aes256Gcm)
    {
        Ok(k) => Arc::new(k),
        Err(e) => {
            error!(error = %e, "cannot open master key");
            std::process::exit(1);
        }
    };

    let db = Arc::new(
        Db::open(&config.data_dir, master, config.default_quota).expect("open database"),
    );

    let removed = db.store().clean_uploads().unwrap_or(0);
    if removed > 0 {
        info!(removed, "cleaned stale upload temp files");
    }

    let auth = Arc::new(AuthService::new(
        db.clone(),
        config.allow_new_accounts,
        config.auto_approve_new_accounts,
    ));
    let state = Arc::new(AppState {
        db,
        auth,
        limiter: Arc::new(Semaphore::new(config.max_concurrent_requests)),
    });

    let router = api::router(state);
    let service = RouterService::new(router).unwrap();

    let server = Server::bind(&config.address)
        .serve(service)
        .with_graceful_shutdown(shutdown_signal());

    info!(address = %config.address, "serving");
    if let Err(err) = server.await {
        error!(error = %err, "server error");
    }
    info!("shutting down");
}
