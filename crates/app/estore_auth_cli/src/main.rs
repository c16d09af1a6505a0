// Import and re-export the `error` module
pub use self::error::{Error, Result};
mod error;

use std::time::Duration;

use clap::Parser;
use cli::{Cli, Commands, DbArgs};
use estore_auth::config::{SessionConfig, persist_jwt_secret};
use estore_auth::ids::random_token;
use estore_auth::{SessionManager, migrate};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

mod cli;
mod logging;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    logging::init()?;

    let args = Cli::parse();

    match args.command {
        Commands::Migrate(db) => {
            let pool = connect(&db).await?;
            info!("running database migrations");
            migrate::migrate(&pool).await?;
            info!("migrations applied");
        }
        Commands::Sweep(db) => {
            let config = SessionConfig::from_env()?;
            let pool = connect(&db).await?;
            let report = SessionManager::postgres(pool, config).sweep().await?;
            info!(
                refresh_tokens = report.refresh_tokens_removed,
                revocations = report.revocations_purged,
                "sweep complete"
            );
            println!(
                "removed {} refresh tokens, {} revocation entries",
                report.refresh_tokens_removed, report.revocations_purged
            );
        }
        Commands::GenSecret { length, persist } => {
            if length < 32 {
                return Err(Error::Custom("secret length must be at least 32".into()));
            }
            let secret = random_token(length);
            if persist {
                let path = persist_jwt_secret(&secret)?;
                info!(path = %path.display(), "JWT secret written");
            }
            println!("{secret}");
        }
        Commands::Version => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            println!("estore_auth {}", estore_auth::version());
        }
    }

    Ok(())
}

async fn connect(db: &DbArgs) -> Result<PgPool> {
    info!(max_connections = db.max_connections, "connecting to database");
    let pool = PgPoolOptions::new()
        .max_connections(db.max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&db.database_url)
        .await?;
    Ok(pool)
}
