use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "estore-auth", version, about = "eStore session store operations")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Apply the embedded schema migrations.
    Migrate(DbArgs),

    /// Delete expired refresh tokens and revocation entries once.
    Sweep(DbArgs),

    /// Print a fresh JWT signing secret.
    GenSecret {
        /// Secret length in characters.
        #[arg(long, default_value_t = estore_auth::config::JWT_SECRET_LEN)]
        length: usize,

        /// Also write it to the secret file, replacing the current one.
        #[arg(long)]
        persist: bool,
    },

    /// Print version information.
    Version,
}

#[derive(Args, Debug)]
pub struct DbArgs {
    /// PostgreSQL connection URL.
    #[arg(
        long,
        env = "DATABASE_URL",
        default_value = "postgres://localhost:5432/estore"
    )]
    pub database_url: String,

    /// Maximum number of database connections in the pool.
    #[arg(long, default_value_t = 2)]
    pub max_connections: u32,
}
