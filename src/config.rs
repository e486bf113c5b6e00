//! Process configuration: env vars loaded via `dotenvy`, overridable
//! by CLI flags. No config-file parser — env vars and flags are the
//! whole surface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "substrate-controld", version, about = "Local AI-inference control plane")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the durable store file.
    #[arg(long, env = "SUBSTRATE_DB_PATH", default_value = "substrate.db")]
    pub db_path: PathBuf,

    /// Directory large node outputs are offloaded to.
    #[arg(long, env = "SUBSTRATE_ARTIFACT_DIR", default_value = "artifacts")]
    pub artifact_dir: PathBuf,

    /// Directory `AgentConfigLoader` reads agent graph definitions from.
    #[arg(long, env = "SUBSTRATE_AGENTS_DIR", default_value = "agents")]
    pub agents_dir: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run schema migrations against the configured store and exit.
    Migrate,
    /// Run the full boot sequence: recovery, aging loop, workers, HTTP surface.
    Serve {
        #[arg(long, env = "SUBSTRATE_BIND_ADDR", default_value = "0.0.0.0:8080")]
        bind_addr: String,
    },
}

pub fn load() -> Cli {
    match dotenvy::dotenv() {
        Ok(path) => tracing::debug!(?path, "loaded .env"),
        Err(dotenvy::Error::Io(_)) => {}
        Err(err) => tracing::warn!(%err, "failed to parse .env"),
    }
    Cli::parse()
}
