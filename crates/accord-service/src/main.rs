use accord_core::config::EngineConfig;
use accord_core::policy::CompiledPolicy;
use accord_core::storage::LedgerStorageConfig;
use accord_service::{build_router, ServiceConfig, ServiceState};
use clap::{Parser, ValueEnum};
use rust_decimal::Decimal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LedgerStorageMode {
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "accordd", version, about = "Accord posting kernel HTTP service")]
struct Cli {
    /// Socket address to bind, e.g. 127.0.0.1:8090
    #[arg(long, default_value = "127.0.0.1:8090")]
    listen: SocketAddr,
    /// Ledger persistence backend.
    #[arg(long, value_enum, default_value_t = LedgerStorageMode::Memory, env = "ACCORD_LEDGER_STORAGE")]
    ledger_storage: LedgerStorageMode,
    /// PostgreSQL url for ledger persistence; required when ledger-storage=postgres.
    #[arg(long, env = "ACCORD_LEDGER_DATABASE_URL")]
    ledger_database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "ACCORD_LEDGER_PG_MAX_CONNECTIONS")]
    ledger_pg_max_connections: u32,
    /// Path to a TOML engine-configuration file (spec §6); defaults are used if absent.
    #[arg(long, env = "ACCORD_ENGINE_CONFIG")]
    engine_config: Option<PathBuf>,
    /// Path to a JSON array of compiled policies (spec §4.5); an empty pack is
    /// used if absent, which rejects every event for want of an admissible
    /// policy.
    #[arg(long, env = "ACCORD_POLICY_PACK")]
    policy_pack: Option<PathBuf>,
    /// Chart-of-accounts hash component of the reference snapshot (R6, R21).
    #[arg(long, default_value = "genesis", env = "ACCORD_COA_HASH")]
    chart_of_accounts_hash: String,
    /// Role-binding-map hash component of the reference snapshot.
    #[arg(long, default_value = "genesis", env = "ACCORD_ROLE_BINDING_HASH")]
    role_binding_map_hash: String,
    /// Engine-registry version component of the reference snapshot.
    #[arg(long, default_value = "1.0.0", env = "ACCORD_ENGINE_REGISTRY_VERSION")]
    engine_registry_version: String,
    /// Tolerance below which a subledger/control-account residual is
    /// considered reconciled (R17, SL-G4, SL-G5).
    #[arg(long, default_value = "0.01", env = "ACCORD_SUBLEDGER_TOLERANCE")]
    subledger_tolerance: String,
}

fn resolve_ledger_storage(cli: &Cli) -> anyhow::Result<LedgerStorageConfig> {
    match cli.ledger_storage {
        LedgerStorageMode::Memory => Ok(LedgerStorageConfig::Memory),
        LedgerStorageMode::Postgres => {
            let database_url = cli
                .ledger_database_url
                .clone()
                .or_else(|| std::env::var("DATABASE_URL").ok())
                .ok_or_else(|| {
                    anyhow::anyhow!("ledger-storage=postgres requires --ledger-database-url or DATABASE_URL")
                })?;
            Ok(LedgerStorageConfig::Postgres {
                database_url,
                max_connections: cli.ledger_pg_max_connections,
            })
        }
    }
}

fn resolve_engine_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    match &cli.engine_config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            Ok(EngineConfig::from_toml_str(&raw)?)
        }
        None => Ok(EngineConfig::default()),
    }
}

fn resolve_policies(cli: &Cli) -> anyhow::Result<Vec<CompiledPolicy>> {
    match &cli.policy_pack {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&raw)?)
        }
        None => Ok(Vec::new()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "accord_service=info,info".to_string()))
        .init();

    let cli = Cli::parse();
    let subledger_tolerance = Decimal::from_str(&cli.subledger_tolerance)?;
    let config = ServiceConfig {
        ledger_storage: resolve_ledger_storage(&cli)?,
        engine_config: resolve_engine_config(&cli)?,
        policies: resolve_policies(&cli)?,
        chart_of_accounts_hash: cli.chart_of_accounts_hash.clone(),
        role_binding_map_hash: cli.role_binding_map_hash.clone(),
        engine_registry_version: cli.engine_registry_version.clone(),
        subledger_tolerance,
    };

    let state = ServiceState::bootstrap(config).await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("accord-service listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
