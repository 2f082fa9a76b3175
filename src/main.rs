mod analysis;
mod config;
mod crawler;
mod db;
mod dedup;
mod error;
mod extract;
mod pipeline;
mod storage;
mod video;

use std::process::ExitCode;

use anyhow::Context;
use dotenv::dotenv;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, StoreConfig};
use crate::crawler::Fetcher;
use crate::db::PgRecordStore;
use crate::pipeline::Pipeline;
use crate::storage::{MemoryStore, RecordStore, SheetsRecordStore};

async fn open_store(config: &Config) -> anyhow::Result<Box<dyn RecordStore>> {
    let store: Box<dyn RecordStore> = match &config.store {
        StoreConfig::Sheets {
            sheet_id,
            sheet_name,
            access_token,
        } => Box::new(SheetsRecordStore::connect(sheet_id, sheet_name, access_token).await?),
        StoreConfig::Postgres { database_url } => Box::new(PgRecordStore::connect(database_url).await?),
        StoreConfig::Memory => {
            warn!("Using in-memory store, appended rows will not be persisted");
            Box::new(MemoryStore::new())
        }
    };
    Ok(store)
}

async fn setup() -> anyhow::Result<(Config, Pipeline)> {
    let config = Config::from_env().context("invalid configuration")?;
    let store = open_store(&config).await.context("store initialization failed")?;
    let fetcher = Fetcher::from_config(&config).context("failed to build page fetcher")?;
    let pipeline = Pipeline::new(&config, fetcher, store);
    Ok((config, pipeline))
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (config, pipeline) = match setup().await {
        Ok(ready) => ready,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::FAILURE;
        }
    };

    info!(account = %config.account, "Starting run");
    match pipeline.run().await {
        Ok(summary) => {
            summary.log(config.top_n);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(code = e.code(), "{}", e);
            ExitCode::FAILURE
        }
    }
}
