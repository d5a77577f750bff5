//! Loads counters into the fast store before an on-sale:
//! `seed-inventory demos/inventory.json`

use anyhow::{bail, Context};
use serde::Deserialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use turnstile_core::repository::CounterStore;
use turnstile_shared::InventoryCounter;
use turnstile_store::app_config::Config;
use turnstile_store::RedisClient;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeedCategory {
    event_id: String,
    category_id: String,
    total: i64,
    #[serde(default)]
    sold: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let Some(path) = std::env::args().nth(1) else {
        bail!("usage: seed-inventory <file.json>");
    };
    let raw = std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path))?;
    let categories: Vec<SeedCategory> =
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path))?;

    let config = Config::load().context("Failed to load config")?;
    let redis = RedisClient::new(&config.redis.url(), &config.redis.key_prefix)
        .await
        .context("Failed to connect to Redis")?;

    for category in &categories {
        if category.total < 0 || category.sold < 0 || category.sold > category.total {
            bail!(
                "Invalid figures for {}:{} (total {}, sold {})",
                category.event_id,
                category.category_id,
                category.total,
                category.sold
            );
        }
        let counter = InventoryCounter::seeded(&category.event_id, &category.category_id, category.total, category.sold);
        redis.seed(&counter).await?;
        tracing::info!(
            "Seeded {}:{} with {} available",
            counter.event_id,
            counter.category_id,
            counter.available
        );
    }

    tracing::info!("Seeded {} categories", categories.len());
    Ok(())
}
