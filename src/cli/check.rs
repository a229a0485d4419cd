//! The `check` subcommand: validate config and reachability, then exit.

use tracing::info;

use crate::app::Config;
use crate::cli::Cli;
use crate::core::keys::{KeyStore, RedisStore};
use crate::error::Result;

/// Validate the configuration and probe the key store.
///
/// Exit code semantics come from the error kinds: a bad config maps to 1,
/// an unreachable key store to 2.
pub async fn check(cli: &Cli) -> Result<()> {
    let config = cli.load_config()?;
    config.logging.init();

    println!("config: ok ({})", cli.config.display());
    println!("exchange: {}", config.exchange.effective_exchange_id());

    if config.keys.use_memory_store {
        println!("key store: memory");
    } else {
        let store = RedisStore::connect(&config.keys.redis_url()).await?;
        store.ping().await?;
        println!(
            "key store: redis ok ({}:{})",
            config.keys.redis_host, config.keys.redis_port
        );
    }

    println!("streams: {}", config.streams.len());
    println!("strategies: {}", config.strategies.len());
    info!("check passed");
    Ok(())
}
