//! Two-stage envy/dotenvy config loading (§1a, §6 "Configuration surface"): a raw `Env` struct
//! with defaults, mapped into a validated [`AppConfig`].

use alloy::primitives::Address;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::ops::RangeInclusive;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub data_dir: std::path::PathBuf,
    pub admin_token: String,

    pub chain_rpc_url: String,
    pub entry_point: Address,
    pub paymaster: Address,
    pub router: Option<Address>,
    pub token: Option<Address>,

    pub lookback_blocks: u64,
    pub max_block_range: u64,
    pub indexer_poll_interval: Duration,
    pub reorg_ring_size: usize,

    pub health_probe_interval: Duration,
    pub spawn_port_range: RangeInclusive<u16>,
    pub base_bundler_config: BaseBundlerConfig,
    pub bundler_executable: Option<std::path::PathBuf>,

    pub log_ring_capacity: usize,
    pub active_session_window: Duration,
    pub analytics_cap: usize,
}

/// Defaults merged into every spawned bundler instance's config (§4.2.1 *spawn*).
#[derive(Debug, Clone)]
pub struct BaseBundlerConfig {
    pub wallet_private_key: Option<String>,
    pub bundling_interval_ms: u64,
    pub mempool_size_trigger: usize,
    pub bundle_gas_limit: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Env {
    hub_bind_addr: String,
    hub_data_dir: String,
    hub_admin_token: String,

    hub_chain_rpc_url: String,
    hub_entry_point: String,
    hub_paymaster: String,
    hub_router: String,
    hub_token: String,

    hub_lookback_blocks: u64,
    hub_max_block_range: u64,
    hub_indexer_poll_interval_secs: u64,
    hub_reorg_ring_size: usize,

    hub_health_probe_interval_secs: u64,
    hub_spawn_port_min: u16,
    hub_spawn_port_max: u16,
    hub_bundler_executable: String,

    hub_bundler_wallet_private_key: String,
    hub_bundler_bundling_interval_ms: u64,
    hub_bundler_mempool_size_trigger: usize,
    hub_bundler_bundle_gas_limit: u64,

    hub_log_ring_capacity: usize,
    hub_active_session_window_secs: u64,
    hub_analytics_cap: usize,
}

impl Default for Env {
    fn default() -> Self {
        Self {
            hub_bind_addr: "0.0.0.0:8080".to_string(),
            hub_data_dir: "./data".to_string(),
            hub_admin_token: String::new(),

            hub_chain_rpc_url: String::new(),
            hub_entry_point: String::new(),
            hub_paymaster: String::new(),
            hub_router: String::new(),
            hub_token: String::new(),

            hub_lookback_blocks: 10_000,
            hub_max_block_range: 2_000,
            hub_indexer_poll_interval_secs: 2,
            hub_reorg_ring_size: 256,

            hub_health_probe_interval_secs: 5,
            hub_spawn_port_min: 5100,
            hub_spawn_port_max: 5200,
            hub_bundler_executable: String::new(),

            hub_bundler_wallet_private_key: String::new(),
            hub_bundler_bundling_interval_ms: 2_000,
            hub_bundler_mempool_size_trigger: 10,
            hub_bundler_bundle_gas_limit: 10_000_000,

            hub_log_ring_capacity: 5_000,
            hub_active_session_window_secs: 30,
            hub_analytics_cap: 100_000,
        }
    }
}

pub fn load_config() -> Result<AppConfig> {
    let env: Env = envy::from_env().context("load hub env config")?;

    if env.hub_chain_rpc_url.trim().is_empty() {
        anyhow::bail!("HUB_CHAIN_RPC_URL must be set");
    }
    let entry_point: Address = env
        .hub_entry_point
        .parse()
        .context("HUB_ENTRY_POINT is not a valid address")?;
    let paymaster: Address = env
        .hub_paymaster
        .parse()
        .context("HUB_PAYMASTER is not a valid address")?;
    let router = parse_optional_address(&env.hub_router, "HUB_ROUTER")?;
    let token = parse_optional_address(&env.hub_token, "HUB_TOKEN")?;

    if env.hub_admin_token.trim().is_empty() {
        anyhow::bail!("HUB_ADMIN_TOKEN must be set");
    }
    if env.hub_spawn_port_min > env.hub_spawn_port_max {
        anyhow::bail!("HUB_SPAWN_PORT_MIN must be <= HUB_SPAWN_PORT_MAX");
    }

    Ok(AppConfig {
        bind_addr: env.hub_bind_addr,
        data_dir: std::path::PathBuf::from(env.hub_data_dir),
        admin_token: env.hub_admin_token,

        chain_rpc_url: env.hub_chain_rpc_url,
        entry_point,
        paymaster,
        router,
        token,

        lookback_blocks: env.hub_lookback_blocks,
        max_block_range: env.hub_max_block_range.max(1),
        indexer_poll_interval: Duration::from_secs(env.hub_indexer_poll_interval_secs.max(1)),
        reorg_ring_size: env.hub_reorg_ring_size.max(1),

        health_probe_interval: Duration::from_secs(env.hub_health_probe_interval_secs.max(1)),
        spawn_port_range: env.hub_spawn_port_min..=env.hub_spawn_port_max,
        bundler_executable: if env.hub_bundler_executable.trim().is_empty() {
            None
        } else {
            Some(std::path::PathBuf::from(env.hub_bundler_executable))
        },
        base_bundler_config: BaseBundlerConfig {
            wallet_private_key: if env.hub_bundler_wallet_private_key.trim().is_empty() {
                None
            } else {
                Some(env.hub_bundler_wallet_private_key)
            },
            bundling_interval_ms: env.hub_bundler_bundling_interval_ms.max(1),
            mempool_size_trigger: env.hub_bundler_mempool_size_trigger.max(1),
            bundle_gas_limit: env.hub_bundler_bundle_gas_limit.max(1),
        },

        log_ring_capacity: env.hub_log_ring_capacity.max(1),
        active_session_window: Duration::from_secs(env.hub_active_session_window_secs.max(1)),
        analytics_cap: env.hub_analytics_cap.max(1),
    })
}

fn parse_optional_address(raw: &str, field: &'static str) -> Result<Option<Address>> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .with_context(|| format!("{field} is not a valid address"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_optional_address_parses_to_none() {
        assert!(parse_optional_address("", "HUB_ROUTER").unwrap().is_none());
    }

    #[test]
    fn invalid_optional_address_is_rejected() {
        assert!(parse_optional_address("not-an-address", "HUB_ROUTER").is_err());
    }
}
