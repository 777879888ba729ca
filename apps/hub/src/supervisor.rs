//! Bundler supervisor (§4.2.1 spawn/stop/health-probe): owns the child process handles the
//! registry deliberately doesn't (`tokio::process::Child` isn't `Clone`), spawns instances with a
//! port allocated from the configured range, captures their stdout/stderr as `LogEvent`s, and
//! periodically probes each non-stopped instance's JSON-RPC surface for liveness.

use crate::config::AppConfig;
use crate::logs::LogStore;
use crate::metrics::HubTelemetry;
use crate::registry::{BundlerStatus, InstancePolicy, NewInstance, Registry};
use anyhow::{Context, Result};
use chain::{LogEvent, Severity};
use std::collections::HashMap;
use std::net::TcpListener as StdTcpListener;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const CHILD_KILL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SpawnRequest {
    pub id: String,
    pub label: String,
    pub wallet_private_key: Option<String>,
    pub policy: InstancePolicy,
}

pub struct Supervisor {
    cfg: Arc<AppConfig>,
    registry: Arc<Registry>,
    logs: Arc<LogStore>,
    telemetry: HubTelemetry,
    children: Mutex<HashMap<String, Child>>,
}

impl Supervisor {
    pub fn new(cfg: Arc<AppConfig>, registry: Arc<Registry>, logs: Arc<LogStore>, telemetry: HubTelemetry) -> Self {
        Self {
            cfg,
            registry,
            logs,
            telemetry,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates a free port in the configured range, writes a merged bundler config file,
    /// launches the child, and registers it (§4.2.1 *spawn*).
    pub async fn spawn(&self, req: SpawnRequest) -> Result<()> {
        let port = self.allocate_port().context("no free port in spawn range")?;
        let rpc_url = format!("http://127.0.0.1:{port}/rpc");

        let instance_dir = self.cfg.data_dir.join("bundlers").join(&req.id);
        tokio::fs::create_dir_all(&instance_dir)
            .await
            .context("create bundler instance dir")?;
        let config_path = instance_dir.join("bundler.config.json");

        let config_json = serde_json::json!({
            "instanceId": req.id,
            "bindAddr": format!("127.0.0.1:{port}"),
            "chainRpcUrl": self.cfg.chain_rpc_url,
            "entryPoint": format!("{:#x}", self.cfg.entry_point),
            "strict": req.policy.strict,
            "bundlingIntervalMs": self.cfg.base_bundler_config.bundling_interval_ms,
            "mempoolSizeTrigger": self.cfg.base_bundler_config.mempool_size_trigger,
            "bundleGasLimit": self.cfg.base_bundler_config.bundle_gas_limit,
            "hubIngestUrl": format!("http://{}", self.cfg.bind_addr),
        });
        tokio::fs::write(&config_path, serde_json::to_vec_pretty(&config_json)?)
            .await
            .context("write bundler.config.json")?;

        let wallet_key = req
            .wallet_private_key
            .or_else(|| self.cfg.base_bundler_config.wallet_private_key.clone())
            .context("no wallet private key configured for spawn")?;

        let mut command = Command::new(self.resolve_bundler_executable()?);
        command
            .env("BUNDLER_INSTANCE_ID", &req.id)
            .env("BUNDLER_BIND_ADDR", format!("127.0.0.1:{port}"))
            .env("BUNDLER_CHAIN_RPC_URL", &self.cfg.chain_rpc_url)
            .env("BUNDLER_ENTRY_POINT", format!("{:#x}", self.cfg.entry_point))
            .env("BUNDLER_STRICT", req.policy.strict.to_string())
            .env("BUNDLER_WALLET_PRIVATE_KEY", wallet_key)
            .env(
                "BUNDLER_HUB_INGEST_URL",
                format!("http://{}", self.cfg.bind_addr),
            )
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().context("spawn bundler child process")?;
        self.capture_output(&req.id, &mut child);

        self.registry.upsert(NewInstance {
            id: req.id.clone(),
            label: req.label,
            rpc_url,
            policy: req.policy,
            spawned: true,
            config_path: Some(config_path),
        });

        self.children.lock().await.insert(req.id, child);
        Ok(())
    }

    /// Registers an externally-run bundler instance without spawning a process (§4.2.1
    /// *register*).
    pub fn register(&self, id: String, label: String, rpc_url: String, policy: InstancePolicy) {
        self.registry.upsert(NewInstance {
            id,
            label,
            rpc_url,
            policy,
            spawned: false,
            config_path: None,
        });
    }

    /// Waits up to 5 seconds for the child to exit on its own, then force-kills it (§5
    /// Cancellation "graceful termination first, force kill after 5 seconds"). Sending an actual
    /// SIGTERM would need a signal-sending crate this workspace's dependency stack doesn't carry;
    /// this grace window still gives an already-exiting child room to finish.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let mut children = self.children.lock().await;
        if let Some(mut child) = children.remove(id) {
            if tokio::time::timeout(CHILD_KILL_TIMEOUT, child.wait()).await.is_err() {
                let _ = child.kill().await;
            }
        }
        self.registry.update_status(id, BundlerStatus::Stopped);
        Ok(())
    }

    pub fn unregister(&self, id: &str) -> bool {
        self.registry.remove(id).is_some()
    }

    /// Probes every non-STOPPED instance's `clientVersion` method, transitioning UP/DOWN and
    /// bumping lastSeen (§4.2.1 *health probe*).
    pub async fn health_probe_once(&self, http: &reqwest::Client) {
        for instance in self.registry.list_public() {
            if instance.status == BundlerStatus::Stopped {
                continue;
            }
            let start = std::time::Instant::now();
            let body = serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "clientVersion",
                "params": []
            });
            let up = http
                .post(&instance.rpc_url)
                .json(&body)
                .timeout(Duration::from_secs(3))
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false);

            self.telemetry.bundler_health_check(up);
            self.telemetry.health_probe_ms(start.elapsed().as_millis() as u64);
            self.registry
                .update_status(&instance.id, if up { BundlerStatus::Up } else { BundlerStatus::Down });
        }
    }

    pub async fn run_health_probe_loop(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let http = reqwest::Client::new();
        let mut ticker = tokio::time::interval(self.cfg.health_probe_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            self.health_probe_once(&http).await;
        }
    }

    /// Resolves the bundler binary to launch: an explicitly configured path takes precedence,
    /// otherwise the hub looks for a `bundler` binary next to its own executable (the layout
    /// `cargo build --workspace` produces, since the hub and bundler are separate binary crates
    /// in the same workspace target directory).
    fn resolve_bundler_executable(&self) -> Result<std::path::PathBuf> {
        if let Some(path) = &self.cfg.bundler_executable {
            return Ok(path.clone());
        }
        let exe_name = if cfg!(windows) { "bundler.exe" } else { "bundler" };
        let sibling = std::env::current_exe()
            .context("resolve current executable")?
            .parent()
            .context("executable has no parent directory")?
            .join(exe_name);
        if !sibling.exists() {
            anyhow::bail!(
                "bundler executable not found at {}; set HUB_BUNDLER_EXECUTABLE to override",
                sibling.display()
            );
        }
        Ok(sibling)
    }

    fn allocate_port(&self) -> Option<u16> {
        for port in self.cfg.spawn_port_range.clone() {
            if StdTcpListener::bind(("127.0.0.1", port)).is_ok() {
                return Some(port);
            }
        }
        None
    }

    fn capture_output(&self, id: &str, child: &mut Child) {
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(id.to_string(), stdout, Severity::Info, self.logs.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(id.to_string(), stderr, Severity::Error, self.logs.clone());
        }
    }
}

/// A line that already parses as a structured `LogEvent` was emitted by the bundler's own
/// `observability` module, which ships it to `/logs/ingest` directly when `hubIngestUrl` is
/// configured (which `spawn` always sets). Ingesting it again here would double-count every
/// structured event the child emits, so such lines are dropped; only unstructured stdout/stderr
/// text (panics, library chatter that bypasses the bundler's own logger) gets wrapped and
/// ingested (§4.2.1).
fn spawn_line_reader(
    instance_id: String,
    pipe: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    default_level: Severity,
    logs: Arc<LogStore>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if serde_json::from_str::<LogEvent>(&line).is_ok() {
                continue;
            }
            logs.ingest(LogEvent::new(&instance_id, default_level, line));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdout_lines_that_parse_as_log_events_are_dropped_to_avoid_double_ingestion() {
        let raw = serde_json::json!({
            "timestamp": 1,
            "level": "WARN",
            "service": "bundler-1",
            "message": "intent rejected"
        })
        .to_string();
        assert!(
            serde_json::from_str::<LogEvent>(&raw).is_ok(),
            "a structured line must be recognized so the line-reader can drop it"
        );
    }

    #[test]
    fn plain_text_stdout_line_falls_back_to_a_wrapped_event() {
        let line = "panic: out of memory".to_string();
        let event = serde_json::from_str::<LogEvent>(&line)
            .unwrap_or_else(|_| LogEvent::new("bundler-1", Severity::Error, line.clone()));
        assert_eq!(event.message, line);
        assert_eq!(event.level, Severity::Error);
    }

    /// The hub hands the spawned bundler a bare base URL; `Observability::ship` (the consumer of
    /// `BUNDLER_HUB_INGEST_URL`/`hubIngestUrl`) is the only place that appends `/logs/ingest`, so
    /// this value must never carry that suffix itself or the bundler would POST to
    /// `.../logs/ingest/logs/ingest`.
    #[test]
    fn hub_ingest_url_handed_to_the_child_has_no_logs_ingest_suffix() {
        let bind_addr = "127.0.0.1:8080";
        let url = format!("http://{bind_addr}");
        assert!(!url.ends_with("/logs/ingest"));
    }
}

