//! `cse-node`: runs one CSE with the HTTP binding.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context as _};
use clap::{Parser, ValueEnum};
use cse_core::Privileges;
use cse_server::network::{NetworkConfig, NetworkModule, TlsConfig};
use cse_server::service::{CseConfig, CseType, RemoteCseConfig};
use cse_server::CseNode;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "cse-node", about = "oneM2M common services entity", version)]
struct Args {
    #[arg(long, env = "CSE_ID", default_value = "mn-cse-1")]
    cse_id: String,
    #[arg(long, env = "CSE_SP_ID", default_value = "openmtc.org")]
    sp_id: String,
    #[arg(long, env = "CSE_BASE_NAME", default_value = "onem2m")]
    base_name: String,
    /// `in`, `mn` or `asn`.
    #[arg(long, env = "CSE_TYPE", default_value = "mn")]
    cse_type: CseType,

    #[arg(long, env = "CSE_HOST", default_value = "0.0.0.0")]
    host: String,
    #[arg(long, env = "CSE_PORT", default_value_t = 8000)]
    port: u16,
    /// Host peers use to reach this node when no `--poa` is given.
    #[arg(long, env = "CSE_ADVERTISE_HOST", default_value = "127.0.0.1")]
    advertise_host: String,
    /// Points of access advertised to peers.
    #[arg(long, env = "CSE_POA", value_delimiter = ',')]
    poa: Vec<String>,
    #[arg(long, env = "CSE_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,
    #[arg(long, env = "CSE_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,
    #[arg(long, env = "CSE_CORS_ORIGINS", value_delimiter = ',', default_value = "*")]
    cors_origins: Vec<String>,

    /// Peer CSE: `<cse-id>[/<base-name>]=<poa>[,<poa>]`; repeatable.
    #[arg(long = "peer", env = "CSE_PEERS", value_delimiter = ';', value_parser = parse_peer)]
    peers: Vec<RemoteCseConfig>,

    #[arg(long, env = "CSE_MIN_LIFETIME_SECS", default_value_t = 60)]
    min_lifetime_secs: u64,
    #[arg(long, env = "CSE_MAX_LIFETIME_SECS", default_value_t = 60 * 60 * 24 * 365)]
    max_lifetime_secs: u64,
    #[arg(long, env = "CSE_DEFAULT_LIFETIME_SECS", default_value_t = 60 * 60)]
    default_lifetime_secs: u64,
    #[arg(long, env = "CSE_REFRESH_INTERVAL_MS", default_value_t = 300_000)]
    refresh_interval_ms: u64,
    #[arg(long, env = "CSE_REFRESH_OFFSET_MS", default_value_t = 60_000)]
    refresh_offset_ms: u64,
    #[arg(long, env = "CSE_REGISTRATION_RETRY_MS", default_value_t = 10_000)]
    registration_retry_backoff_ms: u64,
    #[arg(long, env = "CSE_REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    request_timeout_ms: u64,
    #[arg(long, env = "CSE_MAX_CONCURRENT_REQUESTS", default_value_t = 1000)]
    max_concurrent_requests: u32,
    /// Rules for targets without a policy, as a `pv` value, e.g.
    /// `{"acr":[{"acor":["all"],"acop":63}]}`. Defaults to allowing everyone.
    #[arg(long, env = "CSE_DEFAULT_ACP", value_parser = parse_privileges)]
    default_acp: Option<Privileges>,
    #[arg(long, env = "CSE_DYNAMIC_AUTHORIZATION")]
    dynamic_authorization: bool,
    #[arg(long, env = "CSE_EVENT_TICK_MS", default_value_t = 1_000)]
    event_tick_interval_ms: u64,
    #[arg(long, env = "CSE_EXPIRATION_SWEEP_MS", default_value_t = 30_000)]
    expiration_sweep_interval_ms: u64,

    #[arg(long, env = "CSE_LOG_FORMAT", value_enum, default_value = "pretty")]
    log_format: LogFormat,
    /// Prometheus scrape endpoint, e.g. `0.0.0.0:9100`.
    #[arg(long, env = "CSE_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

fn parse_peer(value: &str) -> Result<RemoteCseConfig, String> {
    let (name, poa) = value
        .split_once('=')
        .ok_or_else(|| format!("expected <cse-id>=<poa>, got {value:?}"))?;
    let name = name.trim().trim_start_matches('/');
    let (cse_id, base_name) = name.split_once('/').unwrap_or((name, "onem2m"));
    let poa: Vec<String> = poa
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_owned)
        .collect();
    if cse_id.is_empty() || poa.is_empty() {
        return Err(format!("peer {value:?} needs a CSE-ID and at least one point of access"));
    }
    Ok(RemoteCseConfig {
        cse_id: cse_id.to_owned(),
        base_name: base_name.to_owned(),
        poa,
    })
}

fn parse_privileges(value: &str) -> Result<Privileges, String> {
    let json: serde_json::Value = serde_json::from_str(value).map_err(|e| e.to_string())?;
    let privileges = Privileges::from_value(&json).map_err(|e| e.to_string())?;
    if privileges.rules.is_empty() {
        return Err("the default policy needs at least one rule".into());
    }
    Ok(privileges)
}

impl Args {
    fn cse_config(&self) -> CseConfig {
        let defaults = CseConfig::default();
        CseConfig {
            cse_id: self.cse_id.clone(),
            sp_id: self.sp_id.clone(),
            cse_base_name: self.base_name.clone(),
            cse_type: self.cse_type,
            min_lifetime_secs: self.min_lifetime_secs,
            max_lifetime_secs: self.max_lifetime_secs,
            default_lifetime_secs: self.default_lifetime_secs,
            default_acp_rules: self
                .default_acp
                .as_ref()
                .map_or(defaults.default_acp_rules, |pv| pv.rules.clone()),
            remote_cses: self.peers.clone(),
            refresh_interval_ms: self.refresh_interval_ms,
            refresh_offset_ms: self.refresh_offset_ms,
            registration_retry_backoff_ms: self.registration_retry_backoff_ms,
            default_request_timeout_ms: self.request_timeout_ms,
            max_concurrent_requests: self.max_concurrent_requests,
            dynamic_authorization: self.dynamic_authorization,
            event_tick_interval_ms: self.event_tick_interval_ms,
            expiration_sweep_interval_ms: self.expiration_sweep_interval_ms,
            ..defaults
        }
    }

    fn network_config(&self) -> anyhow::Result<NetworkConfig> {
        let tls = match (&self.tls_cert, &self.tls_key) {
            (Some(cert_path), Some(key_path)) => Some(TlsConfig {
                cert_path: cert_path.clone(),
                key_path: key_path.clone(),
            }),
            (None, None) => None,
            _ => bail!("--tls-cert and --tls-key go together"),
        };
        Ok(NetworkConfig {
            host: self.host.clone(),
            port: self.port,
            tls,
            cors_origins: self.cors_origins.clone(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            ..NetworkConfig::default()
        })
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    if let Some(addr) = args.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install the Prometheus exporter")?;
        tracing::info!(%addr, "metrics exporter listening");
    }

    let network_config = args.network_config()?;
    let own_poa = if args.poa.is_empty() {
        vec![network_config.point_of_access(&args.advertise_host)]
    } else {
        args.poa.clone()
    };

    let mut node = CseNode::builder(args.cse_config())
        .own_poa(own_poa)
        .start()
        .await?;

    let mut network = NetworkModule::new(network_config, node.pipeline(), &node.config().cse_id);
    network.start().await?;
    let result = network
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("shutdown requested");
        })
        .await;

    node.stop(false).await;
    result
}
