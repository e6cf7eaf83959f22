use anyhow::bail;
use cse_core::acp::{AccessControlOperations, AccessControlRule};
use cse_core::CseIdentity;

/// CSE type advertised in the base resource (`cst`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CseType {
    Infrastructure,
    Middle,
    ApplicationService,
}

impl CseType {
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Infrastructure => 1,
            Self::Middle => 2,
            Self::ApplicationService => 3,
        }
    }
}

impl std::str::FromStr for CseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "in" | "in-cse" | "1" => Ok(Self::Infrastructure),
            "mn" | "mn-cse" | "2" => Ok(Self::Middle),
            "asn" | "asn-cse" | "3" => Ok(Self::ApplicationService),
            other => Err(format!("unknown CSE type {other}")),
        }
    }
}

/// A peer CSE this node registers with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCseConfig {
    /// CSE-ID without the leading slash.
    pub cse_id: String,
    /// Resource name of the peer's base.
    pub base_name: String,
    /// Points of access, tried in order.
    pub poa: Vec<String>,
}

/// Node-level configuration for the request engine.
///
/// Lifetimes are in seconds, intervals and timeouts in milliseconds.
#[derive(Debug, Clone)]
pub struct CseConfig {
    pub cse_id: String,
    pub sp_id: String,
    pub cse_base_name: String,
    pub cse_type: CseType,
    pub min_lifetime_secs: u64,
    pub max_lifetime_secs: u64,
    pub default_lifetime_secs: u64,
    /// Rules applied when a target has no policy of its own.
    pub default_acp_rules: Vec<AccessControlRule>,
    pub remote_cses: Vec<RemoteCseConfig>,
    /// How often registrations and self-owned resources are refreshed.
    pub refresh_interval_ms: u64,
    /// Safety margin added on top of the refresh interval.
    pub refresh_offset_ms: u64,
    pub registration_retry_backoff_ms: u64,
    pub default_request_timeout_ms: u64,
    /// Maximum in-flight requests before load shedding.
    pub max_concurrent_requests: u32,
    pub dynamic_authorization: bool,
    /// Tick driving batched notification flushes.
    pub event_tick_interval_ms: u64,
    pub expiration_sweep_interval_ms: u64,
}

impl Default for CseConfig {
    fn default() -> Self {
        Self {
            cse_id: "mn-cse-1".to_string(),
            sp_id: "openmtc.org".to_string(),
            cse_base_name: "onem2m".to_string(),
            cse_type: CseType::Middle,
            min_lifetime_secs: 60,
            max_lifetime_secs: 60 * 60 * 24 * 365,
            default_lifetime_secs: 60 * 60,
            default_acp_rules: vec![AccessControlRule::allow_all(AccessControlOperations::ALL)],
            remote_cses: Vec::new(),
            refresh_interval_ms: 300_000,
            refresh_offset_ms: 60_000,
            registration_retry_backoff_ms: 10_000,
            default_request_timeout_ms: 30_000,
            max_concurrent_requests: 1000,
            dynamic_authorization: false,
            event_tick_interval_ms: 1_000,
            expiration_sweep_interval_ms: 30_000,
        }
    }
}

impl CseConfig {
    #[must_use]
    pub fn identity(&self) -> CseIdentity {
        CseIdentity::new(&self.sp_id, &self.cse_id, &self.cse_base_name)
    }

    #[must_use]
    pub fn min_lifetime(&self) -> chrono::Duration {
        secs(self.min_lifetime_secs)
    }

    #[must_use]
    pub fn max_lifetime(&self) -> chrono::Duration {
        secs(self.max_lifetime_secs)
    }

    #[must_use]
    pub fn default_lifetime(&self) -> chrono::Duration {
        secs(self.default_lifetime_secs)
    }

    /// Checks the configuration for contradictions.
    ///
    /// # Errors
    ///
    /// Returns an error if identifiers are empty or lifetimes are out of order.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cse_id.trim_start_matches('/').is_empty() || self.sp_id.is_empty() {
            bail!("cse_id and sp_id must not be empty");
        }
        if self.cse_base_name.is_empty() || self.cse_base_name.contains('/') {
            bail!("invalid base name {:?}", self.cse_base_name);
        }
        if self.min_lifetime_secs > self.max_lifetime_secs {
            bail!(
                "min_lifetime ({}s) exceeds max_lifetime ({}s)",
                self.min_lifetime_secs,
                self.max_lifetime_secs
            );
        }
        if self.refresh_interval_ms == 0 || self.event_tick_interval_ms == 0 {
            bail!("refresh and tick intervals must be positive");
        }
        if let Some(peer) = self.remote_cses.iter().find(|p| p.poa.is_empty()) {
            bail!("peer {} has no point of access", peer.cse_id);
        }
        Ok(())
    }
}

fn secs(value: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1000))
}
