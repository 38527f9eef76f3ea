use std::path::Path;
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::data_models::{ProxyEndpoint, ProxyProtocol};
use crate::error::ConfigurationError;

/// Validated proxy endpoints for one run.
///
/// Selection is uniform and memoryless: a proxy that failed on the previous
/// task is just as likely to be picked for the next one.
pub struct ProxyRegistry {
    enabled: bool,
    pool: Vec<ProxyEndpoint>,
    rng: Mutex<StdRng>,
}

impl ProxyRegistry {
    pub fn disabled() -> ProxyRegistry {
        ProxyRegistry {
            enabled: false,
            pool: Vec::new(),
            rng: Mutex::new(StdRng::seed_from_u64(0)),
        }
    }

    /// Keeps only validated endpoints. Fails when proxying is enabled and
    /// nothing survives, so the problem surfaces before any task runs.
    pub fn new(
        endpoints: Vec<ProxyEndpoint>,
        enabled: bool,
    ) -> Result<ProxyRegistry, ConfigurationError> {
        let pool: Vec<ProxyEndpoint> = endpoints.into_iter().filter(|p| p.validated).collect();
        if enabled && pool.is_empty() {
            return Err(ConfigurationError::NoValidatedProxies);
        }
        Ok(ProxyRegistry {
            enabled,
            pool,
            rng: Mutex::new(StdRng::from_os_rng()),
        })
    }

    /// Fix the selection sequence, for reproducible runs.
    pub fn with_seed(self, seed: u64) -> ProxyRegistry {
        ProxyRegistry {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    pub fn select_proxy(&self) -> Option<ProxyEndpoint> {
        if !self.enabled || self.pool.is_empty() {
            return None;
        }
        let idx = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            rng.random_range(0..self.pool.len())
        };
        Some(self.pool[idx].clone())
    }

    /// Reads a proxy list: either a JSON array of endpoints, or one
    /// `protocol://host:port` per line (blank lines and `#` comments skipped).
    pub fn load(path: &Path) -> Result<Vec<ProxyEndpoint>, ConfigurationError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigurationError::ProxyList {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse_list(&raw).map_err(|reason| ConfigurationError::ProxyList {
            path: path.to_path_buf(),
            reason,
        })
    }

    pub fn parse_list(raw: &str) -> Result<Vec<ProxyEndpoint>, String> {
        if raw.trim_start().starts_with('[') {
            return serde_json::from_str(raw).map_err(|e| e.to_string());
        }

        let mut endpoints = Vec::new();
        for (lineno, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let endpoint =
                parse_proxy_line(line).map_err(|e| format!("line {}: {e}", lineno + 1))?;
            endpoints.push(endpoint);
        }
        Ok(endpoints)
    }
}

fn parse_proxy_line(line: &str) -> Result<ProxyEndpoint, String> {
    let (scheme, rest) = line
        .split_once("://")
        .ok_or_else(|| format!("expected protocol://host:port, got {line:?}"))?;
    let protocol: ProxyProtocol = scheme.parse().map_err(|e: ConfigurationError| e.to_string())?;
    let (host, port) = rest
        .trim_end_matches('/')
        .rsplit_once(':')
        .ok_or_else(|| format!("missing port in {line:?}"))?;
    if host.is_empty() {
        return Err(format!("missing host in {line:?}"));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| format!("invalid port in {line:?}"))?;
    Ok(ProxyEndpoint::new(protocol, host, port))
}
