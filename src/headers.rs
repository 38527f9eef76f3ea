use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Desktop user agents sampled from real browser traffic.
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) SamsungBrowser/25.0 Chrome/121.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/127.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/127.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/109.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:128.0) Gecko/20100101 Firefox/128.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36 OPR/112.0.0.0",
    "Mozilla/5.0 (X11; CrOS x86_64 14541.0.0) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 6.1; Win64; x64; rv:109.0) Gecko/20100101 Firefox/115.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/127.0.0.0 Safari/537.36 Edg/127.0.0.0",
];

/// Request headers presented to search providers and result pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderSet {
    pub user_agent: String,
    pub extra: Vec<(String, String)>,
}

impl HeaderSet {
    /// Browser-like header set around the given user agent.
    pub fn browser_like(user_agent: &str) -> HeaderSet {
        HeaderSet {
            user_agent: user_agent.to_string(),
            extra: vec![
                ("upgrade-insecure-requests".into(), "1".into()),
                (
                    "accept".into(),
                    "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,image/apng,*/*;q=0.8".into(),
                ),
                ("accept-language".into(), "en-US,en;q=0.9".into()),
            ],
        }
    }

    pub fn to_header_map(&self) -> reqwest::header::HeaderMap {
        use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};

        let mut headers = HeaderMap::new();
        if let Ok(ua) = HeaderValue::from_str(&self.user_agent) {
            headers.insert(USER_AGENT, ua);
        }
        for (k, v) in &self.extra {
            if let (Ok(k), Ok(v)) = (
                HeaderName::from_bytes(k.as_bytes()),
                HeaderValue::from_str(v),
            ) {
                headers.insert(k, v);
            }
        }
        headers
    }
}

/// Hands out a header profile per outgoing request or page context.
pub trait HeaderProfileProvider: Send + Sync {
    fn next(&self) -> HeaderSet;
}

pub struct RandomHeaderProfiles {
    agents: Vec<String>,
    rng: Mutex<StdRng>,
}

impl RandomHeaderProfiles {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            agents: USER_AGENTS.iter().map(|s| s.to_string()).collect(),
            rng: Mutex::new(rng),
        }
    }
}

impl Default for RandomHeaderProfiles {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderProfileProvider for RandomHeaderProfiles {
    fn next(&self) -> HeaderSet {
        let idx = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            rng.random_range(0..self.agents.len())
        };
        HeaderSet::browser_like(&self.agents[idx])
    }
}

pub struct RoundRobinHeaderProfiles {
    agents: Vec<String>,
    cursor: AtomicUsize,
}

impl RoundRobinHeaderProfiles {
    pub fn new(agents: Vec<String>) -> Self {
        let agents = if agents.is_empty() {
            USER_AGENTS.iter().map(|s| s.to_string()).collect()
        } else {
            agents
        };
        Self {
            agents,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl HeaderProfileProvider for RoundRobinHeaderProfiles {
    fn next(&self) -> HeaderSet {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.agents.len();
        HeaderSet::browser_like(&self.agents[idx])
    }
}
