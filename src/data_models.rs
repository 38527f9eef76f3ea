use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Literal written in place of a verdict when a reached page could not be scored.
pub const UNKNOWN_VERDICT: &str = "UNKNOWN";

/// A single search result awaiting evaluation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct SearchCandidate {
    pub title: String,
    pub url: String,
}

impl SearchCandidate {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> SearchCandidate {
        SearchCandidate {
            title: title.into(),
            url: url.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyProtocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks4 => "socks4",
            ProxyProtocol::Socks5 => "socks5",
        }
    }
}

impl FromStr for ProxyProtocol {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(ProxyProtocol::Http),
            "https" => Ok(ProxyProtocol::Https),
            "socks4" => Ok(ProxyProtocol::Socks4),
            "socks5" => Ok(ProxyProtocol::Socks5),
            other => Err(ConfigurationError::invalid(
                "proxy protocol",
                format!("unsupported protocol {other:?}"),
            )),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyEndpoint {
    pub protocol: ProxyProtocol,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub validated: bool,
}

impl ProxyEndpoint {
    pub fn new(protocol: ProxyProtocol, host: impl Into<String>, port: u16) -> ProxyEndpoint {
        ProxyEndpoint {
            protocol,
            host: host.into(),
            port,
            validated: true,
        }
    }

    /// `scheme://host:port`, the form both reqwest and Chromium accept.
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.protocol.scheme(), self.host, self.port)
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Unit of work owned by exactly one worker until it settles.
#[derive(Debug, Clone)]
pub struct EvaluationTask {
    pub candidate: SearchCandidate,
    pub proxy: Option<ProxyEndpoint>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ScoringMode {
    #[default]
    #[value(name = "text")]
    TextOnly,
    #[value(name = "image")]
    ImageOnly,
    #[value(name = "text-image")]
    TextAndImage,
}

impl ScoringMode {
    pub fn uses_text(&self) -> bool {
        matches!(self, ScoringMode::TextOnly | ScoringMode::TextAndImage)
    }

    pub fn uses_image(&self) -> bool {
        matches!(self, ScoringMode::ImageOnly | ScoringMode::TextAndImage)
    }

    /// Text-only scoring has nothing to send when extraction comes back empty.
    pub fn requires_text(&self) -> bool {
        matches!(self, ScoringMode::TextOnly)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Verdict {
    Score(u8),
    Label(String),
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Score(score) => write!(f, "{score}"),
            Verdict::Label(label) => f.write_str(label),
        }
    }
}

/// A verdict, or the `UNKNOWN` sentinel. Serialized as a bare string.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(into = "String", from = "String")]
pub enum Relevance {
    Verdict(Verdict),
    Unknown,
}

impl Relevance {
    pub fn is_unknown(&self) -> bool {
        matches!(self, Relevance::Unknown)
    }

    pub fn verdict(&self) -> Option<&Verdict> {
        match self {
            Relevance::Verdict(verdict) => Some(verdict),
            Relevance::Unknown => None,
        }
    }
}

impl From<Relevance> for String {
    fn from(relevance: Relevance) -> String {
        match relevance {
            Relevance::Verdict(verdict) => verdict.to_string(),
            Relevance::Unknown => UNKNOWN_VERDICT.to_string(),
        }
    }
}

impl From<String> for Relevance {
    fn from(raw: String) -> Relevance {
        if raw == UNKNOWN_VERDICT {
            return Relevance::Unknown;
        }
        match raw.parse::<u8>() {
            Ok(score) => Relevance::Verdict(Verdict::Score(score)),
            Err(_) => Relevance::Verdict(Verdict::Label(raw)),
        }
    }
}

/// The closed set of verdicts the scoring service may answer with.
///
/// Categorical labels are listed most relevant first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerdictScale {
    Numeric { min: u8, max: u8 },
    Categorical(Vec<String>),
}

impl Default for VerdictScale {
    fn default() -> Self {
        VerdictScale::Numeric { min: 1, max: 5 }
    }
}

impl VerdictScale {
    /// Accepts exactly one allowed value, ignoring surrounding whitespace.
    pub fn parse(&self, token: &str) -> Option<Verdict> {
        let token = token.trim();
        match self {
            VerdictScale::Numeric { min, max } => {
                if token.is_empty() || !token.chars().all(|c| c.is_ascii_digit()) {
                    return None;
                }
                let score = token.parse::<u8>().ok()?;
                (*min..=*max).contains(&score).then_some(Verdict::Score(score))
            }
            VerdictScale::Categorical(labels) => labels
                .iter()
                .find(|label| label.eq_ignore_ascii_case(token))
                .map(|label| Verdict::Label(label.clone())),
        }
    }

    pub fn top(&self) -> Verdict {
        match self {
            VerdictScale::Numeric { max, .. } => Verdict::Score(*max),
            VerdictScale::Categorical(labels) => {
                Verdict::Label(labels.first().cloned().unwrap_or_default())
            }
        }
    }

    /// Answer format, phrased for the instruction template.
    pub fn describe(&self) -> String {
        match self {
            VerdictScale::Numeric { min, max } => format!(
                "Your response should be a number from {min} to {max} with {min} being the least relevant and {max} being the most relevant. Only respond with a number and nothing else."
            ),
            VerdictScale::Categorical(labels) => format!(
                "Your response should be exactly one of the following labels, ordered from most to least relevant: {}. Only respond with the label and nothing else.",
                labels.join(", ")
            ),
        }
    }
}

impl FromStr for VerdictScale {
    type Err = ConfigurationError;

    /// `"1-5"` for a numeric range, `"high,medium,low"` for labels.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some((lo, hi)) = s.split_once('-') {
            let (lo, hi) = (lo.trim(), hi.trim());
            if is_digits(lo) && is_digits(hi) {
                let (Ok(min), Ok(max)) = (lo.parse::<u8>(), hi.parse::<u8>()) else {
                    return Err(ConfigurationError::invalid(
                        "scale",
                        format!("range {lo}-{hi} does not fit in 0-255"),
                    ));
                };
                if min > max {
                    return Err(ConfigurationError::invalid("scale", "range is reversed"));
                }
                return Ok(VerdictScale::Numeric { min, max });
            }
        }

        let labels: Vec<String> = s
            .split(',')
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        if labels.is_empty() {
            return Err(ConfigurationError::invalid("scale", "no labels given"));
        }
        if labels.iter().any(|l| l == UNKNOWN_VERDICT) {
            return Err(ConfigurationError::invalid(
                "scale",
                "UNKNOWN is reserved and cannot be a label",
            ));
        }
        // Stored verdicts are bare strings, so a numeric label would reload as a score
        if let Some(label) = labels.iter().find(|l| is_digits(l)) {
            return Err(ConfigurationError::invalid(
                "scale",
                format!("label {label:?} is a number; use a range like 1-5 instead"),
            ));
        }
        Ok(VerdictScale::Categorical(labels))
    }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EvaluationOutcome {
    #[serde(flatten)]
    pub candidate: SearchCandidate,
    pub relevance: Relevance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EvaluationOutcome {
    pub fn scored(candidate: SearchCandidate, verdict: Verdict) -> EvaluationOutcome {
        EvaluationOutcome {
            candidate,
            relevance: Relevance::Verdict(verdict),
            error: None,
        }
    }

    pub fn unknown(candidate: SearchCandidate, error: Option<String>) -> EvaluationOutcome {
        EvaluationOutcome {
            candidate,
            relevance: Relevance::Unknown,
            error,
        }
    }

    pub fn url(&self) -> &str {
        &self.candidate.url
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ResultBatch {
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub query: String,
    pub outcomes: Vec<EvaluationOutcome>,
}

impl ResultBatch {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    /// Outcomes whose verdict equals `threshold` exactly.
    pub fn matching(&self, threshold: &Verdict) -> Vec<&EvaluationOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.relevance.verdict() == Some(threshold))
            .collect()
    }

    pub fn matching_urls(&self, threshold: &Verdict) -> Vec<String> {
        self.matching(threshold)
            .into_iter()
            .map(|o| o.candidate.url.clone())
            .collect()
    }

    /// URLs whose stored relevance matches `raw` as typed by a user:
    /// labels ignore case, `UNKNOWN` selects the unscored outcomes.
    pub fn urls_with_relevance(&self, raw: &str) -> Vec<String> {
        let wanted = Relevance::from(raw.trim().to_string());
        self.outcomes
            .iter()
            .filter(|o| match (&o.relevance, &wanted) {
                (Relevance::Unknown, Relevance::Unknown) => true,
                (Relevance::Verdict(Verdict::Label(have)), Relevance::Verdict(Verdict::Label(want))) => {
                    have.eq_ignore_ascii_case(want)
                }
                (Relevance::Verdict(have), Relevance::Verdict(want)) => have == want,
                _ => false,
            })
            .map(|o| o.candidate.url.clone())
            .collect()
    }

    pub fn urls(&self) -> Vec<String> {
        self.outcomes.iter().map(|o| o.candidate.url.clone()).collect()
    }

    pub fn unknown_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.relevance.is_unknown()).count()
    }
}
