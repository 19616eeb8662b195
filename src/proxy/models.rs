//! Proxy data models

use crate::error::ProxyError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// How long a check result stays current
pub const STALE_WINDOW_SECS: i64 = 120;

/// Country code used when the source did not report one
pub const UNKNOWN_COUNTRY: &str = "UNKNOWN";

/// Proxy protocol enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Socks4,
    Socks5,
    Http,
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Socks4 => write!(f, "socks4"),
            Protocol::Socks5 => write!(f, "socks5"),
            Protocol::Http => write!(f, "http"),
            Protocol::Https => write!(f, "https"),
        }
    }
}

impl FromStr for Protocol {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "socks4" => Ok(Protocol::Socks4),
            "socks5" => Ok(Protocol::Socks5),
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            other => Err(ProxyError::InvalidArgument(format!(
                "protocols must be one of socks4, socks5, http, https, not {:?}",
                other
            ))),
        }
    }
}

/// Anonymity level reported by a source or decided by the judge probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Anonymity {
    #[serde(rename = "elite")]
    Elite,
    #[serde(rename = "anonymous")]
    Anonymous,
    #[serde(rename = "transparent")]
    Transparent,
    #[default]
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl Anonymity {
    /// Parse a level as scraped sources spell it; anything unrecognised is `Unknown`
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or(Anonymity::Unknown)
    }
}

impl fmt::Display for Anonymity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anonymity::Elite => write!(f, "elite"),
            Anonymity::Anonymous => write!(f, "anonymous"),
            Anonymity::Transparent => write!(f, "transparent"),
            Anonymity::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

impl FromStr for Anonymity {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "elite" => Ok(Anonymity::Elite),
            "anonymous" => Ok(Anonymity::Anonymous),
            "transparent" => Ok(Anonymity::Transparent),
            "unknown" => Ok(Anonymity::Unknown),
            other => Err(ProxyError::InvalidArgument(format!(
                "unknown anonymity level {:?}",
                other
            ))),
        }
    }
}

/// Lifetime counters of a record. They only ever grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CheckCounters {
    pub total_checks: u64,
    pub success_checks: u64,
    pub judge_valid_count: u64,
    pub judge_invalid_count: u64,
}

/// Flat field set of a record, as written to files and to the storage backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub country: String,
    pub protocols: Vec<Protocol>,
    pub anonymity: Anonymity,
    pub total_checks: u64,
    pub success_checks: u64,
    pub judge_invalid_count: u64,
    pub judge_valid_count: u64,
    pub valid: bool,
    pub judged: bool,
    pub validation_time: Option<DateTime<Utc>>,
    pub redirects: bool,
}

/// One tracked proxy endpoint with its health and anonymity state
///
/// The validity and judged flags are only readable through [`ProxyRecord::is_valid`]
/// and [`ProxyRecord::is_judged`], which decay after [`STALE_WINDOW_SECS`]. The only
/// writers are [`ProxyRecord::record_check`] and [`ProxyRecord::record_judgment`],
/// which move the flag, the check clock and the counters together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRecord {
    ip: Ipv4Addr,
    port: u16,
    protocols: Vec<Protocol>,
    country: String,
    anonymity: Anonymity,
    counters: CheckCounters,
    valid: bool,
    judged: bool,
    last_check: Option<DateTime<Utc>>,
    redirects: bool,
}

impl ProxyRecord {
    /// Create a never-checked record
    ///
    /// Fails with [`ProxyError::InvalidArgument`] if a protocol name is outside
    /// socks4/socks5/http/https or if no protocol is given.
    pub fn new<I, S>(
        ip: Ipv4Addr,
        port: u16,
        protocols: I,
        country: impl Into<String>,
        anonymity: Anonymity,
    ) -> Result<Self, ProxyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let protocols = protocols
            .into_iter()
            .map(|p| p.as_ref().parse())
            .collect::<Result<Vec<Protocol>, _>>()?;
        Self::with_protocols(ip, port, protocols, country, anonymity)
    }

    /// Create a never-checked record from already typed protocols
    pub fn with_protocols(
        ip: Ipv4Addr,
        port: u16,
        protocols: Vec<Protocol>,
        country: impl Into<String>,
        anonymity: Anonymity,
    ) -> Result<Self, ProxyError> {
        let mut unique: Vec<Protocol> = Vec::with_capacity(protocols.len());
        for protocol in protocols {
            if !unique.contains(&protocol) {
                unique.push(protocol);
            }
        }
        if unique.is_empty() {
            return Err(ProxyError::InvalidArgument(format!(
                "proxy {}:{} has no protocols",
                ip, port
            )));
        }

        let country = country.into();
        Ok(Self {
            ip,
            port,
            protocols: unique,
            country: if country.trim().is_empty() {
                UNKNOWN_COUNTRY.to_string()
            } else {
                country
            },
            anonymity,
            counters: CheckCounters::default(),
            valid: false,
            judged: false,
            last_check: None,
            redirects: false,
        })
    }

    /// Carry over counters accumulated elsewhere (a previous run, the storage backend)
    pub fn with_counters(mut self, counters: CheckCounters) -> Self {
        self.counters = counters;
        self
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    pub fn country(&self) -> &str {
        &self.country
    }

    pub fn set_country(&mut self, country: impl Into<String>) {
        self.country = country.into();
    }

    pub fn anonymity(&self) -> Anonymity {
        self.anonymity
    }

    pub fn set_anonymity(&mut self, anonymity: Anonymity) {
        self.anonymity = anonymity;
    }

    pub fn counters(&self) -> CheckCounters {
        self.counters
    }

    pub fn redirects(&self) -> bool {
        self.redirects
    }

    pub fn last_check(&self) -> Option<DateTime<Utc>> {
        self.last_check
    }

    /// Whether `other` is the same endpoint: same ip, port and protocol list
    pub fn same_identity(&self, other: &ProxyRecord) -> bool {
        self.ip == other.ip && self.port == other.port && self.protocols == other.protocols
    }

    /// True while the last check succeeded and is younger than the stale window
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.valid && self.is_fresh_at(now)
    }

    /// Same decay rule as [`ProxyRecord::is_valid`], applied to the judged flag
    pub fn is_judged(&self) -> bool {
        self.is_judged_at(Utc::now())
    }

    pub fn is_judged_at(&self, now: DateTime<Utc>) -> bool {
        self.judged && self.valid && self.is_fresh_at(now)
    }

    fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        match self.last_check {
            Some(checked) => now - checked < Duration::seconds(STALE_WINDOW_SECS),
            None => false,
        }
    }

    /// Record the outcome of a liveness check
    pub fn record_check(&mut self, valid: bool) {
        self.record_check_at(valid, Utc::now());
    }

    pub fn record_check_at(&mut self, valid: bool, now: DateTime<Utc>) {
        self.valid = valid;
        self.last_check = Some(now);
        self.counters.total_checks += 1;
        if valid {
            self.counters.success_checks += 1;
        }
    }

    /// Record the outcome of a judge probe; also counts as a liveness check
    pub fn record_judgment(&mut self, judged: bool) {
        self.record_judgment_at(judged, Utc::now());
    }

    pub fn record_judgment_at(&mut self, judged: bool, now: DateTime<Utc>) {
        self.judged = judged;
        self.record_check_at(judged, now);
        if judged {
            self.counters.judge_valid_count += 1;
        } else {
            self.counters.judge_invalid_count += 1;
        }
    }

    /// Record a successful liveness check together with its redirect observation
    pub fn record_liveness(&mut self, redirected: bool) {
        self.record_check(true);
        self.redirects = redirected;
    }

    /// Connection string in `protocol://ip:port` form, using the first protocol
    pub fn connection_string(&self) -> String {
        format!("{}://{}:{}", self.protocols[0], self.ip, self.port)
    }

    /// Get the proxy string in IP:PORT format
    pub fn to_simple_string(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn to_stored(&self) -> StoredRecord {
        StoredRecord {
            ip: self.ip,
            port: self.port,
            country: self.country.clone(),
            protocols: self.protocols.clone(),
            anonymity: self.anonymity,
            total_checks: self.counters.total_checks,
            success_checks: self.counters.success_checks,
            judge_invalid_count: self.counters.judge_invalid_count,
            judge_valid_count: self.counters.judge_valid_count,
            valid: self.valid,
            judged: self.judged,
            validation_time: self.last_check,
            redirects: self.redirects,
        }
    }
}

impl TryFrom<StoredRecord> for ProxyRecord {
    type Error = ProxyError;

    fn try_from(stored: StoredRecord) -> Result<Self, Self::Error> {
        let mut record = ProxyRecord::with_protocols(
            stored.ip,
            stored.port,
            stored.protocols,
            stored.country,
            stored.anonymity,
        )?
        .with_counters(CheckCounters {
            total_checks: stored.total_checks,
            success_checks: stored.success_checks,
            judge_valid_count: stored.judge_valid_count,
            judge_invalid_count: stored.judge_invalid_count,
        });
        record.valid = stored.valid;
        record.judged = stored.judged;
        record.last_check = stored.validation_time;
        record.redirects = stored.redirects;
        Ok(record)
    }
}

impl fmt::Display for ProxyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.connection_string())
    }
}

/// Decides whether a record deserves a durable storage entry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetentionPolicy {
    pub min_success_ratio: f64,
    pub min_judge_ratio: f64,
    /// A record with this many failed judgments is dropped for good
    pub max_judge_failures: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            min_success_ratio: 0.5,
            min_judge_ratio: 0.5,
            max_judge_failures: 10,
        }
    }
}

impl RetentionPolicy {
    pub fn should_retain(&self, counters: &CheckCounters) -> bool {
        if counters.judge_invalid_count >= self.max_judge_failures {
            return false;
        }
        if counters.total_checks == 0 {
            return false;
        }

        let success_ratio = counters.success_checks as f64 / counters.total_checks as f64;
        let judge_attempts = counters.judge_valid_count + counters.judge_invalid_count;
        if judge_attempts == 0 {
            return counters.success_checks == counters.total_checks;
        }

        let judge_ratio = counters.judge_valid_count as f64 / judge_attempts as f64;
        success_ratio >= self.min_success_ratio && judge_ratio >= self.min_judge_ratio
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ProxyRecord {
        ProxyRecord::new(
            Ipv4Addr::new(1, 2, 3, 4),
            8080,
            ["http", "https"],
            "RU",
            Anonymity::Elite,
        )
        .unwrap()
    }

    #[test]
    fn test_record_creation() {
        let proxy = record();
        assert_eq!(proxy.ip(), Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(proxy.port(), 8080);
        assert_eq!(proxy.protocols(), &[Protocol::Http, Protocol::Https]);
        assert_eq!(proxy.country(), "RU");
        assert!(!proxy.is_valid());
        assert!(!proxy.is_judged());
        assert_eq!(proxy.counters(), CheckCounters::default());
    }

    #[test]
    fn test_record_rejects_unknown_protocol() {
        let err = ProxyRecord::new(
            Ipv4Addr::LOCALHOST,
            80,
            ["http", "ftp"],
            "US",
            Anonymity::Unknown,
        )
        .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidArgument(_)));
    }

    #[test]
    fn test_record_rejects_empty_protocols() {
        let protocols: [&str; 0] = [];
        let err = ProxyRecord::new(Ipv4Addr::LOCALHOST, 80, protocols, "US", Anonymity::Unknown)
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidArgument(_)));
    }

    #[test]
    fn test_blank_country_becomes_unknown() {
        let proxy =
            ProxyRecord::new(Ipv4Addr::LOCALHOST, 80, ["http"], "", Anonymity::Unknown).unwrap();
        assert_eq!(proxy.country(), UNKNOWN_COUNTRY);
    }

    #[test]
    fn test_connection_string_uses_first_protocol() {
        let proxy = ProxyRecord::new(
            Ipv4Addr::new(10, 0, 0, 1),
            1080,
            ["socks5", "http"],
            "DE",
            Anonymity::Unknown,
        )
        .unwrap();
        assert_eq!(proxy.connection_string(), "socks5://10.0.0.1:1080");
        assert_eq!(proxy.to_string(), "socks5://10.0.0.1:1080");
        assert_eq!(proxy.to_simple_string(), "10.0.0.1:1080");
    }

    #[test]
    fn test_validity_decays_after_window() {
        let mut proxy = record();
        let checked = Utc::now();
        proxy.record_check_at(true, checked);

        assert!(proxy.is_valid_at(checked));
        assert!(proxy.is_valid_at(checked + Duration::seconds(119)));
        assert!(!proxy.is_valid_at(checked + Duration::seconds(120)));
        assert!(!proxy.is_valid_at(checked + Duration::seconds(121)));
    }

    #[test]
    fn test_record_check_counts() {
        let mut proxy = record();
        proxy.record_check(true);
        proxy.record_check(false);
        proxy.record_check(true);

        let counters = proxy.counters();
        assert_eq!(counters.total_checks, 3);
        assert_eq!(counters.success_checks, 2);
        assert!(proxy.is_valid());
    }

    #[test]
    fn test_judgment_implies_one_check() {
        let mut proxy = record();
        proxy.record_judgment(true);
        let counters = proxy.counters();
        assert_eq!(counters.total_checks, 1);
        assert_eq!(counters.success_checks, 1);
        assert_eq!(counters.judge_valid_count, 1);
        assert!(proxy.is_valid());
        assert!(proxy.is_judged());

        proxy.record_judgment(false);
        let counters = proxy.counters();
        assert_eq!(counters.total_checks, 2);
        assert_eq!(counters.success_checks, 1);
        assert_eq!(counters.judge_invalid_count, 1);
        assert!(!proxy.is_valid());
        assert!(!proxy.is_judged());
    }

    #[test]
    fn test_judged_never_outlives_validity() {
        let mut proxy = record();
        let judged_at = Utc::now();
        proxy.record_judgment_at(true, judged_at);
        proxy.record_check_at(false, judged_at);
        assert!(!proxy.is_judged_at(judged_at));
    }

    #[test]
    fn test_liveness_sets_redirects() {
        let mut proxy = record();
        proxy.record_liveness(true);
        assert!(proxy.redirects());
        proxy.record_liveness(false);
        assert!(!proxy.redirects());
    }

    #[test]
    fn test_stored_round_trip() {
        let mut proxy = record().with_counters(CheckCounters {
            total_checks: 4,
            success_checks: 3,
            judge_valid_count: 2,
            judge_invalid_count: 1,
        });
        proxy.record_judgment(true);

        let restored = ProxyRecord::try_from(proxy.to_stored()).unwrap();
        assert_eq!(restored, proxy);
    }

    #[test]
    fn test_anonymity_parsing() {
        assert_eq!(Anonymity::parse_lenient("Elite"), Anonymity::Elite);
        assert_eq!(Anonymity::parse_lenient("anonymous"), Anonymity::Anonymous);
        assert_eq!(Anonymity::parse_lenient("high anonymous"), Anonymity::Unknown);
        assert_eq!(Anonymity::Unknown.to_string(), "UNKNOWN");
    }

    #[test]
    fn test_retention_without_judging() {
        let policy = RetentionPolicy::default();
        let perfect = CheckCounters {
            total_checks: 10,
            success_checks: 10,
            ..Default::default()
        };
        assert!(policy.should_retain(&perfect));

        let flaky = CheckCounters {
            total_checks: 10,
            success_checks: 9,
            ..Default::default()
        };
        assert!(!policy.should_retain(&flaky));
        assert!(!policy.should_retain(&CheckCounters::default()));
    }

    #[test]
    fn test_retention_with_judging() {
        let policy = RetentionPolicy::default();
        let good = CheckCounters {
            total_checks: 10,
            success_checks: 6,
            judge_valid_count: 3,
            judge_invalid_count: 3,
        };
        assert!(policy.should_retain(&good));

        let badly_judged = CheckCounters {
            total_checks: 10,
            success_checks: 10,
            judge_valid_count: 1,
            judge_invalid_count: 2,
        };
        assert!(!policy.should_retain(&badly_judged));
    }

    #[test]
    fn test_retention_ban_threshold() {
        let policy = RetentionPolicy::default();
        let banned = CheckCounters {
            total_checks: 100,
            success_checks: 90,
            judge_valid_count: 80,
            judge_invalid_count: 10,
        };
        assert!(!policy.should_retain(&banned));
    }
}
