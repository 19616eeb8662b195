//! Validation and judging engine
//!
//! Each validation cycle resolves our own public IP once, selects the records whose
//! last verdict went stale, and runs every selected record through a liveness probe
//! and, when it passes, a judge probe. Failures are absorbed per record.

use crate::error::{ProbeError, ProxyError};
use crate::proxy::classifier::{
    classify_judgment, classify_liveness, parse_echo_origin, JudgeVerdict, LivenessVerdict,
    DEFAULT_JUDGE_SIGNATURE,
};
use crate::proxy::models::{Anonymity, Protocol, ProxyRecord, RetentionPolicy};
use crate::proxy::scheduler::BatchScheduler;
use crate::proxy::storage::ProxyStorage;
use crate::proxy::store::ProxyStore;
use crate::Result;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use reqwest::{Client, Proxy as ReqwestProxy};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Default timeout for proxy checks in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default number of parallel workers
const DEFAULT_MAX_WORKERS: usize = 10;

/// Default IP-echo service used for liveness checks
const DEFAULT_ECHO_URL: &str = "https://httpbin.io/ip";

/// Default header-disclosure page used for judging
const DEFAULT_JUDGE_URL: &str = "http://proxyjudge.us/azenv.php";

/// Configuration for the validation engine
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Re-check records that are still fresh, and judge regardless of `judge`
    pub force: bool,
    /// Push every verdict to the storage backend
    pub sync_storage: bool,
    /// Probe through a browser instead of the HTTP client
    pub use_browser_probe: bool,
    /// Run batches on a worker pool instead of sequentially
    pub parallel: bool,
    pub max_workers: usize,
    /// Run the judge probe on records that pass the liveness probe
    pub judge: bool,
    pub echo_url: String,
    pub judge_url: String,
    /// Text that identifies an untouched judge page
    pub judge_signature: String,
    /// Timeout for each probe
    pub timeout: Duration,
    pub retention: RetentionPolicy,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            force: false,
            sync_storage: false,
            use_browser_probe: false,
            parallel: false,
            max_workers: DEFAULT_MAX_WORKERS,
            judge: true,
            echo_url: DEFAULT_ECHO_URL.to_string(),
            judge_url: DEFAULT_JUDGE_URL.to_string(),
            judge_signature: DEFAULT_JUDGE_SIGNATURE.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            retention: RetentionPolicy::default(),
        }
    }
}

impl ValidatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_sync_storage(mut self, sync: bool) -> Self {
        self.sync_storage = sync;
        self
    }

    pub fn with_browser_probe(mut self, enabled: bool) -> Self {
        self.use_browser_probe = enabled;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    pub fn with_judge(mut self, judge: bool) -> Self {
        self.judge = judge;
        self
    }

    pub fn with_echo_url(mut self, url: String) -> Self {
        self.echo_url = url;
        self
    }

    pub fn with_judge_url(mut self, url: String) -> Self {
        self.judge_url = url;
        self
    }

    pub fn with_judge_signature(mut self, signature: String) -> Self {
        self.judge_signature = signature;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }
}

/// Performs the network round-trips the engine classifies
#[async_trait]
pub trait Prober: Send + Sync {
    /// Fetch `url` without a proxy
    async fn fetch_direct(&self, url: &str) -> std::result::Result<String, ProbeError>;

    /// Fetch `url` through `proxy`
    async fn fetch_via(
        &self,
        proxy: &ProxyRecord,
        url: &str,
    ) -> std::result::Result<String, ProbeError>;
}

/// Prober backed by reqwest
///
/// TLS certificates are not verified: proxies routinely present invalid ones.
#[derive(Debug, Clone)]
pub struct HttpProber {
    timeout: Duration,
    direct: Client,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Result<Self> {
        let direct = Client::builder().timeout(timeout).build()?;
        Ok(Self { timeout, direct })
    }

    /// Create a reqwest client routed through the proxy
    fn create_client(&self, proxy: &ProxyRecord) -> std::result::Result<Client, ProbeError> {
        let protocol = proxy.protocols()[0];
        // reqwest only speaks SOCKS5
        if protocol == Protocol::Socks4 {
            return Err(ProbeError::UnsupportedProtocol(protocol));
        }

        let upstream = ReqwestProxy::all(proxy.connection_string())?;
        let client = Client::builder()
            .proxy(upstream)
            .timeout(self.timeout)
            .danger_accept_invalid_certs(true)
            .build()?;

        Ok(client)
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn fetch_direct(&self, url: &str) -> std::result::Result<String, ProbeError> {
        let response = self.direct.get(url).send().await?.error_for_status()?;
        Ok(response.text().await?)
    }

    async fn fetch_via(
        &self,
        proxy: &ProxyRecord,
        url: &str,
    ) -> std::result::Result<String, ProbeError> {
        let client = self.create_client(proxy)?;
        let response = client.get(url).send().await?.error_for_status()?;
        Ok(response.text().await?)
    }
}

/// Where a record ended up in one cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Invalid { unexpected: bool },
    Valid { redirected: bool },
    Judged(Anonymity),
    JudgeFailed { unexpected: bool },
}

/// Tally of one validation cycle
///
/// `valid` counts records that passed the liveness probe, whatever the judge said.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub selected: usize,
    pub batches: usize,
    pub valid: usize,
    pub redirected: usize,
    pub invalid: usize,
    pub unexpected_errors: usize,
    pub elite: usize,
    pub anonymous: usize,
    pub transparent: usize,
    pub judge_failed: usize,
}

impl CycleReport {
    pub fn judged(&self) -> usize {
        self.elite + self.anonymous + self.transparent
    }

    fn tally(&mut self, outcome: &RecordOutcome, redirected: bool) {
        match outcome {
            RecordOutcome::Invalid { unexpected } => {
                self.invalid += 1;
                self.unexpected_errors += usize::from(*unexpected);
                return;
            }
            RecordOutcome::Valid { .. } => {}
            RecordOutcome::Judged(level) => match level {
                Anonymity::Elite => self.elite += 1,
                Anonymity::Anonymous => self.anonymous += 1,
                Anonymity::Transparent => self.transparent += 1,
                Anonymity::Unknown => {}
            },
            RecordOutcome::JudgeFailed { unexpected } => {
                self.judge_failed += 1;
                self.unexpected_errors += usize::from(*unexpected);
            }
        }
        self.valid += 1;
        self.redirected += usize::from(redirected);
    }
}

/// Validation and judging engine
pub struct Validator {
    config: ValidatorConfig,
    prober: Arc<dyn Prober>,
    storage: Option<Arc<dyn ProxyStorage>>,
}

impl Validator {
    pub fn new(config: ValidatorConfig, prober: Arc<dyn Prober>) -> Self {
        Self {
            config,
            prober,
            storage: None,
        }
    }

    /// Create a validator probing with [`HttpProber`]
    pub fn with_http_prober(config: ValidatorConfig) -> Result<Self> {
        let prober = HttpProber::new(config.timeout)?;
        Ok(Self::new(config, Arc::new(prober)))
    }

    pub fn with_storage(mut self, storage: Arc<dyn ProxyStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Remove every entry from the storage backend, if one is attached
    pub async fn drop_storage(&self) -> std::result::Result<(), ProxyError> {
        if let Some(storage) = &self.storage {
            storage.drop_all().await?;
            info!("Dropped all stored proxies");
        }
        Ok(())
    }

    /// Resolve the public IP this process is seen with
    pub async fn resolve_own_ip(&self) -> std::result::Result<IpAddr, ProxyError> {
        self.prober
            .fetch_direct(&self.config.echo_url)
            .await
            .and_then(|body| parse_echo_origin(&body))
            .map_err(ProxyError::BaselineResolution)
    }

    /// Run one validation cycle over the store.
    ///
    /// Records are selected when their validity went stale, or all of them when
    /// `force` is set. Returns once every batch has finished.
    pub async fn validate_all(
        &self,
        store: &mut ProxyStore,
    ) -> std::result::Result<CycleReport, ProxyError> {
        if self.config.use_browser_probe {
            warn!("Browser probing is not available, using the HTTP prober");
        }

        let own_ip = match self.resolve_own_ip().await {
            Ok(ip) => ip,
            Err(e) => {
                error!("Validation cycle aborted: {}", e);
                return Err(e);
            }
        };
        debug!("Own public IP is {}", own_ip);

        let force = self.config.force;
        let selected: Vec<&mut ProxyRecord> =
            store.iter_mut().filter(|r| force || !r.is_valid()).collect();

        let scheduler = BatchScheduler::new(self.config.max_workers, self.config.parallel);
        let mut report = CycleReport {
            selected: selected.len(),
            ..Default::default()
        };
        report.batches = scheduler.batch_count(report.selected);

        info!(
            "Start validation with {} workers and {} batches, total count of proxies: {}",
            scheduler.in_flight(),
            report.batches,
            report.selected
        );

        let outcomes = scheduler
            .run(selected, |batch| self.check_batch(batch, own_ip))
            .await;

        for (outcome, redirected) in outcomes.iter().flatten() {
            report.tally(outcome, *redirected);
        }

        info!(
            "Validation finished: {} valid ({} redirect), {} invalid, judged {} elite / {} anonymous / {} transparent, {} judge failures",
            report.valid,
            report.redirected,
            report.invalid,
            report.elite,
            report.anonymous,
            report.transparent,
            report.judge_failed
        );

        Ok(report)
    }

    async fn check_batch(
        &self,
        batch: Vec<&mut ProxyRecord>,
        own_ip: IpAddr,
    ) -> Vec<(RecordOutcome, bool)> {
        let mut outcomes = Vec::with_capacity(batch.len());
        for record in batch {
            let outcome = self.check_record(record, own_ip).await;
            outcomes.push((outcome, record.redirects()));
        }
        outcomes
    }

    /// Run the liveness probe and, if it passes, the judge probe on one record
    pub async fn check_record(&self, record: &mut ProxyRecord, own_ip: IpAddr) -> RecordOutcome {
        debug!("Check {}", record);

        let body = self.prober.fetch_via(record, &self.config.echo_url).await;
        let verdict = classify_liveness(
            body.as_deref().map_err(ProbeError::clone),
            record.ip(),
            own_ip,
        );

        let outcome = match verdict {
            LivenessVerdict::Valid { redirected } => {
                record.record_liveness(redirected);
                if redirected {
                    info!("VALID {} BUT REDIRECTS", record);
                } else {
                    info!("VALID {} IP IS RIGHT", record);
                }
                RecordOutcome::Valid { redirected }
            }
            LivenessVerdict::LeaksCaller => {
                record.record_check(false);
                info!("NOT VALID {} IP IS MINE", record);
                RecordOutcome::Invalid { unexpected: false }
            }
            LivenessVerdict::Failed(e) => {
                record.record_check(false);
                log_probe_failure("NOT VALID", record, &e);
                RecordOutcome::Invalid {
                    unexpected: !e.is_expected(),
                }
            }
        };
        self.sync(record).await;

        if !matches!(outcome, RecordOutcome::Valid { .. })
            || !(self.config.judge || self.config.force)
        {
            return outcome;
        }

        debug!("Proxy {} is VALID, judge now", record);
        let body = self.prober.fetch_via(record, &self.config.judge_url).await;
        let verdict = classify_judgment(
            body.as_deref().map_err(ProbeError::clone),
            own_ip,
            &self.config.judge_signature,
        );

        let outcome = match verdict {
            JudgeVerdict::Judged(level) => {
                record.set_anonymity(level);
                record.record_judgment(true);
                info!("Proxy {} judged to {}", record, level);
                RecordOutcome::Judged(level)
            }
            JudgeVerdict::Unrecognized => {
                record.record_judgment(false);
                info!("NOT VALID WHILE JUDGE {}", record);
                RecordOutcome::JudgeFailed { unexpected: false }
            }
            JudgeVerdict::Failed(e) => {
                record.record_judgment(false);
                log_probe_failure("NOT VALID WHILE JUDGE", record, &e);
                RecordOutcome::JudgeFailed {
                    unexpected: !e.is_expected(),
                }
            }
        };
        self.sync(record).await;

        outcome
    }

    /// Create, refresh or evict the durable entry for a record
    async fn sync(&self, record: &ProxyRecord) {
        if !self.config.sync_storage {
            return;
        }
        let Some(storage) = &self.storage else {
            return;
        };

        if self.config.retention.should_retain(&record.counters()) {
            match storage.upsert(&record.to_stored()).await {
                Ok(()) => debug!("Save {} to storage", record),
                Err(e) => warn!("Failed to save {} to storage: {}", record, e),
            }
        } else {
            match storage.delete(record.ip(), record.port()).await {
                Ok(true) => info!("Delete {} from storage (below retention)", record),
                Ok(false) => debug!("Skip saving {} (below retention)", record),
                Err(e) => warn!("Failed to delete {} from storage: {}", record, e),
            }
        }
    }
}

fn log_probe_failure(prefix: &str, record: &ProxyRecord, e: &ProbeError) {
    if e.is_expected() {
        info!("{} {} expected error: {}", prefix, record, e);
    } else {
        warn!("{} {} unexpected error: {}", prefix, record, e);
    }
}
