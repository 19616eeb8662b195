//! Harvest-and-validate cycles, one-shot or forever

use crate::proxy::{CycleReport, GeoLocator, ProxySource, ProxyStorage, ProxyStore, Validator};
use crate::Result;
use futures::StreamExt;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the daemon loop
#[derive(Debug, Clone, Default)]
pub struct DaemonConfig {
    /// Pause between two cycles
    pub inter_cycle_delay: Duration,
    /// Wipe the storage backend before the first cycle
    pub drop_storage_first: bool,
    /// Merge stored records into the working set every cycle
    pub load_from_storage: bool,
    /// Where to write currently valid records after each cycle
    pub output: Option<PathBuf>,
}

impl DaemonConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_inter_cycle_delay(mut self, delay: Duration) -> Self {
        self.inter_cycle_delay = delay;
        self
    }

    pub fn with_drop_storage_first(mut self, drop: bool) -> Self {
        self.drop_storage_first = drop;
        self
    }

    pub fn with_load_from_storage(mut self, load: bool) -> Self {
        self.load_from_storage = load;
        self
    }

    pub fn with_output(mut self, path: PathBuf) -> Self {
        self.output = Some(path);
        self
    }
}

/// Owns the working set and drives harvest + validation cycles
pub struct Daemon {
    config: DaemonConfig,
    store: ProxyStore,
    validator: Validator,
    sources: Vec<Box<dyn ProxySource>>,
    storage: Option<Arc<dyn ProxyStorage>>,
    geo: Option<GeoLocator>,
    cycles: usize,
}

impl Daemon {
    pub fn new(config: DaemonConfig, validator: Validator) -> Self {
        Self {
            config,
            store: ProxyStore::new(),
            validator,
            sources: Vec::new(),
            storage: None,
            geo: None,
            cycles: 0,
        }
    }

    pub fn with_store(mut self, store: ProxyStore) -> Self {
        self.store = store;
        self
    }

    pub fn with_source(mut self, source: Box<dyn ProxySource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn ProxyStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_geo(mut self, geo: GeoLocator) -> Self {
        self.geo = Some(geo);
        self
    }

    pub fn store(&self) -> &ProxyStore {
        &self.store
    }

    /// Pull candidates from every source into the store.
    ///
    /// A failing source is logged and skipped. Returns how many records were new.
    pub async fn harvest(&mut self) -> usize {
        let mut added = 0;
        for source in &self.sources {
            let mut proxies = match source.harvest().await {
                Ok(proxies) => proxies,
                Err(e) => {
                    warn!("{} is unavailable: {}", source.name(), e);
                    continue;
                }
            };

            while let Some(mut record) = proxies.next().await {
                if let Some(geo) = &self.geo {
                    geo.fill_country(&mut record);
                }
                if self.store.add(record) {
                    added += 1;
                }
            }
        }

        info!("Harvested {} new proxies, {} tracked", added, self.store.len());
        added
    }

    /// Run one full cycle: harvest, merge storage, validate, write the output file
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        if self.cycles == 0 && self.config.drop_storage_first {
            self.validator.drop_storage().await?;
        }
        self.cycles += 1;

        self.harvest().await;

        if self.config.load_from_storage {
            if let Some(storage) = &self.storage {
                self.store.load_from_storage(storage.as_ref()).await?;
            }
        }

        let report = self.validator.validate_all(&mut self.store).await?;

        if let Some(path) = &self.config.output {
            let saved = self.store.save_to_file(path)?;
            info!("Saved {} valid proxies to {:?}", saved, path);
        }

        Ok(report)
    }

    /// Repeat cycles until Ctrl-C.
    ///
    /// A failed cycle is logged and the loop carries on after the usual delay.
    pub async fn run_forever(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, shutting down");
                    return Ok(());
                }
                result = self.run_cycle() => {
                    if let Err(e) = result {
                        error!("ERROR WHEN UPDATE PROXIES: {:#}", e);
                    }
                }
            }

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.inter_cycle_delay) => {}
            }
        }
    }
}
