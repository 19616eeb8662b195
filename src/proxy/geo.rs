//! Country lookup for proxies whose source did not report one

use crate::proxy::models::{ProxyRecord, UNKNOWN_COUNTRY};
use crate::Result;
use log::debug;
use maxminddb::{geoip2, Reader};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Arc;

/// GeoLocator for looking up IP addresses in MMDB databases
#[derive(Clone)]
pub struct GeoLocator {
    reader: Arc<Reader<Vec<u8>>>,
}

impl GeoLocator {
    /// Create a new GeoLocator from an MMDB file path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = Reader::open_readfile(path)?;
        Ok(Self {
            reader: Arc::new(reader),
        })
    }

    /// ISO 3166-1 alpha-2 country code for `ip`, if the database knows it
    pub fn country_code(&self, ip: Ipv4Addr) -> Result<Option<String>> {
        let lookup_result = self.reader.lookup(IpAddr::V4(ip))?;
        let city: Option<geoip2::City> = lookup_result.decode()?;

        Ok(city.and_then(|city| city.country.iso_code.map(String::from)))
    }

    /// Replace an `UNKNOWN` country with the database answer.
    ///
    /// Returns whether the record changed. Lookup failures leave it untouched.
    pub fn fill_country(&self, record: &mut ProxyRecord) -> bool {
        if record.country() != UNKNOWN_COUNTRY {
            return false;
        }

        match self.country_code(record.ip()) {
            Ok(Some(code)) => {
                record.set_country(code);
                true
            }
            Ok(None) => false,
            Err(e) => {
                debug!("Geo lookup for {} failed: {}", record.ip(), e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_database_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(GeoLocator::from_path(dir.path().join("missing.mmdb")).is_err());
    }
}
