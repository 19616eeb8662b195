//! Producers of candidate proxies
//!
//! Site-specific scrapers live outside this crate; anything that can yield
//! records plugs in through [`ProxySource`]. [`ListSource`] covers plain-text
//! `ip:port` lists on disk or behind a URL.

use crate::proxy::models::{Protocol, ProxyRecord};
use crate::proxy::parser::ProxyParser;
use crate::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use log::info;
use reqwest::Client;
use std::path::PathBuf;
use std::time::Duration;

/// Default timeout for list downloads in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// A source of candidate proxies
#[async_trait]
pub trait ProxySource: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Fetch the current candidates as a one-shot stream
    async fn harvest(&self) -> Result<BoxStream<'static, ProxyRecord>>;
}

/// Where a plain-text list lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListLocation {
    File(PathBuf),
    Url(String),
}

/// Plain-text `ip:port` list with a protocol applied to unprefixed lines
#[derive(Debug, Clone)]
pub struct ListSource {
    name: String,
    location: ListLocation,
    protocol: Protocol,
    client: Client,
}

impl ListSource {
    pub fn new(location: ListLocation, protocol: Protocol) -> Result<Self> {
        let name = match &location {
            ListLocation::File(path) => path.display().to_string(),
            ListLocation::Url(url) => url.clone(),
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            name,
            location,
            protocol,
            client,
        })
    }

    /// Parse `[protocol=]location`, e.g. `socks5=https://host/socks5.txt` or `proxies.txt`
    pub fn from_arg(arg: &str) -> Result<Self> {
        let (protocol, location) = match arg.split_once('=') {
            Some((protocol, location)) => (protocol.parse::<Protocol>()?, location),
            None => (Protocol::Http, arg),
        };

        let location = if location.starts_with("http://") || location.starts_with("https://") {
            ListLocation::Url(location.to_string())
        } else {
            ListLocation::File(PathBuf::from(location))
        };

        Self::new(location, protocol)
    }

    pub fn location(&self) -> &ListLocation {
        &self.location
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn fetch(&self) -> Result<String> {
        match &self.location {
            ListLocation::File(path) => Ok(tokio::fs::read_to_string(path).await?),
            ListLocation::Url(url) => {
                let response = self.client.get(url).send().await?.error_for_status()?;
                Ok(response.text().await?)
            }
        }
    }
}

#[async_trait]
impl ProxySource for ListSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn harvest(&self) -> Result<BoxStream<'static, ProxyRecord>> {
        let content = self.fetch().await?;
        let proxies = ProxyParser::parse_string(&content, self.protocol);
        info!("After {} totally get {}", self.name, proxies.len());
        Ok(stream::iter(proxies).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_from_arg() {
        let source = ListSource::from_arg("socks5=https://example.com/socks5.txt").unwrap();
        assert_eq!(source.protocol(), Protocol::Socks5);
        assert_eq!(
            source.location(),
            &ListLocation::Url("https://example.com/socks5.txt".to_string())
        );

        let source = ListSource::from_arg("lists/http.txt").unwrap();
        assert_eq!(source.protocol(), Protocol::Http);
        assert_eq!(
            source.location(),
            &ListLocation::File(PathBuf::from("lists/http.txt"))
        );
        assert_eq!(source.name(), "lists/http.txt");

        assert!(ListSource::from_arg("gopher=list.txt").is_err());
    }

    #[tokio::test]
    async fn test_harvest_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1.1.1.1:1080\n2.2.2.2:1080\nhttp://3.3.3.3:80").unwrap();

        let source =
            ListSource::new(ListLocation::File(file.path().to_path_buf()), Protocol::Socks5)
                .unwrap();
        let proxies: Vec<ProxyRecord> = source.harvest().await.unwrap().collect().await;

        assert_eq!(proxies.len(), 3);
        assert_eq!(proxies[0].protocols(), &[Protocol::Socks5]);
        assert_eq!(proxies[2].protocols(), &[Protocol::Http]);
    }

    #[tokio::test]
    async fn test_harvest_missing_file_fails() {
        let source = ListSource::new(
            ListLocation::File(PathBuf::from("/nonexistent/proxies.txt")),
            Protocol::Http,
        )
        .unwrap();
        assert!(source.harvest().await.is_err());
    }
}
