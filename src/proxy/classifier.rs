//! Verdicts for liveness and judge probe outcomes
//!
//! Everything here is pure: the engine performs the round-trips and hands the
//! raw outcome over for classification.

use crate::error::ProbeError;
use crate::proxy::models::Anonymity;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};

/// Header names whose presence on the judge page reveals that a proxy was used
pub const PRIVACY_HEADERS: [&str; 8] = [
    "VIA",
    "X-FORWARDED-FOR",
    "X-FORWARDED",
    "FORWARDED-FOR",
    "FORWARDED-FOR-IP",
    "FORWARDED",
    "CLIENT-IP",
    "PROXY-CONNECTION",
];

/// A privacy header as a judge page prints it: CGI-style (`HTTP_X_FORWARDED_FOR`)
/// anywhere, or a raw `Name: value` / `Name = value` line
static PRIVACY_HEADER_REGEX: Lazy<Regex> = Lazy::new(|| {
    let mut names: Vec<String> = PRIVACY_HEADERS
        .iter()
        .map(|header| header.replace('-', "[_-]"))
        .collect();
    names.sort_by_key(|name| std::cmp::Reverse(name.len()));
    let names = names.join("|");

    Regex::new(&format!(
        r"(?im)\bHTTP[_-](?:{names})\b|^[ \t]*(?:{names})[ \t]*[:=]"
    ))
    .expect("Invalid privacy header regex")
});

/// Text the default judge page always contains
pub const DEFAULT_JUDGE_SIGNATURE: &str = "PHP Proxy Judge";

/// Result of a liveness probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessVerdict {
    /// The echo service saw the proxy's address, or some third address
    Valid { redirected: bool },
    /// The echo service saw our own address: the request was not proxied
    LeaksCaller,
    Failed(ProbeError),
}

impl LivenessVerdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, LivenessVerdict::Valid { .. })
    }
}

/// Result of a judge probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JudgeVerdict {
    Judged(Anonymity),
    /// The page matched none of the known patterns
    Unrecognized,
    Failed(ProbeError),
}

#[derive(Debug, Deserialize)]
struct EchoResponse {
    origin: String,
}

/// Extract the first address an IP-echo service reports
///
/// Accepts `{"origin": "1.2.3.4"}`, `{"origin": "1.2.3.4:5678"}` and comma-separated
/// origin lists.
pub fn parse_echo_origin(body: &str) -> Result<IpAddr, ProbeError> {
    let echo: EchoResponse = serde_json::from_str(body)
        .map_err(|e| ProbeError::MalformedResponse(e.to_string()))?;

    let first = echo.origin.split(',').next().unwrap_or_default().trim();
    if let Ok(ip) = first.parse::<IpAddr>() {
        return Ok(ip);
    }
    let host = first.rsplit_once(':').map_or(first, |(host, _)| host);
    host.trim_matches(|c| c == '[' || c == ']')
        .parse::<IpAddr>()
        .map_err(|_| ProbeError::MalformedResponse(format!("origin {:?} is not an IP", echo.origin)))
}

/// Classify the outcome of a request to the IP-echo service made through `proxy_ip`
pub fn classify_liveness(
    outcome: Result<&str, ProbeError>,
    proxy_ip: Ipv4Addr,
    own_ip: IpAddr,
) -> LivenessVerdict {
    let seen = match outcome.and_then(parse_echo_origin) {
        Ok(ip) => ip,
        Err(e) => return LivenessVerdict::Failed(e),
    };

    if seen == IpAddr::V4(proxy_ip) {
        LivenessVerdict::Valid { redirected: false }
    } else if seen != own_ip {
        LivenessVerdict::Valid { redirected: true }
    } else {
        LivenessVerdict::LeaksCaller
    }
}

/// Classify the judge page fetched through a proxy.
///
/// Our own address anywhere on the page means transparent; otherwise any privacy
/// header means anonymous; otherwise the judge signature means elite.
pub fn classify_judgment(
    outcome: Result<&str, ProbeError>,
    own_ip: IpAddr,
    signature: &str,
) -> JudgeVerdict {
    let body = match outcome {
        Ok(body) => body,
        Err(e) => return JudgeVerdict::Failed(e),
    };

    if body.contains(&own_ip.to_string()) {
        return JudgeVerdict::Judged(Anonymity::Transparent);
    }

    if PRIVACY_HEADER_REGEX.is_match(body) {
        return JudgeVerdict::Judged(Anonymity::Anonymous);
    }
    if body.to_uppercase().contains(&signature.to_uppercase()) {
        return JudgeVerdict::Judged(Anonymity::Elite);
    }

    JudgeVerdict::Unrecognized
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROXY: Ipv4Addr = Ipv4Addr::new(1, 2, 3, 4);

    fn own() -> IpAddr {
        "9.9.9.9".parse().unwrap()
    }

    #[test]
    fn test_parse_echo_origin_formats() {
        let expected: IpAddr = "1.2.3.4".parse().unwrap();
        assert_eq!(parse_echo_origin(r#"{"origin": "1.2.3.4"}"#).unwrap(), expected);
        assert_eq!(parse_echo_origin(r#"{"origin": "1.2.3.4:51234"}"#).unwrap(), expected);
        assert_eq!(
            parse_echo_origin(r#"{"origin": "1.2.3.4, 5.6.7.8"}"#).unwrap(),
            expected
        );
        assert_eq!(
            parse_echo_origin(r#"{"origin": "[::1]:443"}"#).unwrap(),
            "::1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_parse_echo_origin_malformed() {
        assert!(matches!(
            parse_echo_origin("<html>blocked</html>"),
            Err(ProbeError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_echo_origin(r#"{"ip": "1.2.3.4"}"#),
            Err(ProbeError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_echo_origin(r#"{"origin": "localhost"}"#),
            Err(ProbeError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_liveness_own_proxy_ip() {
        let verdict = classify_liveness(Ok(r#"{"origin": "1.2.3.4"}"#), PROXY, own());
        assert_eq!(verdict, LivenessVerdict::Valid { redirected: false });
        assert!(verdict.is_valid());
    }

    #[test]
    fn test_liveness_third_ip_is_redirect() {
        let verdict = classify_liveness(Ok(r#"{"origin": "5.6.7.8"}"#), PROXY, own());
        assert_eq!(verdict, LivenessVerdict::Valid { redirected: true });
    }

    #[test]
    fn test_liveness_caller_ip_is_invalid() {
        let verdict = classify_liveness(Ok(r#"{"origin": "9.9.9.9"}"#), PROXY, own());
        assert_eq!(verdict, LivenessVerdict::LeaksCaller);
        assert!(!verdict.is_valid());
    }

    #[test]
    fn test_liveness_probe_errors_are_invalid() {
        let verdict = classify_liveness(Err(ProbeError::ConnectionRefused), PROXY, own());
        assert_eq!(verdict, LivenessVerdict::Failed(ProbeError::ConnectionRefused));

        let verdict = classify_liveness(Ok("not json"), PROXY, own());
        assert!(matches!(
            verdict,
            LivenessVerdict::Failed(ProbeError::MalformedResponse(_))
        ));

        let verdict = classify_liveness(Err(ProbeError::Other("boom".into())), PROXY, own());
        assert!(!verdict.is_valid());
    }

    #[test]
    fn test_judge_transparent_wins() {
        let body = "PHP Proxy Judge\nX-Forwarded-For: 9.9.9.9\nVia: 1.1 foo";
        assert_eq!(
            classify_judgment(Ok(body), own(), DEFAULT_JUDGE_SIGNATURE),
            JudgeVerdict::Judged(Anonymity::Transparent)
        );
    }

    #[test]
    fn test_judge_anonymous() {
        let body = "PHP Proxy Judge\nVia: 1.1 foo";
        assert_eq!(
            classify_judgment(Ok(body), own(), DEFAULT_JUDGE_SIGNATURE),
            JudgeVerdict::Judged(Anonymity::Anonymous)
        );
        assert_eq!(
            classify_judgment(Ok("HTTP_CLIENT_IP = 10.0.0.1"), own(), DEFAULT_JUDGE_SIGNATURE),
            JudgeVerdict::Judged(Anonymity::Anonymous)
        );
    }

    #[test]
    fn test_judge_header_names_need_a_header_position() {
        let body = "PHP Proxy Judge\nToday's trivia: aviation history\nREMOTE_ADDR = 1.2.3.4";
        assert_eq!(
            classify_judgment(Ok(body), own(), DEFAULT_JUDGE_SIGNATURE),
            JudgeVerdict::Judged(Anonymity::Elite)
        );

        let body = "PHP Proxy Judge\n  forwarded = for=10.0.0.1";
        assert_eq!(
            classify_judgment(Ok(body), own(), DEFAULT_JUDGE_SIGNATURE),
            JudgeVerdict::Judged(Anonymity::Anonymous)
        );
        let body = "<td>http_proxy_connection</td><td>keep-alive</td>";
        assert_eq!(
            classify_judgment(Ok(body), own(), DEFAULT_JUDGE_SIGNATURE),
            JudgeVerdict::Judged(Anonymity::Anonymous)
        );
    }

    #[test]
    fn test_judge_elite() {
        let body = "<title>AZ Environment variables 1.04</title> PHP Proxy Judge\nREMOTE_ADDR = 1.2.3.4";
        assert_eq!(
            classify_judgment(Ok(body), own(), DEFAULT_JUDGE_SIGNATURE),
            JudgeVerdict::Judged(Anonymity::Elite)
        );
    }

    #[test]
    fn test_judge_unrecognized_and_failures() {
        assert_eq!(
            classify_judgment(Ok("captive portal"), own(), DEFAULT_JUDGE_SIGNATURE),
            JudgeVerdict::Unrecognized
        );
        assert_eq!(
            classify_judgment(Err(ProbeError::Timeout), own(), DEFAULT_JUDGE_SIGNATURE),
            JudgeVerdict::Failed(ProbeError::Timeout)
        );
    }
}
