use axum::http::{HeaderMap, Uri};
use regex::Regex;

pub const CONSUMER_HEADER: &str = "x-mse-consumer";

/// The discriminated selector determining which request dimension(s)
/// produce rate-limit keys. `Per*` variants enable regex-capture mode: the
/// raw value is matched against the rule's compiled patterns and every
/// first capture group becomes a separate key.
#[derive(Debug, Clone)]
pub enum LimitBy {
    Header(String),
    QueryParam(String),
    Cookie(String),
    Consumer,
    PerIp,
    PerHeader(String),
    PerQueryParam(String),
    PerCookie(String),
    PerConsumer,
}

impl LimitBy {
    fn is_match_mode(&self) -> bool {
        matches!(
            self,
            LimitBy::PerIp
                | LimitBy::PerHeader(_)
                | LimitBy::PerQueryParam(_)
                | LimitBy::PerCookie(_)
                | LimitBy::PerConsumer
        )
    }
}

/// Throughput and keying configuration for one rate-limit rule. `period` is
/// fixed at one second, matching the upstream token-bucket script.
#[derive(Debug, Clone)]
pub struct RateRule {
    pub rate: u64,
    pub burst: u64,
    pub limit_by: LimitBy,
}

fn query_value(uri: &Uri, name: &str) -> Option<String> {
    let query = uri.query()?;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next()?;
        if key == name {
            return Some(parts.next().unwrap_or("").to_string());
        }
    }
    None
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for cookie_header in headers.get_all(axum::http::header::COOKIE) {
        let raw = cookie_header.to_str().ok()?;
        for part in raw.split(';') {
            let mut kv = part.trim().splitn(2, '=');
            let key = kv.next()?.trim();
            if key == name {
                return Some(kv.next().unwrap_or("").trim().to_string());
            }
        }
    }
    None
}

/// Derives the raw keying value for a request under `rule`, or `None` if the
/// configured field is absent from this request.
fn raw_value(headers: &HeaderMap, uri: &Uri, host: &str, rule: &RateRule) -> Option<String> {
    match &rule.limit_by {
        LimitBy::Header(name) | LimitBy::PerHeader(name) => headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        LimitBy::QueryParam(name) | LimitBy::PerQueryParam(name) => query_value(uri, name),
        LimitBy::Cookie(name) | LimitBy::PerCookie(name) => cookie_value(headers, name),
        LimitBy::Consumer | LimitBy::PerConsumer => headers
            .get(CONSUMER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        LimitBy::PerIp => Some(host.to_string()),
    }
}

/// Derives one or more rate-limit keys from a request.
///
/// Returns an empty list when the configured field is absent from the
/// request; such a request is treated as unbounded for this rule, an
/// intentional opt-in-per-dimension behavior rather than a bug.
pub fn extract(headers: &HeaderMap, uri: &Uri, host: &str, rule: &RateRule, patterns: &[Regex]) -> Vec<String> {
    let Some(raw) = raw_value(headers, uri, host, rule) else {
        return Vec::new();
    };

    if !rule.limit_by.is_match_mode() {
        return vec![raw];
    }

    let mut keys = Vec::new();
    for pattern in patterns {
        if let Some(captures) = pattern.captures(&raw) {
            if let Some(group) = captures.get(1) {
                keys.push(group.as_str().to_string());
            }
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(name: &str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            value.parse().unwrap(),
        );
        headers
    }

    #[test]
    fn per_header_capture_group_round_trips() {
        let headers = headers_with("h", "foo=bar;baz=qux");
        let rule = RateRule {
            rate: 1,
            burst: 1,
            limit_by: LimitBy::PerHeader("h".to_string()),
        };
        let patterns = vec![Regex::new(r"foo=(\w+)").unwrap()];
        let uri: Uri = "/".parse().unwrap();
        let keys = extract(&headers, &uri, "example.com", &rule, &patterns);
        assert_eq!(keys, vec!["bar".to_string()]);
    }

    #[test]
    fn no_matching_pattern_yields_empty_keys() {
        let headers = headers_with("h", "unrelated-value");
        let rule = RateRule {
            rate: 1,
            burst: 1,
            limit_by: LimitBy::PerHeader("h".to_string()),
        };
        let patterns = vec![Regex::new(r"foo=(\w+)").unwrap()];
        let uri: Uri = "/".parse().unwrap();
        let keys = extract(&headers, &uri, "example.com", &rule, &patterns);
        assert!(keys.is_empty());
    }

    #[test]
    fn missing_field_yields_empty_keys() {
        let headers = HeaderMap::new();
        let rule = RateRule {
            rate: 1,
            burst: 1,
            limit_by: LimitBy::Header("absent".to_string()),
        };
        let uri: Uri = "/".parse().unwrap();
        let keys = extract(&headers, &uri, "example.com", &rule, &[]);
        assert!(keys.is_empty());
    }

    #[test]
    fn consumer_reads_mse_consumer_header() {
        let headers = headers_with(CONSUMER_HEADER, "tenant-a");
        let rule = RateRule {
            rate: 1,
            burst: 1,
            limit_by: LimitBy::Consumer,
        };
        let uri: Uri = "/".parse().unwrap();
        let keys = extract(&headers, &uri, "example.com", &rule, &[]);
        assert_eq!(keys, vec!["tenant-a".to_string()]);
    }

    #[test]
    fn per_ip_uses_host() {
        let headers = HeaderMap::new();
        let rule = RateRule {
            rate: 1,
            burst: 1,
            limit_by: LimitBy::PerIp,
        };
        let patterns = vec![Regex::new(r"(.+)").unwrap()];
        let uri: Uri = "/".parse().unwrap();
        let keys = extract(&headers, &uri, "203.0.113.5", &rule, &patterns);
        assert_eq!(keys, vec!["203.0.113.5".to_string()]);
    }

    #[test]
    fn query_param_non_match_mode_returns_raw_value() {
        let headers = HeaderMap::new();
        let rule = RateRule {
            rate: 1,
            burst: 1,
            limit_by: LimitBy::QueryParam("tenant".to_string()),
        };
        let uri: Uri = "/v1/chat/completions?tenant=acme".parse().unwrap();
        let keys = extract(&headers, &uri, "example.com", &rule, &[]);
        assert_eq!(keys, vec!["acme".to_string()]);
    }
}
