//! Normalized inbound request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// An inbound request as seen by the engine.
///
/// Built once per call by the web-server layer and never mutated afterwards;
/// the engine only ever borrows it. Header keys are lower-cased.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub domain: String,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub client_ip: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub referer: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default, deserialize_with = "lowercase_keys")]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Transport (JA3/JA4-style) fingerprint if the edge computed one
    #[serde(default)]
    pub tls_fingerprint: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn lowercase_keys<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = HashMap::<String, String>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(k, v)| (k.to_lowercase(), v))
        .collect())
}

impl Request {
    /// Create a GET request with the current timestamp and no headers.
    pub fn new(id: impl Into<String>, domain: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            timestamp: Utc::now(),
            domain: domain.into(),
            url: url.into(),
            method: default_method(),
            client_ip: String::new(),
            user_agent: String::new(),
            referer: None,
            content_type: None,
            headers: HashMap::new(),
            metadata: HashMap::new(),
            tls_fingerprint: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = ip.into();
        self
    }

    /// Set the user-agent field and mirror it into the header map.
    pub fn with_user_agent(mut self, ua: impl Into<String>) -> Self {
        let ua = ua.into();
        self.headers.insert("user-agent".to_string(), ua.clone());
        self.user_agent = ua;
        self
    }

    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        let referer = referer.into();
        self.headers.insert("referer".to_string(), referer.clone());
        self.referer = Some(referer);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Add a header; the name is lower-cased.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_lowercase(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_tls_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.tls_fingerprint = Some(fingerprint.into());
        self
    }

    /// Get a header value (case-insensitive name).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(|s| s.as_str())
    }

    /// The user-agent, preferring the dedicated field over the header map.
    pub fn user_agent(&self) -> &str {
        if !self.user_agent.is_empty() {
            return &self.user_agent;
        }
        self.header("user-agent").unwrap_or("")
    }

    /// The referer, preferring the dedicated field over the header map.
    pub fn referer(&self) -> Option<&str> {
        self.referer
            .as_deref()
            .or_else(|| self.header("referer"))
            .filter(|r| !r.is_empty())
    }

    /// Path component of the URL without query string or fragment.
    pub fn path(&self) -> &str {
        let without_scheme = match self.url.find("://") {
            Some(idx) => {
                let rest = &self.url[idx + 3..];
                match rest.find('/') {
                    Some(slash) => &rest[slash..],
                    None => "/",
                }
            }
            None => self.url.as_str(),
        };
        let end = without_scheme
            .find(['?', '#'])
            .unwrap_or(without_scheme.len());
        &without_scheme[..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let req = Request::new("r1", "example.com", "/")
            .with_header("Accept-Language", "en-US");
        assert_eq!(req.header("accept-language"), Some("en-US"));
        assert_eq!(req.header("ACCEPT-LANGUAGE"), Some("en-US"));
        assert_eq!(req.header("accept"), None);
    }

    #[test]
    fn test_path_extraction() {
        let req = Request::new("r1", "example.com", "https://example.com/blog/post?id=3#top");
        assert_eq!(req.path(), "/blog/post");

        let req = Request::new("r2", "example.com", "/robots.txt");
        assert_eq!(req.path(), "/robots.txt");

        let req = Request::new("r3", "example.com", "https://example.com");
        assert_eq!(req.path(), "/");
    }

    #[test]
    fn test_deserialize_lowercases_headers() {
        let json = r#"{
            "id": "r1",
            "domain": "example.com",
            "url": "/",
            "headers": {"User-Agent": "GPTBot/1.0", "Accept": "*/*"}
        }"#;
        let req: Request = serde_json::from_str(json).unwrap();
        assert_eq!(req.header("user-agent"), Some("GPTBot/1.0"));
        assert_eq!(req.user_agent(), "GPTBot/1.0");
        assert_eq!(req.method, "GET");
    }

    #[test]
    fn test_empty_referer_is_none() {
        let req = Request::new("r1", "example.com", "/").with_header("referer", "");
        assert_eq!(req.referer(), None);
    }
}
