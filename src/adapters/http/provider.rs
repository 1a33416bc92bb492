//! HTTP Batch Provider Client
//!
//! Generic JSON batch endpoint:
//!
//! ```text
//! GET {base_url}{path}?ids=a,b,c
//! {"data": {"a": {...}, "b": {...}}, "errors": {"c": "not_found"}}
//! ```
//!
//! Retries are left to the orchestrator; this client only classifies failures.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::ports::{BatchResponse, KeyError, ProviderClient, ProviderError};

/// Solana mint addresses decode to 32 bytes of base58
const MINT_KEY_BYTES: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub path: String,
    /// Overrides the provider-wide batch size
    pub max_batch_size: Option<usize>,
    /// Overrides the provider-wide base cost
    pub base_cost: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpProviderConfig {
    pub base_url: String,
    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_base_cost")]
    pub base_cost: f64,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Reject keys that are not base58 32-byte mint addresses before sending
    #[serde(default)]
    pub validate_mint_keys: bool,
    #[serde(default)]
    pub endpoints: BTreeMap<String, EndpointConfig>,
}

fn default_api_key_header() -> String {
    "X-API-KEY".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_base_cost() -> f64 {
    1.0
}

fn default_max_batch_size() -> usize {
    50
}

impl HttpProviderConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key_env: None,
            api_key_header: default_api_key_header(),
            timeout_secs: default_timeout_secs(),
            base_cost: default_base_cost(),
            max_batch_size: default_max_batch_size(),
            validate_mint_keys: false,
            endpoints: BTreeMap::new(),
        }
    }

    pub fn with_endpoint(mut self, name: &str, path: &str) -> Self {
        self.endpoints.insert(
            name.to_string(),
            EndpointConfig {
                path: path.to_string(),
                max_batch_size: None,
                base_cost: None,
            },
        );
        self
    }
}

#[derive(Debug, Deserialize)]
struct BatchEnvelope {
    #[serde(default)]
    data: HashMap<String, Value>,
    #[serde(default)]
    errors: HashMap<String, String>,
}

/// Base58 that decodes to exactly 32 bytes
pub fn is_valid_mint_key(key: &str) -> bool {
    bs58::decode(key)
        .into_vec()
        .map(|bytes| bytes.len() == MINT_KEY_BYTES)
        .unwrap_or(false)
}

/// Integer seconds form of `Retry-After`; HTTP dates are ignored
fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone)]
pub struct HttpProviderClient {
    name: String,
    config: HttpProviderConfig,
    api_key: Option<String>,
    http: Client,
}

impl HttpProviderClient {
    pub fn new(
        name: impl Into<String>,
        config: HttpProviderConfig,
        api_key: Option<String>,
    ) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProviderError::Fatal(format!("HTTP client: {}", e)))?;

        Ok(Self {
            name: name.into(),
            config,
            api_key,
            http,
        })
    }

    /// Read the API key from the environment variable named in config.
    pub fn from_env(name: impl Into<String>, config: HttpProviderConfig) -> Result<Self, ProviderError> {
        let name = name.into();
        let api_key = match &config.api_key_env {
            Some(var) => match std::env::var(var) {
                Ok(key) => Some(key),
                Err(_) => {
                    tracing::warn!("{} not set, calling {} without an API key", var, name);
                    None
                }
            },
            None => None,
        };
        Self::new(name, config, api_key)
    }

    fn endpoint(&self, endpoint: &str) -> Result<&EndpointConfig, ProviderError> {
        self.config
            .endpoints
            .get(endpoint)
            .ok_or_else(|| ProviderError::UnknownEndpoint(endpoint.to_string()))
    }

    async fn send(&self, path: &str, keys: &[String]) -> Result<BatchEnvelope, ProviderError> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let mut request = self.http.get(&url).query(&[("ids", keys.join(","))]);
        if let Some(key) = &self.api_key {
            request = request.header(self.config.api_key_header.as_str(), key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Transient(format!("timeout: {}", e))
            } else {
                ProviderError::Transient(e.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited {
                retry_after: retry_after(&response),
            });
        }
        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound);
        }
        if status.is_server_error() {
            return Err(ProviderError::Transient(format!("server error: {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Fatal(format!("{}: {}", status, body)));
        }

        response
            .json::<BatchEnvelope>()
            .await
            .map_err(|e| ProviderError::Transient(format!("invalid response body: {}", e)))
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_batch_size(&self, endpoint: &str) -> usize {
        self.config
            .endpoints
            .get(endpoint)
            .and_then(|e| e.max_batch_size)
            .unwrap_or(self.config.max_batch_size)
    }

    fn base_cost(&self, endpoint: &str) -> f64 {
        self.config
            .endpoints
            .get(endpoint)
            .and_then(|e| e.base_cost)
            .unwrap_or(self.config.base_cost)
    }

    async fn fetch_batch(&self, endpoint: &str, keys: &[String]) -> Result<BatchResponse, ProviderError> {
        let path = self.endpoint(endpoint)?.path.clone();
        let mut results = BatchResponse::with_capacity(keys.len());

        let valid: Vec<String> = if self.config.validate_mint_keys {
            keys.iter()
                .filter(|key| {
                    let ok = is_valid_mint_key(key);
                    if !ok {
                        results.insert(
                            (*key).clone(),
                            Err(KeyError::Malformed("not a base58 mint address".to_string())),
                        );
                    }
                    ok
                })
                .cloned()
                .collect()
        } else {
            keys.to_vec()
        };
        if valid.is_empty() {
            return Ok(results);
        }

        let envelope = self.send(&path, &valid).await?;
        tracing::debug!(
            provider = %self.name,
            endpoint,
            requested = valid.len(),
            returned = envelope.data.len(),
            errors = envelope.errors.len(),
            "Batch fetched"
        );

        for (key, value) in envelope.data {
            results.insert(key, Ok(value));
        }
        for (key, error) in envelope.errors {
            let error = match error.as_str() {
                "not_found" | "NOT_FOUND" => KeyError::NotFound,
                _ => KeyError::Malformed(error),
            };
            results.entry(key).or_insert(Err(error));
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MINT: &str = "So11111111111111111111111111111111111111112";

    fn client(base_url: &str, validate: bool) -> HttpProviderClient {
        let mut config = HttpProviderConfig::new(base_url).with_endpoint("overview", "/v1/overview");
        config.validate_mint_keys = validate;
        config.max_batch_size = 20;
        HttpProviderClient::new("birdeye", config, Some("secret".to_string())).unwrap()
    }

    async fn respond_with(template: ResponseTemplate) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/overview"))
            .respond_with(template)
            .mount(&server)
            .await;
        server
    }

    async fn fetch_one(server: &MockServer) -> Result<BatchResponse, ProviderError> {
        client(&server.uri(), false)
            .fetch_batch("overview", &["a".to_string()])
            .await
    }

    #[test]
    fn test_mint_key_validation() {
        assert!(is_valid_mint_key(MINT));
        assert!(!is_valid_mint_key("not-base58-0OIl"));
        assert!(!is_valid_mint_key("abc"));
    }

    #[test]
    fn test_endpoint_overrides() {
        let mut config = HttpProviderConfig::new("http://localhost").with_endpoint("a", "/a");
        config.endpoints.get_mut("a").unwrap().max_batch_size = Some(5);
        config.endpoints.get_mut("a").unwrap().base_cost = Some(15.0);
        let client = HttpProviderClient::new("p", config, None).unwrap();
        assert_eq!(client.max_batch_size("a"), 5);
        assert_eq!(client.base_cost("a"), 15.0);
        assert_eq!(client.max_batch_size("other"), 50);
        assert_eq!(client.base_cost("other"), 1.0);
    }

    #[tokio::test]
    async fn test_unknown_endpoint() {
        let client = client("http://127.0.0.1:9", false);
        let err = client.fetch_batch("nope", &["a".to_string()]).await.unwrap_err();
        assert_eq!(err, ProviderError::UnknownEndpoint("nope".to_string()));
    }

    #[tokio::test]
    async fn test_parses_data_and_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/overview"))
            .and(query_param("ids", "a,b,c"))
            .and(header("x-api-key", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"a": {"price": 1.5}},
                "errors": {"b": "not_found", "c": "bad key"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let results = client(&server.uri(), false)
            .fetch_batch("overview", &keys)
            .await
            .unwrap();

        assert_eq!(results["a"], Ok(json!({"price": 1.5})));
        assert_eq!(results["b"], Err(KeyError::NotFound));
        assert!(matches!(results["c"], Err(KeyError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_key_absent_from_envelope_is_not_reported() {
        let server = respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}}))).await;
        let results = fetch_one(&server).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_429_maps_to_rate_limited() {
        let server =
            respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7")).await;
        assert_eq!(
            fetch_one(&server).await.unwrap_err(),
            ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
    }

    #[tokio::test]
    async fn test_429_without_retry_after() {
        let server = respond_with(ResponseTemplate::new(429)).await;
        assert_eq!(
            fetch_one(&server).await.unwrap_err(),
            ProviderError::RateLimited { retry_after: None }
        );
    }

    #[tokio::test]
    async fn test_404_maps_to_not_found() {
        let server = respond_with(ResponseTemplate::new(404)).await;
        assert_eq!(fetch_one(&server).await.unwrap_err(), ProviderError::NotFound);
    }

    #[tokio::test]
    async fn test_5xx_is_retryable() {
        let server = respond_with(ResponseTemplate::new(503)).await;
        assert!(fetch_one(&server).await.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_client_error_is_fatal() {
        let server = respond_with(ResponseTemplate::new(401).set_body_string("bad key")).await;
        let err = fetch_one(&server).await.unwrap_err();
        assert!(matches!(err, ProviderError::Fatal(msg) if msg.contains("bad key")));
    }

    #[tokio::test]
    async fn test_invalid_body_is_transient() {
        let server = respond_with(ResponseTemplate::new(200).set_body_string("<html>")).await;
        assert!(matches!(
            fetch_one(&server).await.unwrap_err(),
            ProviderError::Transient(_)
        ));
    }

    #[tokio::test]
    async fn test_malformed_keys_never_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/overview"))
            .and(query_param("ids", MINT))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {MINT: {"price": 2.0}}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let keys = vec![MINT.to_string(), "bogus".to_string()];
        let results = client(&server.uri(), true)
            .fetch_batch("overview", &keys)
            .await
            .unwrap();
        assert_eq!(results[MINT], Ok(json!({"price": 2.0})));
        assert!(matches!(results["bogus"], Err(KeyError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_all_malformed_keys_skip_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let results = client(&server.uri(), true)
            .fetch_batch("overview", &["bogus".to_string()])
            .await
            .unwrap();
        assert!(matches!(results["bogus"], Err(KeyError::Malformed(_))));
    }
}
