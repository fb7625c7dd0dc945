//! 📡 The networked store: documents go out over HTTP, one bulk-framed POST at a time.
//!
//! Every endpoint hangs off the host URL:
//! - `GET  /v1/config/directory-creation`
//! - `GET  /v1/documents/count?prefix=`
//! - `DELETE /v1/documents?prefix=`
//! - `POST /v1/transactions`, then `/{txid}/commit` or `/{txid}/rollback`
//! - `POST /v1/bulk[?txid=]`
//!
//! 🔄 This backend does not retry. A non-2xx is a `PumpError::Write` with the status and
//! whatever the server had to say for itself. Retries are the caller's problem. Good luck. 🦆

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::backends::{BulkEntry, ContentStore, DirectoryCreation, TxId, bulk};
use crate::errors::PumpError;

/// 🔧 How to reach (and authenticate with) one store host.
#[derive(Debug, Deserialize, Clone)]
pub struct HttpStoreConfig {
    /// 📡 Base URL. In fast-path mode each host in the partition map replaces it.
    #[serde(default = "default_url")]
    pub url: String,
    /// 🔒 Username. The bouncer at the club. Except the club is a database.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// 🔒 API key. Wins over basic auth when both are set.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for HttpStoreConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            username: None,
            password: None,
            api_key: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DirectoryCreationBody {
    mode: DirectoryCreation,
}

#[derive(Debug, Deserialize)]
struct CountBody {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct TransactionBody {
    txid: String,
}

/// 📡 One host's worth of HTTP client. The client itself pools connections underneath.
#[derive(Debug)]
pub(crate) struct HttpStore {
    client: reqwest::Client,
    config: HttpStoreConfig,
}

impl HttpStore {
    pub(crate) fn new(config: HttpStoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("💀 The HTTP client refused to be born. Probably TLS. It's always TLS.")?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), path)
    }

    /// 🔗 Endpoint plus properly escaped query pairs.
    fn endpoint_with(&self, path: &str, params: &[(&str, &str)]) -> Result<reqwest::Url> {
        let raw = self.endpoint(path);
        let parsed = if params.is_empty() {
            reqwest::Url::parse(&raw)
        } else {
            reqwest::Url::parse_with_params(&raw, params)
        };
        parsed.with_context(|| format!("💀 '{raw}' is not a URL anyone can send a request to"))
    }

    /// 🔒 Auth priority: API key wins over basic auth. This is not a democracy.
    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(ref api_key) = self.config.api_key {
            request.header("Authorization", format!("ApiKey {}", api_key))
        } else if let Some(ref username) = self.config.username {
            request.basic_auth(username, self.config.password.as_ref())
        } else {
            request
        }
    }

    /// 📬 Send, insist on 2xx, hand back the body bytes.
    async fn exchange(&self, request: reqwest::RequestBuilder, what: &str) -> Result<Vec<u8>> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| PumpError::write(&self.config.url, format!("{what}: {e}")))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| PumpError::write(&self.config.url, format!("{what}: reading body: {e}")))?;
        if !status.is_success() {
            return Err(PumpError::write(
                &self.config.url,
                format!("{what} returned {status}: {}", String::from_utf8_lossy(&body)),
            )
            .into());
        }
        trace!(what, bytes = body.len(), "📬 store answered");
        Ok(body.to_vec())
    }

    fn parse<T: for<'de> Deserialize<'de>>(&self, body: &[u8], what: &str) -> Result<T> {
        serde_json::from_slice(body).with_context(|| {
            format!(
                "💀 '{}' answered {what} with something that isn't the JSON we expected",
                self.config.url
            )
        })
    }
}

#[async_trait]
impl ContentStore for HttpStore {
    async fn directory_creation(&self) -> Result<DirectoryCreation> {
        let request = self.client.get(self.endpoint("/v1/config/directory-creation"));
        let body = self.exchange(request, "directory creation lookup").await?;
        Ok(self.parse::<DirectoryCreationBody>(&body, "directory creation lookup")?.mode)
    }

    async fn count_under(&self, prefix: &str) -> Result<u64> {
        let url = self.endpoint_with("/v1/documents/count", &[("prefix", prefix)])?;
        let request = self.client.get(url);
        let body = self.exchange(request, "document count").await?;
        Ok(self.parse::<CountBody>(&body, "document count")?.count)
    }

    async fn delete_under(&self, prefix: &str) -> Result<()> {
        let url = self.endpoint_with("/v1/documents", &[("prefix", prefix)])?;
        let request = self.client.delete(url);
        self.exchange(request, "prefix delete").await?;
        Ok(())
    }

    async fn open_transaction(&self) -> Result<TxId> {
        let request = self.client.post(self.endpoint("/v1/transactions"));
        let body = self.exchange(request, "transaction open").await?;
        let opened: TransactionBody = self.parse(&body, "transaction open")?;
        debug!(txid = %opened.txid, host = %self.config.url, "🧾 transaction opened");
        Ok(TxId(opened.txid))
    }

    async fn submit(&self, txn: Option<&TxId>, batch: &[BulkEntry]) -> Result<()> {
        let payload = bulk::encode(batch)?;
        let params: Vec<(&str, &str)> = txn.map(|t| ("txid", t.0.as_str())).into_iter().collect();
        let url = self.endpoint_with("/v1/bulk", &params)?;
        let request = self
            .client
            .post(url)
            .header("Content-Type", "application/x-cpx-bulk")
            .body(payload);
        self.exchange(request, "bulk submission").await?;
        Ok(())
    }

    async fn commit(&self, txn: &TxId) -> Result<()> {
        let request = self
            .client
            .post(self.endpoint(&format!("/v1/transactions/{}/commit", txn.0)));
        self.exchange(request, "transaction commit").await?;
        Ok(())
    }

    async fn rollback(&self, txn: &TxId) -> Result<()> {
        let request = self
            .client
            .post(self.endpoint(&format!("/v1/transactions/{}/rollback", txn.0)));
        self.exchange(request, "transaction rollback").await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        debug!("🗑️ HTTP store closing, no buffer to flush, just vibes to release");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ContentKind, Document};
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store_for(server: &MockServer) -> Result<HttpStore> {
        HttpStore::new(HttpStoreConfig {
            url: server.uri(),
            username: Some("ignored".to_string()),
            password: None,
            api_key: Some("sekrit".to_string()),
            timeout_secs: 5,
        })
    }

    #[tokio::test]
    async fn the_one_where_a_transaction_goes_all_the_way_round() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/transactions"))
            .and(header("Authorization", "ApiKey sekrit"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"txid":"t-1"}"#))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/bulk"))
            .and(query_param("txid", "t-1"))
            .and(body_string_contains(r#""uri":"/doc.xml""#))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/transactions/t-1/commit"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server)?;
        let txn = store.open_transaction().await?;
        let doc = Document::new(b"<a/>".to_vec(), ContentKind::Xml);
        store.submit(Some(&txn), &[BulkEntry::new("/doc.xml", doc)]).await?;
        store.commit(&txn).await?;
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_503_becomes_a_write_error() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/bulk"))
            .respond_with(ResponseTemplate::new(503).set_body_string("shard on fire"))
            .mount(&server)
            .await;

        let store = store_for(&server)?;
        let err = store
            .submit(None, &[BulkEntry::new("/x", Document::new(b"x".to_vec(), ContentKind::Text))])
            .await
            .expect_err("503 must not be a success");
        match err.downcast_ref::<PumpError>() {
            Some(PumpError::Write { reason, .. }) => assert!(reason.contains("shard on fire")),
            other => panic!("💀 Expected a write error, serde took us to {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_we_ask_how_full_the_room_is() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/documents/count"))
            .and(query_param("prefix", "/out/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"count":7}"#))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/config/directory-creation"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"mode":"automatic"}"#))
            .mount(&server)
            .await;

        let store = store_for(&server)?;
        assert_eq!(store.count_under("/out/").await?, 7);
        assert_eq!(store.directory_creation().await?, DirectoryCreation::Automatic);
        Ok(())
    }
}
