use docbase_core::{Document, StoreError};
use reqwest::{Client as HttpClient, RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::config::RestConfig;

/// JSON client for a REST document endpoint.
///
/// ```text
/// GET    {base}/{collection}        -> [document, ...]
/// PUT    {base}/{collection}/{id}   <- document
/// DELETE {base}/{collection}/{id}
/// ```
#[derive(Debug, Clone)]
pub struct RestClient {
    http_client: HttpClient,
    config: RestConfig,
}

impl RestClient {
    pub fn new(config: RestConfig) -> Result<Self, StoreError> {
        let http_client = HttpClient::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| StoreError::Sync(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http_client,
            config,
        })
    }

    pub fn config(&self) -> &RestConfig {
        &self.config
    }

    fn collection_url(&self, collection: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            urlencoding::encode(collection)
        )
    }

    fn document_url(&self, collection: &str, id: &str) -> String {
        format!(
            "{}/{}",
            self.collection_url(collection),
            urlencoding::encode(id)
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Fetch every document of a collection. Entries that are not valid
    /// documents are skipped with a warning.
    #[instrument(skip(self), level = "debug")]
    pub async fn list(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        let url = self.collection_url(collection);
        let response = self
            .authorize(self.http_client.get(&url))
            .send()
            .await
            .map_err(|e| StoreError::Sync(format!("GET {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StoreError::Sync(format!(
                "GET {} failed with status {}: {}",
                url, status, text
            )));
        }

        let values: Vec<Value> = response
            .json()
            .await
            .map_err(|e| StoreError::Serialization(format!("Invalid list response: {}", e)))?;

        let mut docs = Vec::with_capacity(values.len());
        for value in values {
            match Document::from_value(value) {
                Ok(doc) => docs.push(doc),
                Err(e) => warn!(collection, error = %e, "Skipping invalid remote document"),
            }
        }
        debug!("GET {} ({} documents)", url, docs.len());
        Ok(docs)
    }

    /// Create or replace a document.
    #[instrument(skip(self, doc), level = "debug", fields(id = ?doc.id()))]
    pub async fn put(&self, collection: &str, doc: &Document) -> Result<(), StoreError> {
        let url = self.document_url(collection, doc.require_id()?);
        let response = self
            .authorize(self.http_client.put(&url))
            .json(doc)
            .send()
            .await
            .map_err(|e| StoreError::Sync(format!("PUT {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StoreError::Sync(format!(
                "PUT {} failed with status {}: {}",
                url, status, text
            )));
        }

        debug!("PUT {}", url);
        Ok(())
    }

    /// Delete a document. Returns `false` if the server did not have it.
    #[instrument(skip(self), level = "debug")]
    pub async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let url = self.document_url(collection, id);
        let response = self
            .authorize(self.http_client.delete(&url))
            .send()
            .await
            .map_err(|e| StoreError::Sync(format!("DELETE {} failed: {}", url, e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!("DELETE {} (already gone)", url);
            return Ok(false);
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StoreError::Sync(format!(
                "DELETE {} failed with status {}: {}",
                url, status, text
            )));
        }

        debug!("DELETE {}", url);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup() -> (RestClient, MockServer) {
        let server = MockServer::start().await;
        let client = RestClient::new(RestConfig::new(server.uri()).with_token("secret")).unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_list_skips_invalid_documents() {
        let (client, server) = setup().await;
        Mock::given(method("GET"))
            .and(path("/todos"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "1", "title": "a"},
                {"title": "no id"},
                {"id": "2"}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let docs = client.list("todos").await.unwrap();
        let ids: Vec<_> = docs.iter().filter_map(Document::id).collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_put_sends_document_json() {
        let (client, server) = setup().await;
        let doc = Document::new("a b").with("title", "spaced id");
        Mock::given(method("PUT"))
            .and(path("/todos/a%20b"))
            .and(body_json(json!({"id": "a b", "title": "spaced id"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        client.put("todos", &doc).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_treats_missing_as_success() {
        let (client, server) = setup().await;
        Mock::given(method("DELETE"))
            .and(path("/todos/1"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/todos/2"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert!(client.delete("todos", "1").await.unwrap());
        assert!(!client.delete("todos", "2").await.unwrap());
    }

    #[tokio::test]
    async fn test_server_error_is_sync_error() {
        let (client, server) = setup().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let err = client.put("todos", &Document::new("1")).await.unwrap_err();
        match err {
            StoreError::Sync(message) => {
                assert!(message.contains("503"));
                assert!(message.contains("maintenance"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
