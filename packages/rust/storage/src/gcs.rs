//! Remote artifact store over a GCS-style JSON API.
//!
//! Objects are addressed as `<prefix>/<path>` inside one bucket. Uploads are a
//! single media request, so an object is either fully visible or absent.

use std::time::Duration;

use async_trait::async_trait;
use feedingest_shared::{IngestError, Result, is_visible};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use crate::{ArtifactStore, check_key};

/// User-Agent string for store requests.
const USER_AGENT: &str = concat!("feedingest/", env!("CARGO_PKG_VERSION"));

/// Per-request timeout.
const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Artifact store backed by a bucket.
#[derive(Debug, Clone)]
pub struct GcsStore {
    client: Client,
    endpoint: Url,
    bucket: String,
    prefix: String,
    token: Option<String>,
}

/// Response body of an object listing.
#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    items: Vec<ObjectItem>,
    #[serde(default)]
    prefixes: Vec<String>,
    #[serde(default, rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectItem {
    name: String,
}

impl GcsStore {
    /// Build a store for `bucket[/prefix]` (the part after `gs://`).
    pub fn new(location: &str, endpoint: &str, token: Option<String>) -> Result<Self> {
        let location = location.trim_matches('/');
        let (bucket, prefix) = match location.split_once('/') {
            Some((bucket, prefix)) => (bucket, prefix.trim_matches('/')),
            None => (location, ""),
        };
        if bucket.is_empty() {
            return Err(IngestError::config("remote output URI is missing a bucket name"));
        }

        let endpoint = Url::parse(endpoint)
            .map_err(|e| IngestError::config(format!("invalid storage endpoint '{endpoint}': {e}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(IngestError::config(format!(
                "invalid storage endpoint '{endpoint}'"
            )));
        }

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| IngestError::storage(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            token,
        })
    }

    fn object_name(&self, path: &str) -> String {
        if self.prefix.is_empty() {
            path.to_string()
        } else if path.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}/{path}", self.prefix)
        }
    }

    /// `<endpoint>/<segments...>`, each segment percent-encoded.
    fn api_url(&self, segments: &[&str]) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty();
            path.extend(segments);
        }
        url
    }

    fn object_url(&self, path: &str) -> Url {
        let name = self.object_name(path);
        self.api_url(&["storage", "v1", "b", &self.bucket, "o", &name])
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<reqwest::Response> {
        self.authorized(request)
            .send()
            .await
            .map_err(|e| IngestError::storage(format!("{what}: {e}")))
    }
}

fn status_error(what: &str, status: StatusCode) -> IngestError {
    IngestError::storage(format!("{what}: HTTP {status}"))
}

#[async_trait]
impl ArtifactStore for GcsStore {
    fn root(&self) -> String {
        if self.prefix.is_empty() {
            format!("gs://{}", self.bucket)
        } else {
            format!("gs://{}/{}", self.bucket, self.prefix)
        }
    }

    #[instrument(skip_all, fields(bucket = %self.bucket))]
    async fn probe(&self) -> Result<()> {
        let url = self.api_url(&["storage", "v1", "b", &self.bucket]);
        let response = self.send(self.client.get(url), "probe bucket").await?;

        if !response.status().is_success() {
            return Err(status_error(
                &format!("bucket {} not reachable", self.bucket),
                response.status(),
            ));
        }
        debug!("remote store reachable");
        Ok(())
    }

    async fn write(&self, path: &str, bytes: &[u8]) -> Result<()> {
        check_key(path)?;
        let name = self.object_name(path);

        let mut url = self.api_url(&["upload", "storage", "v1", "b", &self.bucket, "o"]);
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", &name);

        let request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes.to_vec());
        let response = self.send(request, &format!("upload {name}")).await?;

        if !response.status().is_success() {
            return Err(status_error(&format!("upload {name}"), response.status()));
        }
        debug!(object = %name, size = bytes.len(), "uploaded artifact");
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        check_key(path)?;
        let mut url = self.object_url(path);
        url.query_pairs_mut().append_pair("alt", "media");

        let response = self.send(self.client.get(url), &format!("download {path}")).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(IngestError::ArtifactNotFound {
                path: path.to_string(),
            }),
            status if !status.is_success() => Err(status_error(&format!("download {path}"), status)),
            _ => response
                .bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(|e| IngestError::storage(format!("download {path}: {e}"))),
        }
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>> {
        if !dir.is_empty() {
            check_key(dir)?;
        }
        let base = self.object_name(dir);
        let list_prefix = if base.is_empty() {
            String::new()
        } else {
            format!("{base}/")
        };

        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = self.api_url(&["storage", "v1", "b", &self.bucket, "o"]);
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("prefix", &list_prefix);
                query.append_pair("delimiter", "/");
                if let Some(token) = &page_token {
                    query.append_pair("pageToken", token);
                }
            }

            let response = self.send(self.client.get(url), &format!("list {dir}")).await?;
            if !response.status().is_success() {
                return Err(status_error(&format!("list {dir}"), response.status()));
            }
            let body = response
                .bytes()
                .await
                .map_err(|e| IngestError::storage(format!("list {dir}: {e}")))?;
            let page: ListResponse = serde_json::from_slice(&body)
                .map_err(|e| IngestError::storage(format!("list {dir}: malformed response: {e}")))?;

            let children = page
                .items
                .iter()
                .map(|item| item.name.as_str())
                .chain(page.prefixes.iter().map(String::as_str))
                .filter_map(|full| full.strip_prefix(&list_prefix))
                .map(|rest| rest.trim_end_matches('/'))
                .filter(|name| is_visible(name) && !name.contains('/'));
            names.extend(children.map(str::to_string));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        check_key(path)?;
        let url = self.object_url(path);
        let response = self.send(self.client.get(url), &format!("stat {path}")).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(status_error(&format!("stat {path}"), status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store_for(server: &MockServer) -> GcsStore {
        GcsStore::new("test-bucket/feeds", &server.uri(), Some("secret".into())).unwrap()
    }

    #[test]
    fn parses_bucket_and_prefix() {
        let store = GcsStore::new("bucket", "https://storage.googleapis.com", None).unwrap();
        assert_eq!(store.root(), "gs://bucket");
        assert_eq!(store.object_name("ca/x"), "ca/x");

        let store =
            GcsStore::new("bucket/a/b/", "https://storage.googleapis.com", None).unwrap();
        assert_eq!(store.root(), "gs://bucket/a/b");
        assert_eq!(store.object_name("ca/x"), "a/b/ca/x");

        assert!(GcsStore::new("", "https://storage.googleapis.com", None).is_err());
    }

    #[tokio::test]
    async fn write_uploads_media_with_auth() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/upload/storage/v1/b/test-bucket/o"))
            .and(query_param("uploadType", "media"))
            .and(query_param("name", "feeds/ca/sf_gov/raw/run1/data.json"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server);
        store
            .write("ca/sf_gov/raw/run1/data.json", b"{\"a\":1}")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn read_missing_object_is_not_found() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path_regex(r"^/storage/v1/b/test-bucket/o/.+$"))
            .and(query_param("alt", "media"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = store_for(&server);
        let err = store.read("ca/sf_gov/raw/run1/data.json").await.unwrap_err();
        assert!(matches!(err, IngestError::ArtifactNotFound { .. }));
    }

    #[tokio::test]
    async fn read_returns_body() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path_regex(r"^/storage/v1/b/test-bucket/o/.+$"))
            .and(query_param("alt", "media"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"line1\nline2\n".to_vec()))
            .mount(&server)
            .await;

        let store = store_for(&server);
        let bytes = store.read("ca/sf_gov/raw/run1/data.json").await.unwrap();
        assert_eq!(bytes, b"line1\nline2\n");
    }

    #[tokio::test]
    async fn list_merges_items_and_prefixes() {
        let server = MockServer::start().await;

        let body = serde_json::json!({
            "items": [
                {"name": "feeds/ca/sf_gov/raw/b.json"},
                {"name": "feeds/ca/sf_gov/raw/_meta.json"},
                {"name": "feeds/ca/sf_gov/raw/a.json"}
            ],
            "prefixes": ["feeds/ca/sf_gov/raw/2021-04-01T00:00:00/"]
        });

        Mock::given(method("GET"))
            .and(path("/storage/v1/b/test-bucket/o"))
            .and(query_param("prefix", "feeds/ca/sf_gov/raw/"))
            .and(query_param("delimiter", "/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let store = store_for(&server);
        let names = store.list("ca/sf_gov/raw").await.unwrap();
        assert_eq!(names, vec!["2021-04-01T00:00:00", "a.json", "b.json"]);
    }

    #[tokio::test]
    async fn probe_reports_unreachable_bucket() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/storage/v1/b/test-bucket"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let store = store_for(&server);
        let err = store.probe().await.unwrap_err();
        assert!(err.is_storage());
        assert!(err.to_string().contains("403"));
    }

    #[tokio::test]
    async fn exists_maps_status_codes() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path_regex(r"^/storage/v1/b/test-bucket/o/.+$"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = store_for(&server);
        assert!(!store.exists("ca/sf_gov/raw/run1/data.json").await.unwrap());
    }
}
