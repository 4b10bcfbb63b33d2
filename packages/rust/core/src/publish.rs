//! Load normalized records into the external record service.
//!
//! Protocol (bearer API key on every request):
//! 1. `GET /api/verifyToken` must answer 200
//! 2. `POST /api/startImportRun` returns `{"import_run_id": ...}`
//! 3. `POST /api/importSourceLocations?import_run_id=<id>` with an ndjson body
//!    of import records, once per batch

use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tracing::{debug, info, instrument, warn};
use url::Url;

use feedingest_shared::{IngestError, PublishConfig, Result, SiteId, Stage};
use feedingest_storage::ArtifactStore;

use crate::pipeline::latest_run_dir;
use crate::validate::RecordValidator;

/// User-Agent string for record service requests.
const USER_AGENT: &str = concat!("feedingest/", env!("CARGO_PKG_VERSION"));

/// Per-request timeout.
const REQUEST_TIMEOUT_SECS: u64 = 120;

const NDJSON: &str = "application/x-ndjson";

// ---------------------------------------------------------------------------
// Import records
// ---------------------------------------------------------------------------

/// How the service should reconcile an import record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchAction {
    pub action: String,
}

/// One location as the record service imports it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportRecord {
    pub source_uid: String,
    pub source_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    /// The full normalized record.
    pub import_json: Value,
    #[serde(rename = "match")]
    pub match_action: MatchAction,
}

impl ImportRecord {
    /// Build an import record from a normalized record that already passed
    /// validation.
    pub fn from_normalized(record: Value) -> Option<Self> {
        let source_uid = record.get("id")?.as_str()?.to_string();
        let source_name = record.get("source")?.get("source")?.as_str()?.to_string();
        let name = record.get("name").and_then(Value::as_str).map(str::to_string);
        let location = record.get("location");
        let coordinate = |field: &str| location.and_then(|l| l.get(field)).and_then(Value::as_f64);

        Some(Self {
            source_uid,
            source_name,
            name,
            latitude: coordinate("latitude"),
            longitude: coordinate("longitude"),
            import_json: record,
            match_action: MatchAction {
                action: "new".into(),
            },
        })
    }
}

/// Import records read from one site's latest normalize run.
#[derive(Debug, Clone, Default)]
pub struct SiteRecords {
    pub run_dir: Option<String>,
    pub records: Vec<ImportRecord>,
    /// Records that failed validation and will not be sent.
    pub skipped: usize,
}

/// Read the latest normalize output of `site` as import records.
#[instrument(skip_all, fields(site = %site))]
pub async fn collect_site_records(store: &dyn ArtifactStore, site: &SiteId) -> Result<SiteRecords> {
    let Some(run_dir) = latest_run_dir(store, site, Stage::Normalize).await? else {
        return Ok(SiteRecords::default());
    };
    let suffix = Stage::Normalize.output_suffix().unwrap_or_default();

    let mut validator = RecordValidator::new();
    let mut collected = SiteRecords {
        run_dir: Some(run_dir.clone()),
        ..SiteRecords::default()
    };

    for name in store.list(&run_dir).await? {
        if !name.ends_with(suffix) {
            debug!(name, "skipping non-normalized artifact");
            continue;
        }
        let bytes = store.read(&format!("{run_dir}/{name}")).await?;
        let mut lines = bytes.as_slice().lines();
        let mut line_no = 0;
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| IngestError::validation(format!("{name}: {e}")))?
        {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let findings = validator.check_line(&name, line_no, &line);
            let record = findings
                .is_empty()
                .then(|| serde_json::from_str::<Value>(&line).ok())
                .flatten()
                .and_then(ImportRecord::from_normalized);
            match record {
                Some(record) => collected.records.push(record),
                None => {
                    warn!(artifact = %name, line = line_no, "skipping invalid record");
                    collected.skipped += 1;
                }
            }
        }
    }

    Ok(collected)
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client for the record service.
#[derive(Debug, Clone)]
pub struct Publisher {
    client: Client,
    server: Url,
    api_key: String,
}

impl Publisher {
    pub fn new(config: &PublishConfig, api_key: impl Into<String>) -> Result<Self> {
        let server = Url::parse(&config.server).map_err(|e| {
            IngestError::config(format!("invalid publish server '{}': {e}", config.server))
        })?;
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| IngestError::Publish(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            server,
            api_key: api_key.into(),
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.server
            .join(path)
            .map_err(|e| IngestError::Publish(format!("invalid URL for {path}: {e}")))
    }

    /// Fail unless the service accepts the API key.
    #[instrument(skip_all)]
    pub async fn verify_token(&self) -> Result<()> {
        let resp = self
            .client
            .get(self.url("/api/verifyToken")?)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| IngestError::Publish(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(IngestError::Publish(format!(
                "API key rejected (HTTP {})",
                resp.status()
            )));
        }
        Ok(())
    }

    /// Open an import run and return its id.
    #[instrument(skip_all)]
    pub async fn start_import_run(&self) -> Result<String> {
        let resp = self
            .client
            .post(self.url("/api/startImportRun")?)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| IngestError::Publish(e.to_string()))?
            .error_for_status()
            .map_err(|e| IngestError::Publish(format!("failed to start import run: {e}")))?;

        let body: Value = resp
            .json()
            .await
            .map_err(|e| IngestError::Publish(format!("invalid import run response: {e}")))?;

        match body.get("import_run_id") {
            Some(Value::String(id)) => Ok(id.clone()),
            Some(Value::Number(id)) => Ok(id.to_string()),
            _ => Err(IngestError::Publish(
                "import run response has no import_run_id".into(),
            )),
        }
    }

    /// Send one batch of import records.
    #[instrument(skip_all, fields(import_run_id = %import_run_id, records = records.len()))]
    pub async fn import(&self, import_run_id: &str, records: &[ImportRecord]) -> Result<()> {
        let mut url = self.url("/api/importSourceLocations")?;
        url.query_pairs_mut().append_pair("import_run_id", import_run_id);

        self.client
            .post(url)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::CONTENT_TYPE, NDJSON)
            .body(encode_ndjson(records)?)
            .send()
            .await
            .map_err(|e| IngestError::Publish(e.to_string()))?
            .error_for_status()
            .map_err(|e| IngestError::Publish(format!("import rejected: {e}")))?;
        Ok(())
    }
}

fn encode_ndjson(records: &[ImportRecord]) -> Result<String> {
    let lines = records
        .iter()
        .map(serde_json::to_string)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| IngestError::Publish(format!("failed to encode import records: {e}")))?;
    Ok(lines.join("\n"))
}

// ---------------------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------------------

/// What happened to one site's records.
#[derive(Debug, Clone, Serialize)]
pub struct SitePublish {
    pub site: SiteId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_dir: Option<String>,
    pub records: usize,
    pub skipped: usize,
    pub batches: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a publish invocation.
#[derive(Debug, Clone, Serialize)]
pub struct PublishSummary {
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import_run_id: Option<String>,
    pub sites: Vec<SitePublish>,
}

impl PublishSummary {
    pub fn records(&self) -> usize {
        self.sites.iter().map(|s| s.records).sum()
    }

    pub fn failed_sites(&self) -> usize {
        self.sites.iter().filter(|s| s.error.is_some()).count()
    }
}

/// Publish the latest normalize output of each site.
///
/// Without a publisher this is a dry run: records are read, validated, and
/// batched, but nothing is sent. A site whose upload fails is recorded and
/// the remaining sites still publish.
#[instrument(skip_all, fields(sites = sites.len(), dry_run = publisher.is_none()))]
pub async fn publish_sites(
    store: &dyn ArtifactStore,
    sites: &[SiteId],
    publisher: Option<&Publisher>,
    batch_size: usize,
) -> Result<PublishSummary> {
    let batch_size = batch_size.max(1);

    let import_run_id = match publisher {
        Some(publisher) => {
            publisher.verify_token().await?;
            let id = publisher.start_import_run().await?;
            info!(import_run_id = %id, "import run started");
            Some(id)
        }
        None => None,
    };

    let mut summary = PublishSummary {
        dry_run: publisher.is_none(),
        import_run_id: import_run_id.clone(),
        sites: Vec::with_capacity(sites.len()),
    };

    for site in sites {
        let mut entry = SitePublish {
            site: site.clone(),
            run_dir: None,
            records: 0,
            skipped: 0,
            batches: 0,
            error: None,
        };

        let collected = match collect_site_records(store, site).await {
            Ok(collected) => collected,
            Err(e) => {
                warn!(%site, error = %e, "could not read normalize output");
                entry.error = Some(e.to_string());
                summary.sites.push(entry);
                continue;
            }
        };
        entry.run_dir = collected.run_dir;
        entry.skipped = collected.skipped;

        if entry.run_dir.is_none() {
            warn!(%site, "no normalize output to publish");
        }

        for batch in collected.records.chunks(batch_size) {
            if let (Some(publisher), Some(id)) = (publisher, import_run_id.as_deref()) {
                if let Err(e) = publisher.import(id, batch).await {
                    warn!(%site, error = %e, "import failed");
                    entry.error = Some(e.to_string());
                    break;
                }
            }
            entry.batches += 1;
            entry.records += batch.len();
        }

        info!(%site, records = entry.records, skipped = entry.skipped, "site published");
        summary.sites.push(entry);
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::COMPLETE_MARKER;
    use feedingest_storage::LocalStore;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(id: &str, lat: f64) -> String {
        serde_json::json!({
            "id": id,
            "name": "Clinic",
            "location": {"latitude": lat, "longitude": -122.0},
            "source": {"source": "ca_sf", "id": id, "data": {}},
        })
        .to_string()
    }

    async fn seeded_store(dir: &std::path::Path) -> LocalStore {
        let store = LocalStore::new(dir);
        let lines = [
            record("ca_sf:1", 37.0),
            record("ca_sf:2", 300.0),
            record("ca_sf:3", 38.0),
            record("ca_sf:4", 39.0),
        ]
        .join("\n");
        store
            .write(
                "ca/sf/normalized/2021-01-01T00:00:00/sites.normalized.ndjson",
                lines.as_bytes(),
            )
            .await
            .unwrap();
        // Older run must be ignored.
        store
            .write(
                "ca/sf/normalized/2020-01-01T00:00:00/sites.normalized.ndjson",
                record("old", 1.0).as_bytes(),
            )
            .await
            .unwrap();
        for run in ["2020-01-01T00:00:00", "2021-01-01T00:00:00"] {
            store
                .write(&format!("ca/sf/normalized/{run}/{COMPLETE_MARKER}"), b"[]")
                .await
                .unwrap();
        }
        store
    }

    fn publisher(server: &MockServer) -> Publisher {
        let config = PublishConfig {
            server: server.uri(),
            ..PublishConfig::default()
        };
        Publisher::new(&config, "secret").unwrap()
    }

    #[test]
    fn import_record_from_normalized() {
        let value: Value = serde_json::from_str(&record("ca_sf:9", 37.5)).unwrap();
        let import = ImportRecord::from_normalized(value).unwrap();
        assert_eq!(import.source_uid, "ca_sf:9");
        assert_eq!(import.source_name, "ca_sf");
        assert_eq!(import.latitude, Some(37.5));

        let json = serde_json::to_value(&import).unwrap();
        assert_eq!(json["match"]["action"], "new");
        assert_eq!(json["import_json"]["id"], "ca_sf:9");
    }

    #[tokio::test]
    async fn collect_skips_invalid_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path()).await;

        let collected = collect_site_records(&store, &SiteId::new("ca", "sf"))
            .await
            .unwrap();
        assert_eq!(
            collected.run_dir.as_deref(),
            Some("ca/sf/normalized/2021-01-01T00:00:00")
        );
        assert_eq!(collected.records.len(), 3);
        assert_eq!(collected.skipped, 1);
    }

    #[tokio::test]
    async fn dry_run_batches_without_sending() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path()).await;

        let summary = publish_sites(
            &store,
            &[SiteId::new("ca", "sf"), SiteId::new("ca", "empty")],
            None,
            2,
        )
        .await
        .unwrap();

        assert!(summary.dry_run);
        assert_eq!(summary.sites[0].batches, 2);
        assert_eq!(summary.records(), 3);
        assert!(summary.sites[1].run_dir.is_none());
        assert_eq!(summary.failed_sites(), 0);
    }

    #[tokio::test]
    async fn publishes_in_batches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/verifyToken"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/startImportRun"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"import_run_id": 42})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/importSourceLocations"))
            .and(query_param("import_run_id", "42"))
            .and(header("content-type", NDJSON))
            .and(body_string_contains("source_uid"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path()).await;
        let publisher = publisher(&server);

        let summary = publish_sites(&store, &[SiteId::new("ca", "sf")], Some(&publisher), 2)
            .await
            .unwrap();

        assert_eq!(summary.import_run_id.as_deref(), Some("42"));
        assert_eq!(summary.sites[0].records, 3);
        assert_eq!(summary.sites[0].batches, 2);
        assert!(summary.sites[0].error.is_none());
    }

    #[tokio::test]
    async fn rejected_token_aborts_before_import() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/verifyToken"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path()).await;
        let err = publish_sites(&store, &[SiteId::new("ca", "sf")], Some(&publisher(&server)), 500)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Publish(_)));
    }

    #[tokio::test]
    async fn failed_import_is_recorded_per_site() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/verifyToken"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/startImportRun"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"import_run_id": "abc"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/importSourceLocations"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path()).await;
        let summary = publish_sites(&store, &[SiteId::new("ca", "sf")], Some(&publisher(&server)), 500)
            .await
            .unwrap();

        assert_eq!(summary.failed_sites(), 1);
        assert_eq!(summary.sites[0].records, 0);
    }
}
