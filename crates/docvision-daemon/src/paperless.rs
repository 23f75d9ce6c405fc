//! Paperless-ngx archive client.
//!
//! Archived documents are patched in place through the REST API. New scans
//! are not in the archive yet, so their metadata goes into a JSON sidecar
//! (`<checksum>.json`) that the archive's consume hook picks up.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use tracing::{debug, info, instrument, warn};

use docvision_core::{
    ArchiveClient, ArchiveConfig, ArchiveDocument, Error, JobError, JobId, MetadataRecord,
    MetadataTarget, Result, TagConfig,
};

/// Page size for list endpoints.
const PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
struct Page<T> {
    results: Vec<T>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct NamedObject {
    id: i64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct DocumentDto {
    id: i64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    tags: Vec<i64>,
    #[serde(default)]
    original_file_name: Option<String>,
}

/// An archived document and its tag names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedDocument {
    pub id: i64,
    pub tags: BTreeSet<String>,
}

/// Sidecar written for a new scan.
#[derive(Debug, Serialize, Deserialize)]
pub struct ScanSidecar {
    pub checksum: String,
    pub original_filename: Option<String>,
    pub metadata: MetadataRecord,
    pub generated_at: chrono::DateTime<chrono::Utc>,
}

/// Which name-keyed collection to look up.
#[derive(Debug, Clone, Copy)]
enum Collection {
    Tags,
    Correspondents,
    DocumentTypes,
}

impl Collection {
    fn path(self) -> &'static str {
        match self {
            Collection::Tags => "tags",
            Collection::Correspondents => "correspondents",
            Collection::DocumentTypes => "document_types",
        }
    }
}

pub struct PaperlessArchive {
    api_url: String,
    token: Option<String>,
    client: Client,
    tags: TagConfig,
    sidecar_dir: Option<PathBuf>,
}

impl PaperlessArchive {
    pub fn new(config: &ArchiveConfig, tags: TagConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let base = config.url.trim_end_matches('/');
        let api_url = if base.ends_with("/api") {
            base.to_string()
        } else {
            format!("{base}/api")
        };
        Ok(Self {
            api_url,
            token: config.token.clone(),
            client,
            tags,
            sidecar_dir: config.sidecar_dir.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.api_url, path.trim_start_matches('/'));
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.header("Authorization", format!("Token {token}")),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, what: &str) -> Result<Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| Error::Request(format!("{what}: {e}")))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(what.to_string()));
        }
        Err(Error::Request(format!("{what}: archive returned {status}: {body}")))
    }

    async fn get_json<T: DeserializeOwned>(&self, builder: RequestBuilder, what: &str) -> Result<T> {
        self.send(builder, what)
            .await?
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("{what}: {e}")))
    }

    /// All pages of a list endpoint.
    async fn list_all<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut page = 1usize;
        loop {
            let builder = self
                .request(Method::GET, path)
                .query(query)
                .query(&[("page", page.to_string()), ("page_size", PAGE_SIZE.to_string())]);
            let batch: Page<T> = self.get_json(builder, path).await?;
            let done = batch.next.is_none() || batch.results.is_empty();
            items.extend(batch.results);
            if done {
                return Ok(items);
            }
            page += 1;
        }
    }

    async fn tag_names(&self) -> Result<HashMap<i64, String>> {
        let tags: Vec<NamedObject> = self.list_all("tags/", &[]).await?;
        Ok(tags.into_iter().map(|t| (t.id, t.name)).collect())
    }

    async fn find_by_name(&self, collection: Collection, name: &str) -> Result<Option<i64>> {
        let path = format!("{}/", collection.path());
        let builder = self
            .request(Method::GET, &path)
            .query(&[("name__iexact", name)]);
        let page: Page<NamedObject> = self.get_json(builder, &path).await?;
        Ok(page
            .results
            .into_iter()
            .find(|o| o.name.eq_ignore_ascii_case(name))
            .map(|o| o.id))
    }

    async fn find_or_create(&self, collection: Collection, name: &str) -> Result<i64> {
        if let Some(id) = self.find_by_name(collection, name).await? {
            return Ok(id);
        }
        let path = format!("{}/", collection.path());
        let created: NamedObject = self
            .get_json(
                self.request(Method::POST, &path).json(&json!({ "name": name })),
                &path,
            )
            .await?;
        info!(collection = collection.path(), name, id = created.id, "Created archive object");
        Ok(created.id)
    }

    async fn document(&self, id: i64) -> Result<DocumentDto> {
        let path = format!("documents/{id}/");
        self.get_json(self.request(Method::GET, &path), &path).await
    }

    async fn patch_document(&self, id: i64, body: &JsonValue) -> Result<()> {
        let path = format!("documents/{id}/");
        self.send(self.request(Method::PATCH, &path).json(body), &path)
            .await?;
        Ok(())
    }

    /// Swap the reprocess tag for `replacement` so the tag poller lets the
    /// document go.
    async fn replace_reprocess_tag(&self, id: i64, replacement: &str) -> Result<()> {
        let current = self.document(id).await?;
        let reprocess = self.find_by_name(Collection::Tags, &self.tags.reprocess).await?;
        let replacement = self.find_or_create(Collection::Tags, replacement).await?;
        let mut tags: BTreeSet<i64> = current
            .tags
            .into_iter()
            .filter(|t| Some(*t) != reprocess)
            .collect();
        tags.insert(replacement);
        self.patch_document(id, &json!({ "tags": tags })).await
    }

    async fn add_note(&self, id: i64, note: &str) -> Result<()> {
        let path = format!("documents/{id}/notes/");
        self.send(
            self.request(Method::POST, &path).json(&json!({ "note": note })),
            &path,
        )
        .await?;
        Ok(())
    }

    /// Documents currently carrying `tag`. Empty when the tag does not exist.
    #[instrument(skip(self), fields(subsystem = "archive", component = "paperless", op = "documents_tagged"))]
    pub async fn documents_tagged(&self, tag: &str) -> Result<Vec<TaggedDocument>> {
        let Some(tag_id) = self.find_by_name(Collection::Tags, tag).await? else {
            debug!(tag, "Tag not defined in archive");
            return Ok(Vec::new());
        };
        let docs: Vec<DocumentDto> = self
            .list_all("documents/", &[("tags__id__all", tag_id.to_string())])
            .await?;
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        let names = self.tag_names().await?;
        Ok(docs
            .into_iter()
            .map(|d| TaggedDocument {
                id: d.id,
                tags: d.tags.iter().filter_map(|t| names.get(t).cloned()).collect(),
            })
            .collect())
    }

    async fn write_sidecar(
        &self,
        checksum: &str,
        original_filename: Option<&str>,
        record: &MetadataRecord,
    ) -> Result<()> {
        let Some(dir) = &self.sidecar_dir else {
            debug!(checksum, "No sidecar directory configured, metadata kept in job record");
            return Ok(());
        };
        tokio::fs::create_dir_all(dir).await?;
        let sidecar = ScanSidecar {
            checksum: checksum.to_string(),
            original_filename: original_filename.map(str::to_string),
            metadata: record.clone(),
            generated_at: chrono::Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&sidecar)?;
        // Write then rename so the consume hook never sees a partial file.
        let tmp = dir.join(format!(".{checksum}.json.tmp"));
        let path = dir.join(format!("{checksum}.json"));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        info!(path = %path.display(), "Wrote scan sidecar");
        Ok(())
    }

    async fn update_document(&self, id: i64, record: &MetadataRecord) -> Result<()> {
        let current = self.document(id).await?;
        let reprocess = self.find_by_name(Collection::Tags, &self.tags.reprocess).await?;
        let failed = self.find_by_name(Collection::Tags, &self.tags.failed).await?;
        let duplicate = self.find_by_name(Collection::Tags, &self.tags.duplicate).await?;
        let done = self.find_or_create(Collection::Tags, &self.tags.done).await?;

        let stale = [reprocess, failed, duplicate];
        let mut tags: BTreeSet<i64> = current
            .tags
            .into_iter()
            .filter(|t| !stale.contains(&Some(*t)))
            .collect();
        for name in record.tags.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
            tags.insert(self.find_or_create(Collection::Tags, name).await?);
        }
        tags.insert(done);

        let mut body = Map::new();
        body.insert("tags".into(), json!(tags));
        if let Some(title) = record.title.as_deref().filter(|t| !t.trim().is_empty()) {
            body.insert("title".into(), json!(title));
        }
        if let Some(date) = record.document_date {
            body.insert("created".into(), json!(date.format("%Y-%m-%d").to_string()));
        }
        if let Some(content) = record.content.as_deref().filter(|c| !c.trim().is_empty()) {
            body.insert("content".into(), json!(content));
        }
        if let Some(name) = record.correspondent.as_deref().filter(|n| !n.trim().is_empty()) {
            let id = self.find_or_create(Collection::Correspondents, name.trim()).await?;
            body.insert("correspondent".into(), json!(id));
        }
        if let Some(name) = record.document_type.as_deref().filter(|n| !n.trim().is_empty()) {
            let id = self.find_or_create(Collection::DocumentTypes, name.trim()).await?;
            body.insert("document_type".into(), json!(id));
        }

        self.patch_document(id, &JsonValue::Object(body)).await?;
        info!(document_id = id, "Archive document updated");
        Ok(())
    }
}

#[async_trait]
impl ArchiveClient for PaperlessArchive {
    #[instrument(skip(self), fields(subsystem = "archive", component = "paperless", op = "fetch_document"))]
    async fn fetch_document(&self, document_id: i64) -> Result<ArchiveDocument> {
        let doc = self.document(document_id).await?;
        let names = self.tag_names().await?;
        let path = format!("documents/{document_id}/download/");
        let bytes = self
            .send(
                self.request(Method::GET, &path).query(&[("original", "true")]),
                &path,
            )
            .await?
            .bytes()
            .await
            .map_err(|e| Error::Request(format!("{path}: {e}")))?;
        debug!(document_id, bytes = bytes.len(), "Downloaded original");
        Ok(ArchiveDocument {
            id: doc.id,
            title: doc.title,
            tags: doc.tags.iter().filter_map(|t| names.get(t).cloned()).collect(),
            filename: doc.original_file_name,
            bytes: bytes.to_vec(),
        })
    }

    async fn submit_metadata(&self, target: &MetadataTarget, record: &MetadataRecord) -> Result<()> {
        match target {
            MetadataTarget::Document { id } => self.update_document(*id, record).await,
            MetadataTarget::Scan {
                checksum,
                original_filename,
            } => {
                self.write_sidecar(checksum, original_filename.as_deref(), record)
                    .await
            }
        }
    }

    async fn report_failure(&self, target: &MetadataTarget, error: &JobError) -> Result<()> {
        let MetadataTarget::Document { id } = target else {
            // The scan is still consumed; without a sidecar it gets no AI metadata.
            debug!(error_kind = %error.kind, "Scan failure not reported to archive");
            return Ok(());
        };
        self.replace_reprocess_tag(*id, &self.tags.failed).await?;
        warn!(
            document_id = id,
            error_kind = %error.kind,
            "Marked archive document as failed"
        );
        Ok(())
    }

    async fn report_duplicate(&self, target: &MetadataTarget, duplicate_of: &JobId) -> Result<()> {
        let MetadataTarget::Document { id } = target else {
            // The scan watcher files duplicate scans away itself.
            debug!(duplicate_of = %duplicate_of, "Scan duplicate not reported to archive");
            return Ok(());
        };
        self.replace_reprocess_tag(*id, &self.tags.duplicate).await?;
        self.add_note(
            *id,
            &format!("AI analysis skipped: near-duplicate of {duplicate_of}"),
        )
        .await?;
        info!(document_id = id, duplicate_of = %duplicate_of, "Marked archive document as duplicate");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive(url: &str) -> PaperlessArchive {
        let config = ArchiveConfig {
            url: url.to_string(),
            ..Default::default()
        };
        PaperlessArchive::new(&config, TagConfig::default()).unwrap()
    }

    #[test]
    fn test_api_suffix_is_added_once() {
        assert_eq!(archive("http://paperless:8000").api_url, "http://paperless:8000/api");
        assert_eq!(archive("http://paperless:8000/api/").api_url, "http://paperless:8000/api");
    }

    #[tokio::test]
    async fn test_scan_without_sidecar_dir_is_noop() {
        let a = archive("http://localhost:1");
        let target = MetadataTarget::Scan {
            checksum: "abc".into(),
            original_filename: None,
        };
        a.submit_metadata(&target, &MetadataRecord::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sidecar_is_written_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let config = ArchiveConfig {
            sidecar_dir: Some(dir.path().join("buffer")),
            ..Default::default()
        };
        let a = PaperlessArchive::new(&config, TagConfig::default()).unwrap();
        let record = MetadataRecord {
            title: Some("Invoice".into()),
            ..Default::default()
        };
        let target = MetadataTarget::Scan {
            checksum: "d41d8c".into(),
            original_filename: Some("scan.pdf".into()),
        };
        a.submit_metadata(&target, &record).await.unwrap();

        let written = std::fs::read(dir.path().join("buffer").join("d41d8c.json")).unwrap();
        let sidecar: ScanSidecar = serde_json::from_slice(&written).unwrap();
        assert_eq!(sidecar.metadata.title.as_deref(), Some("Invoice"));
        assert_eq!(sidecar.original_filename.as_deref(), Some("scan.pdf"));
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("buffer"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
