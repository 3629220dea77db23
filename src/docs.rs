//! Google Docs document mutation: structure scanning, named ranges, list appends.
//!
//! The REST client is a thin wrapper; the interesting part is the pure scan
//! logic over the fetched document structure (placeholder spans for named
//! range creation, insertion points for list appends), which is what the
//! tests exercise.

use crate::error::{Error, Result};
use anyhow::Context as _;
use serde::Deserialize;
use std::path::Path;

/// Literal placeholder substrings in the report template, mapped to the named
/// range each one becomes at provisioning time.
pub const TEMPLATE_PLACEHOLDERS: &[(&str, &str)] = &[("title", "{title}"), ("priority", "{priority}")];

/// Name given to freshly copied report documents before the first title update.
const NEW_REPORT_NAME: &str = "Incident Report";

// --- Document structure (subset of the Docs API document resource) ---

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    #[serde(default)]
    pub document_id: String,
    #[serde(default)]
    pub body: Body,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Body {
    #[serde(default)]
    pub content: Vec<StructuralElement>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuralElement {
    #[serde(default)]
    pub start_index: i64,
    #[serde(default)]
    pub end_index: i64,
    pub paragraph: Option<Paragraph>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paragraph {
    #[serde(default)]
    pub elements: Vec<ParagraphElement>,
    pub bullet: Option<Bullet>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bullet {
    #[serde(default)]
    pub list_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParagraphElement {
    #[serde(default)]
    pub start_index: i64,
    pub text_run: Option<TextRun>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextRun {
    #[serde(default)]
    pub content: String,
}

// --- Pure structure scans ---

/// A placeholder occurrence to be turned into a named range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedRangeSpec {
    pub name: &'static str,
    pub start_index: i64,
    pub end_index: i64,
}

/// Scan all text runs for template placeholders. Each span covers exactly the
/// placeholder text, so later named-range replacement swaps just that region.
pub fn find_placeholder_ranges(document: &Document) -> Vec<NamedRangeSpec> {
    let mut ranges = Vec::new();

    for block in &document.body.content {
        let Some(paragraph) = &block.paragraph else {
            continue;
        };
        for element in &paragraph.elements {
            let Some(text_run) = &element.text_run else {
                continue;
            };
            for (name, placeholder) in TEMPLATE_PLACEHOLDERS {
                if let Some(offset) = text_run.content.find(placeholder) {
                    let start_index = element.start_index + offset as i64;
                    ranges.push(NamedRangeSpec {
                        name,
                        start_index,
                        end_index: start_index + placeholder.len() as i64,
                    });
                }
            }
        }
    }

    ranges
}

/// Find the character index at which a new line should be inserted to land at
/// the end of the bullet run following `header`.
///
/// Walks top-level blocks in order; after a text run exactly equal to
/// `header + "\n"` is seen, the first paragraph that is not a bullet item
/// marks the end of the list, and the insertion point is just before its
/// start. Returns `None` when no non-bullet paragraph follows the header —
/// templates must keep a trailing sentinel paragraph after every list.
pub fn find_list_insertion_index(document: &Document, header: &str) -> Option<i64> {
    let header_line = format!("{header}\n");
    let mut in_target_list = false;

    for block in &document.body.content {
        if let Some(paragraph) = &block.paragraph {
            if in_target_list && paragraph.bullet.is_none() {
                return Some(block.start_index - 1);
            }
            for element in &paragraph.elements {
                if let Some(text_run) = &element.text_run {
                    if text_run.content == header_line {
                        in_target_list = true;
                    }
                }
            }
        }
    }

    None
}

/// Timestamped bullet line for list appends: `HH:MM:SS UTC - <text>\n`.
pub fn stamped_line(text: &str) -> String {
    stamped_line_at(chrono::Utc::now(), text)
}

fn stamped_line_at(now: chrono::DateTime<chrono::Utc>, text: &str) -> String {
    format!("{} - {}\n", now.format("%H:%M:%S UTC"), text)
}

// --- Backend seam ---

/// Thin Docs/Drive API surface, split out so the mutator's scan-and-edit
/// logic can run against a recording fake in tests.
pub trait DocsApi: Send + Sync {
    /// Copy a Drive file into a folder. Returns the new file id.
    fn copy_file(
        &self,
        template_id: &str,
        folder_id: &str,
        name: &str,
    ) -> impl std::future::Future<Output = Result<String>> + Send;

    /// Fetch a document's structure.
    fn get_document(
        &self,
        document_id: &str,
    ) -> impl std::future::Future<Output = Result<Document>> + Send;

    /// Apply a batch of structural update requests.
    fn batch_update(
        &self,
        document_id: &str,
        requests: Vec<serde_json::Value>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Rename a Drive file (metadata only).
    fn rename_file(
        &self,
        file_id: &str,
        name: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

// --- Google REST client ---

/// Docs/Drive REST client using a bearer access token.
pub struct GoogleDocsClient {
    http: reqwest::Client,
    access_token: String,
}

impl GoogleDocsClient {
    pub fn new(http: reqwest::Client, access_token: impl Into<String>) -> Self {
        Self {
            http,
            access_token: access_token.into(),
        }
    }

    async fn read_body(response: reqwest::Response) -> Result<(reqwest::StatusCode, serde_json::Value)> {
        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::BackendUnavailable(e.to_string()))?;
        Ok((status, body))
    }
}

fn api_error_message(body: &serde_json::Value) -> &str {
    body["error"]["message"].as_str().unwrap_or("unknown error")
}

impl DocsApi for GoogleDocsClient {
    async fn copy_file(&self, template_id: &str, folder_id: &str, name: &str) -> Result<String> {
        let response = self
            .http
            .post(format!(
                "https://www.googleapis.com/drive/v3/files/{template_id}/copy"
            ))
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({
                "name": name,
                "parents": [folder_id],
            }))
            .send()
            .await
            .map_err(|e| Error::BackendUnavailable(e.to_string()))?;

        let (status, body) = Self::read_body(response).await?;
        if !status.is_success() {
            return Err(Error::TemplateCopyFailed(format!(
                "({status}): {}",
                api_error_message(&body)
            )));
        }

        body["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::TemplateCopyFailed("copy response missing file id".into()))
    }

    async fn get_document(&self, document_id: &str) -> Result<Document> {
        let response = self
            .http
            .get(format!(
                "https://docs.googleapis.com/v1/documents/{document_id}"
            ))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| Error::BackendUnavailable(e.to_string()))?;

        let (status, body) = Self::read_body(response).await?;
        if !status.is_success() {
            return Err(Error::BackendUnavailable(format!(
                "failed to fetch document {document_id} ({status}): {}",
                api_error_message(&body)
            )));
        }

        serde_json::from_value(body).map_err(|e| {
            Error::BackendUnavailable(format!("malformed document structure: {e}"))
        })
    }

    async fn batch_update(
        &self,
        document_id: &str,
        requests: Vec<serde_json::Value>,
    ) -> Result<()> {
        let response = self
            .http
            .post(format!(
                "https://docs.googleapis.com/v1/documents/{document_id}:batchUpdate"
            ))
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({ "requests": requests }))
            .send()
            .await
            .map_err(|e| Error::BackendUnavailable(e.to_string()))?;

        let (status, body) = Self::read_body(response).await?;
        if !status.is_success() {
            return Err(Error::StructuralUpdateFailed(format!(
                "({status}): {}",
                api_error_message(&body)
            )));
        }
        Ok(())
    }

    async fn rename_file(&self, file_id: &str, name: &str) -> Result<()> {
        let response = self
            .http
            .patch(format!(
                "https://www.googleapis.com/drive/v3/files/{file_id}"
            ))
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await
            .map_err(|e| Error::BackendUnavailable(e.to_string()))?;

        let (status, body) = Self::read_body(response).await?;
        if !status.is_success() {
            return Err(Error::BackendUnavailable(format!(
                "failed to rename file {file_id} ({status}): {}",
                api_error_message(&body)
            )));
        }
        Ok(())
    }
}

// --- OAuth credential ---

/// Cached authorized-user credential, as written by the interactive consent
/// flow (client id/secret plus refresh token).
#[derive(Debug, Deserialize)]
struct AuthorizedUser {
    client_id: String,
    client_secret: String,
    refresh_token: String,
}

/// Exchange the cached refresh token for a bearer access token.
///
/// The interactive first-run authorization flow is out of scope; a missing or
/// invalid token file is a startup error.
pub async fn load_access_token(http: &reqwest::Client, token_path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(token_path).with_context(|| {
        format!(
            "failed to read Google credential from {}",
            token_path.display()
        )
    })?;
    let credential: AuthorizedUser = serde_json::from_str(&content)
        .with_context(|| format!("malformed Google credential in {}", token_path.display()))?;

    let response = http
        .post("https://oauth2.googleapis.com/token")
        .form(&[
            ("client_id", credential.client_id.as_str()),
            ("client_secret", credential.client_secret.as_str()),
            ("refresh_token", credential.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ])
        .send()
        .await
        .map_err(|e| Error::BackendUnavailable(e.to_string()))?;

    let status = response.status();
    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|e| Error::BackendUnavailable(e.to_string()))?;

    if !status.is_success() {
        return Err(Error::BackendUnavailable(format!(
            "Google token refresh failed ({status}): {}",
            body["error_description"].as_str().unwrap_or("unknown error")
        )));
    }

    body["access_token"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::BackendUnavailable("token response missing access_token".into()))
}

// --- Mutator ---

/// Structural document edits against the backend: provisioning, named-range
/// replacement, and end-of-list bullet appends.
pub struct DocMutator<A> {
    api: A,
    template_file_id: String,
    incident_folder_id: String,
}

impl<A: DocsApi> DocMutator<A> {
    pub fn new(
        api: A,
        template_file_id: impl Into<String>,
        incident_folder_id: impl Into<String>,
    ) -> Self {
        Self {
            api,
            template_file_id: template_file_id.into(),
            incident_folder_id: incident_folder_id.into(),
        }
    }

    /// Copy the report template and turn its placeholders into named ranges.
    /// Returns the new document id.
    pub async fn provision_document(&self) -> Result<String> {
        let document_id = self
            .api
            .copy_file(
                &self.template_file_id,
                &self.incident_folder_id,
                NEW_REPORT_NAME,
            )
            .await?;

        let document = self.api.get_document(&document_id).await?;
        let ranges = find_placeholder_ranges(&document);

        if !ranges.is_empty() {
            let requests: Vec<serde_json::Value> = ranges
                .iter()
                .map(|range| {
                    serde_json::json!({
                        "createNamedRange": {
                            "name": range.name,
                            "range": {
                                "startIndex": range.start_index,
                                "endIndex": range.end_index,
                            }
                        }
                    })
                })
                .collect();
            self.api.batch_update(&document_id, requests).await?;
        }

        tracing::info!(
            document_id = %document_id,
            ranges = ranges.len(),
            "provisioned incident report"
        );

        Ok(document_id)
    }

    /// Replace the content of a named range. The range follows its own
    /// content across edits, so this stays valid after prior replacements.
    pub async fn replace_named_range(
        &self,
        document_id: &str,
        range_name: &str,
        text: &str,
    ) -> Result<()> {
        let request = serde_json::json!({
            "replaceNamedRangeContent": {
                "namedRangeName": range_name,
                "text": text,
            }
        });

        match self.api.batch_update(document_id, vec![request]).await {
            // The backend reports a missing named range as a failed batch
            // update with free-text wording, so match case-insensitively.
            Err(Error::StructuralUpdateFailed(message))
                if message.to_ascii_lowercase().contains("named range") =>
            {
                Err(Error::RangeNotFound(range_name.to_string()))
            }
            other => other,
        }
    }

    /// Append a timestamped bullet line at the end of the bullet run under
    /// `header`. Silently does nothing when the header has no trailing
    /// sentinel paragraph.
    pub async fn append_to_list(&self, document_id: &str, header: &str, text: &str) -> Result<()> {
        let document = self.api.get_document(document_id).await?;

        let Some(index) = find_list_insertion_index(&document, header) else {
            tracing::warn!(
                document_id = %document_id,
                header = %header,
                "no insertion point after list header"
            );
            return Ok(());
        };

        let request = serde_json::json!({
            "insertText": {
                "text": stamped_line(text),
                "location": { "index": index },
            }
        });

        self.api.batch_update(document_id, vec![request]).await
    }

    /// Rename the backing Drive file.
    pub async fn rename_document(&self, document_id: &str, name: &str) -> Result<()> {
        self.api.rename_file(document_id, name).await
    }

    #[cfg(test)]
    pub(crate) fn api(&self) -> &A {
        &self.api
    }
}

// --- Test support ---
