//! Drive v3 client: paged file listings and streamed media downloads.

use crate::config::Endpoints;
use crate::io::auth::CredentialProvider;
use crate::types::{TrendError, TrendResult};
use serde::Deserialize;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

/// Mime type Drive uses for folders
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Download buffer size
const CHUNK_SIZE: usize = 1 << 20;

/// File or folder entry of a listing
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteEntry {
    pub id: String,
    pub name: String,
}

impl RemoteEntry {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
        }
    }
}

/// One page of a listing
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePage {
    #[serde(default)]
    pub files: Vec<RemoteEntry>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Listing queries the locator issues
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileQuery {
    FoldersNamed(String),
    FilesInFolder { parent: String, mime_type: String },
}

impl FileQuery {
    /// Render as a Drive query string
    pub fn to_drive_query(&self) -> String {
        match self {
            FileQuery::FoldersNamed(name) => format!(
                "name = '{}' and mimeType = '{}'",
                escape_query_literal(name),
                FOLDER_MIME_TYPE
            ),
            FileQuery::FilesInFolder { parent, mime_type } => format!(
                "mimeType = '{}' and '{}' in parents",
                escape_query_literal(mime_type),
                escape_query_literal(parent)
            ),
        }
    }
}

/// Escape `\` and `'` inside a quoted query literal
pub fn escape_query_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Remote storage backend
pub trait RemoteStorage {
    fn list_page(&self, query: &FileQuery, page_token: Option<&str>) -> TrendResult<FilePage>;

    /// Stream the file content into `sink`, returning the byte count
    fn download(&self, file_id: &str, sink: &mut dyn Write) -> TrendResult<u64>;
}

impl<S: RemoteStorage + ?Sized> RemoteStorage for &S {
    fn list_page(&self, query: &FileQuery, page_token: Option<&str>) -> TrendResult<FilePage> {
        (**self).list_page(query, page_token)
    }

    fn download(&self, file_id: &str, sink: &mut dyn Write) -> TrendResult<u64> {
        (**self).download(file_id, sink)
    }
}

/// Blocking Drive client
pub struct DriveClient {
    client: reqwest::blocking::Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl DriveClient {
    pub fn new(endpoints: &Endpoints, credentials: Arc<dyn CredentialProvider>) -> TrendResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(endpoints.request_timeout_secs))
            .user_agent(concat!("harmonic-trend/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: endpoints.drive.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn get(&self, url: &str, query: &[(&str, &str)]) -> TrendResult<reqwest::blocking::Response> {
        let token = self.credentials.access_token()?;
        let response = self
            .client
            .get(url)
            .query(query)
            .bearer_auth(token)
            .send()
            .map_err(|e| {
                log::error!("Drive request failed: {}", e);
                TrendError::Http(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            log::error!("Drive returned {}: {}", status, message);
            return Err(TrendError::Remote {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

impl RemoteStorage for DriveClient {
    fn list_page(&self, query: &FileQuery, page_token: Option<&str>) -> TrendResult<FilePage> {
        let q = query.to_drive_query();
        let url = format!("{}/files", self.base_url);
        let mut params = vec![
            ("q", q.as_str()),
            ("spaces", "drive"),
            ("fields", "nextPageToken, files(id, name)"),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }
        log::debug!("Listing Drive files: {}", q);
        Ok(self.get(&url, &params)?.json()?)
    }

    fn download(&self, file_id: &str, sink: &mut dyn Write) -> TrendResult<u64> {
        let url = format!("{}/files/{}", self.base_url, file_id);
        let mut response = self.get(&url, &[("alt", "media")])?;
        let total = response.content_length();

        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut written = 0u64;
        loop {
            let read = response.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            sink.write_all(&buffer[..read])?;
            written += read as u64;
            match total {
                Some(total) if total > 0 => {
                    log::debug!("Downloaded {}/{} bytes ({:.0}%)", written, total, 100.0 * written as f64 / total as f64)
                }
                _ => log::debug!("Downloaded {} bytes", written),
            }
        }
        sink.flush()?;

        if let Some(total) = total {
            if written != total {
                return Err(TrendError::Remote {
                    status: 200,
                    message: format!("download truncated: {} of {} bytes", written, total),
                });
            }
        }
        Ok(written)
    }
}
