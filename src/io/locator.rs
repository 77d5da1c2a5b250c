//! Resolve an exported artifact by folder and file name and fetch it.

use crate::io::drive::{FileQuery, RemoteEntry, RemoteStorage};
use crate::types::{TrendError, TrendResult};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Finds an exported file in remote storage and downloads it
pub struct ArtifactLocator<S: RemoteStorage> {
    storage: S,
    mime_type: String,
}

impl<S: RemoteStorage> ArtifactLocator<S> {
    pub fn new(storage: S, mime_type: &str) -> Self {
        Self {
            storage,
            mime_type: mime_type.to_string(),
        }
    }

    /// Run a query to exhaustion, following page tokens
    fn list_all(&self, query: &FileQuery) -> TrendResult<Vec<RemoteEntry>> {
        let mut entries = Vec::new();
        let mut page_token: Option<String> = None;
        let mut seen = HashSet::new();
        loop {
            let page = self.storage.list_page(query, page_token.as_deref())?;
            entries.extend(page.files);
            match page.next_page_token {
                Some(token) if !token.is_empty() => {
                    if !seen.insert(token.clone()) {
                        log::error!("Listing returned page token {} twice", token);
                        return Err(TrendError::Remote {
                            status: 200,
                            message: format!("listing repeated page token {}", token),
                        });
                    }
                    page_token = Some(token);
                }
                _ => break,
            }
        }
        Ok(entries)
    }

    /// Folders whose name equals `name` exactly
    pub fn find_folders(&self, name: &str) -> TrendResult<Vec<RemoteEntry>> {
        let folders: Vec<RemoteEntry> = self
            .list_all(&FileQuery::FoldersNamed(name.to_string()))?
            .into_iter()
            .filter(|entry| entry.name == name)
            .collect();
        log::debug!("{} folder(s) named '{}'", folders.len(), name);
        Ok(folders)
    }

    /// First file in `folder_id` named exactly `filename`
    pub fn find_file(&self, folder_id: &str, filename: &str) -> TrendResult<Option<RemoteEntry>> {
        let query = FileQuery::FilesInFolder {
            parent: folder_id.to_string(),
            mime_type: self.mime_type.clone(),
        };
        let mut matches = self
            .list_all(&query)?
            .into_iter()
            .filter(|entry| entry.name == filename);

        let first = matches.next();
        let duplicates = matches.count();
        if duplicates > 0 {
            log::warn!(
                "{} more file(s) named '{}' in folder {}; using the first",
                duplicates,
                filename,
                folder_id
            );
        }
        Ok(first)
    }

    /// Search every folder named `folder` for `filename`
    pub fn locate(&self, filename: &str, folder: &str) -> TrendResult<Option<RemoteEntry>> {
        let folders = self.find_folders(folder)?;
        if folders.is_empty() {
            log::warn!("No folder named '{}' found", folder);
            return Ok(None);
        }
        for candidate in &folders {
            if let Some(file) = self.find_file(&candidate.id, filename)? {
                log::info!("Found '{}' in folder {} as {}", filename, candidate.id, file.id);
                return Ok(Some(file));
            }
        }
        log::warn!("'{}' not found in any folder named '{}'", filename, folder);
        Ok(None)
    }

    /// Download `file` to `destination`, replacing any existing file.
    ///
    /// Content is staged in a temporary file next to the destination, so a
    /// failed transfer leaves nothing behind.
    pub fn download_to(&self, file: &RemoteEntry, destination: &Path) -> TrendResult<u64> {
        let parent = match destination.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)?;

        let mut staged = NamedTempFile::new_in(&parent)?;
        let bytes = self.storage.download(&file.id, staged.as_file_mut())?;
        staged.persist(destination).map_err(|e| TrendError::Io(e.error))?;

        log::info!("Downloaded {} bytes to {}", bytes, destination.display());
        Ok(bytes)
    }

    /// Locate and download; a missing artifact is an error here
    pub fn retrieve(&self, filename: &str, folder: &str, destination: &Path) -> TrendResult<PathBuf> {
        let file = self
            .locate(filename, folder)?
            .ok_or_else(|| TrendError::ArtifactNotFound {
                folder: folder.to_string(),
                filename: filename.to_string(),
            })?;
        self.download_to(&file, destination)?;
        Ok(destination.to_path_buf())
    }
}
