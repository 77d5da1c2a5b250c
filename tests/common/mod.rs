//! In-memory stand-ins for the remote services.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use harmonic_trend::core::export::{ExportBackend, ExportRequest, JobHandle, RemoteStatus};
use harmonic_trend::io::drive::{FilePage, FileQuery, RemoteEntry, RemoteStorage};
use harmonic_trend::types::{BoundingBox, CloudProbabilityScene, SpectralScene, TrendResult};
use ndarray::Array2;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Export backend whose jobs end in a scripted terminal status, one per
/// submission, after reporting `Running` once
pub struct FakeEarthEngine {
    outcomes: RefCell<Vec<RemoteStatus>>,
    pub submissions: RefCell<Vec<ExportRequest>>,
    polls: RefCell<HashMap<String, usize>>,
    /// Invoked with the request when a job succeeds, e.g. to publish a file
    on_success: Box<dyn Fn(&ExportRequest)>,
}

impl FakeEarthEngine {
    pub fn new(outcomes: Vec<RemoteStatus>) -> Self {
        Self::with_hook(outcomes, |_| {})
    }

    pub fn with_hook(outcomes: Vec<RemoteStatus>, hook: impl Fn(&ExportRequest) + 'static) -> Self {
        Self {
            outcomes: RefCell::new(outcomes),
            submissions: RefCell::new(Vec::new()),
            polls: RefCell::new(HashMap::new()),
            on_success: Box::new(hook),
        }
    }

    pub fn ceilings(&self) -> Vec<u64> {
        self.submissions.borrow().iter().map(|r| r.max_pixels).collect()
    }
}

impl ExportBackend for FakeEarthEngine {
    fn start_export(&self, request: &ExportRequest) -> TrendResult<JobHandle> {
        let mut submissions = self.submissions.borrow_mut();
        submissions.push(request.clone());
        Ok(JobHandle {
            id: format!("projects/test/operations/{}", submissions.len() - 1),
        })
    }

    fn job_status(&self, handle: &JobHandle) -> TrendResult<RemoteStatus> {
        let index: usize = handle
            .id
            .rsplit('/')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        let mut polls = self.polls.borrow_mut();
        let count = polls.entry(handle.id.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            return Ok(RemoteStatus::Running);
        }
        let status = self
            .outcomes
            .borrow()
            .get(index)
            .cloned()
            .unwrap_or(RemoteStatus::Failed(Some("no scripted outcome".to_string())));
        if status == RemoteStatus::Succeeded && *count == 2 {
            let submissions = self.submissions.borrow();
            (self.on_success)(&submissions[index]);
        }
        Ok(status)
    }
}

/// Drive stand-in holding folders, files and their bytes
#[derive(Default)]
pub struct MemoryDrive {
    pub folders: RefCell<Vec<RemoteEntry>>,
    pub files: RefCell<HashMap<String, Vec<RemoteEntry>>>,
    pub content: RefCell<HashMap<String, Vec<u8>>>,
    pub page_size: usize,
}

impl MemoryDrive {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            ..Default::default()
        }
    }

    pub fn add_folder(&self, id: &str, name: &str) {
        self.folders.borrow_mut().push(RemoteEntry::new(id, name));
    }

    pub fn add_file(&self, folder_id: &str, id: &str, name: &str, bytes: &[u8]) {
        self.files
            .borrow_mut()
            .entry(folder_id.to_string())
            .or_default()
            .push(RemoteEntry::new(id, name));
        self.content.borrow_mut().insert(id.to_string(), bytes.to_vec());
    }

    /// Drop an exported file into every folder with the request's folder name
    pub fn publish(&self, folder: &str, filename: &str, bytes: &[u8]) {
        let targets: Vec<String> = self
            .folders
            .borrow()
            .iter()
            .filter(|f| f.name == folder)
            .map(|f| f.id.clone())
            .collect();
        for (n, folder_id) in targets.iter().enumerate() {
            self.add_file(folder_id, &format!("{}-file-{}", folder_id, n), filename, bytes);
        }
    }
}

impl RemoteStorage for MemoryDrive {
    fn list_page(&self, query: &FileQuery, page_token: Option<&str>) -> TrendResult<FilePage> {
        let all: Vec<RemoteEntry> = match query {
            FileQuery::FoldersNamed(name) => self
                .folders
                .borrow()
                .iter()
                .filter(|f| f.name.eq_ignore_ascii_case(name))
                .cloned()
                .collect(),
            FileQuery::FilesInFolder { parent, .. } => {
                self.files.borrow().get(parent).cloned().unwrap_or_default()
            }
        };
        let start: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let end = (start + self.page_size).min(all.len());
        Ok(FilePage {
            files: all.get(start..end).map(|s| s.to_vec()).unwrap_or_default(),
            next_page_token: (end < all.len()).then(|| end.to_string()),
        })
    }

    fn download(&self, file_id: &str, sink: &mut dyn Write) -> TrendResult<u64> {
        let content = self.content.borrow();
        let bytes = content.get(file_id).cloned().unwrap_or_default();
        sink.write_all(&bytes)?;
        Ok(bytes.len() as u64)
    }
}

pub fn date(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
}

pub fn footprint() -> BoundingBox {
    BoundingBox {
        min_lon: 26.5,
        max_lon: 27.0,
        min_lat: 54.7,
        max_lat: 55.0,
    }
}

/// Reflectance bands whose NDVI (with offset 1000) equals `ndvi` everywhere
pub fn scene_with_ndvi(
    index: &str,
    acquired: DateTime<Utc>,
    ndvi: f64,
    shape: (usize, usize),
) -> SpectralScene {
    let red = 1000.0;
    let nir = (red + 1000.0) * (1.0 + ndvi) / (1.0 - ndvi) - 1000.0;
    SpectralScene {
        system_index: index.to_string(),
        acquired,
        footprint: footprint(),
        cloud_coverage: 10.0,
        nir: Array2::from_elem(shape, nir as f32),
        red: Array2::from_elem(shape, red as f32),
    }
}

pub fn clear_sky(index: &str, acquired: DateTime<Utc>, shape: (usize, usize)) -> CloudProbabilityScene {
    CloudProbabilityScene {
        system_index: index.to_string(),
        acquired,
        footprint: footprint(),
        probability: Array2::zeros(shape),
    }
}
