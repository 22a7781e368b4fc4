//! Materialize pending records as labeled image files.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use image::{DynamicImage, ImageFormat};

use crate::{
    core::db::{ImageRecord, ImageRepository, Label, Table},
    error::{Error, Result},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionReport {
    pub counts: BTreeMap<Label, u64>,
    /// Records whose bytes did not decode.
    pub undecodable: u64,
    /// Records whose label is not one of the known classes.
    pub unknown_label: u64,
    /// Records that decoded but could not be written back as JPEG.
    pub unwritable: u64,
    /// Rows removed from the pending table.
    pub cleared: u64,
}

impl Default for ExtractionReport {
    fn default() -> Self {
        Self {
            counts: Label::ALL.iter().map(|l| (*l, 0)).collect(),
            undecodable: 0,
            unknown_label: 0,
            unwritable: 0,
            cleared: 0,
        }
    }
}

impl ExtractionReport {
    pub fn count(&self, label: Label) -> u64 {
        self.counts.get(&label).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }
}

/// `<root>/<label>/<label>_<id>.jpg`
pub fn record_path(label_root: &Path, label: Label, id: i64) -> PathBuf {
    label_root
        .join(label.as_str())
        .join(format!("{}_{}.jpg", label, id))
}

/// Remove whatever a failed encode left behind.
pub(crate) fn discard_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("could not remove partial file {:?}: {}", path, e);
        }
    }
}

fn write_records(records: &[ImageRecord], label_root: &Path) -> Result<ExtractionReport> {
    let mut report = ExtractionReport::default();
    for record in records {
        let Some(label) = record.known_label() else {
            log::warn!(
                "record {} has unknown label '{}', skipped",
                record.id,
                record.label
            );
            report.unknown_label += 1;
            continue;
        };

        let image = match image::load_from_memory(&record.image) {
            Ok(image) => image,
            Err(e) => {
                log::warn!("record {} could not be decoded, skipped: {}", record.id, e);
                report.undecodable += 1;
                continue;
            }
        };

        let path = record_path(label_root, label, record.id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        }
        if let Err(e) =
            DynamicImage::ImageRgb8(image.to_rgb8()).save_with_format(&path, ImageFormat::Jpeg)
        {
            log::warn!("record {} could not be written, skipped: {}", record.id, e);
            discard_partial(&path);
            report.unwritable += 1;
            continue;
        }
        *report.counts.entry(label).or_insert(0) += 1;
    }
    Ok(report)
}

/// Write every pending record under `label_root`, then delete exactly the records
/// that were read.
///
/// Records inserted while the files are being written have ids above the snapshot
/// fence and stay pending. Records that cannot be decoded or re-encoded are counted
/// and cleared with the rest; only a failure to create the label directories leaves
/// the batch pending for the next run.
pub async fn extract<S: ImageRepository>(
    store: &S,
    table: Table,
    label_root: &Path,
) -> Result<ExtractionReport> {
    let snapshot = store.snapshot(table).await?;
    let Some(fence) = snapshot.fence else {
        log::info!("no pending records in '{}'", table);
        return Ok(ExtractionReport::default());
    };

    let records = snapshot.records;
    let root = label_root.to_path_buf();
    let mut report = tokio::task::spawn_blocking(move || write_records(&records, &root)).await??;

    report.cleared = store.clear_through(table, fence).await?;
    log::info!(
        "extracted rock: {}, paper: {}, scissors: {} (undecodable: {}, unwritable: {}, unknown label: {})",
        report.count(Label::Rock),
        report.count(Label::Paper),
        report.count(Label::Scissors),
        report.undecodable,
        report.unwritable,
        report.unknown_label
    );
    Ok(report)
}
