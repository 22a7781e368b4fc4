//! Decode check, optional blur rejection and resize of extracted images.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use image::{DynamicImage, GrayImage, ImageReader, imageops::FilterType};
use imageproc::filter::laplacian_filter;
use serde::{Deserialize, Serialize};

use crate::{
    core::db::Label,
    error::{Error, Result},
    pipeline::{extract::discard_partial, image_files},
};

/// Sharpness gate. Disabled unless configured otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlurFilter {
    pub enabled: bool,
    /// Images scoring strictly below this are rejected.
    pub threshold: f64,
}

impl Default for BlurFilter {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 50.0,
        }
    }
}

impl BlurFilter {
    pub fn with_threshold(threshold: f64) -> Self {
        Self {
            enabled: true,
            threshold,
        }
    }

    pub fn rejects(&self, image: &DynamicImage) -> bool {
        self.enabled && sharpness(&image.to_luma8()) < self.threshold
    }
}

/// Variance of the Laplacian of a grayscale image. Flat images score 0.
pub fn sharpness(gray: &GrayImage) -> f64 {
    let laplacian = laplacian_filter(gray);
    let n = laplacian.width() as usize * laplacian.height() as usize;
    if n == 0 {
        return 0.0;
    }
    let (sum, sum_sq) = laplacian.pixels().fold((0.0f64, 0.0f64), |(s, sq), p| {
        let v = p.0[0] as f64;
        (s + v, sq + v * v)
    });
    let mean = sum / n as f64;
    (sum_sq / n as f64 - mean * mean).max(0.0)
}

#[derive(Debug, Clone, Copy)]
pub struct QualityOptions {
    pub target_size: (u32, u32),
    pub blur: BlurFilter,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LabelQuality {
    pub saved: u64,
    /// Decoded fine but failed the blur gate.
    pub rejected: u64,
    pub unreadable: u64,
    /// Passed every check but the resized copy could not be written.
    pub unwritable: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QualityReport {
    pub per_label: BTreeMap<Label, LabelQuality>,
}

impl QualityReport {
    pub fn get(&self, label: Label) -> LabelQuality {
        self.per_label.get(&label).copied().unwrap_or_default()
    }

    pub fn total_saved(&self) -> u64 {
        self.per_label.values().map(|q| q.saved).sum()
    }
}

fn decode(path: &Path) -> Result<DynamicImage> {
    ImageReader::open(path)
        .map_err(|e| Error::io(path, e))?
        .with_guessed_format()
        .map_err(|e| Error::io(path, e))?
        .decode()
        .map_err(|e| Error::decode(format!("{:?}", path), e))
}

/// Filter and resize every image under `input_dir/<label>/` into `output_dir/<label>/`.
///
/// Output files keep their input names, so re-running over the same output replaces
/// earlier results.
pub fn process(
    input_dir: &Path,
    output_dir: &Path,
    options: &QualityOptions,
) -> Result<QualityReport> {
    if !input_dir.is_dir() {
        return Err(Error::Configuration(format!(
            "input directory not found: {:?}",
            input_dir
        )));
    }
    fs::create_dir_all(output_dir).map_err(|e| Error::io(output_dir, e))?;

    let (width, height) = options.target_size;
    let mut report = QualityReport::default();

    for label in Label::ALL {
        let input_path = input_dir.join(label.as_str());
        if !input_path.is_dir() {
            log::info!("skipping missing label folder: {}", label);
            continue;
        }
        let output_path: PathBuf = output_dir.join(label.as_str());
        fs::create_dir_all(&output_path).map_err(|e| Error::io(&output_path, e))?;

        let mut counts = LabelQuality::default();
        for img_path in image_files(&input_path)? {
            let image = match decode(&img_path) {
                Ok(image) => image,
                Err(e) => {
                    log::warn!("unreadable image skipped: {}", e);
                    counts.unreadable += 1;
                    continue;
                }
            };

            if options.blur.rejects(&image) {
                log::info!("blurry image rejected: {:?}", img_path);
                counts.rejected += 1;
                continue;
            }

            let resized = image.resize_exact(width, height, FilterType::Triangle);
            let resized = DynamicImage::ImageRgb8(resized.to_rgb8());
            // image_files only yields names, so file_name is always present
            let Some(name) = img_path.file_name() else {
                continue;
            };
            let out_path = output_path.join(name);
            if let Err(e) = resized.save(&out_path) {
                log::warn!("could not write {:?}, skipped: {}", out_path, e);
                if out_path.is_file() {
                    discard_partial(&out_path);
                }
                counts.unwritable += 1;
                continue;
            }
            counts.saved += 1;
        }

        log::info!(
            "[{}] saved: {}, blurry rejected: {}, unreadable: {}, unwritable: {}",
            label.as_str().to_uppercase(),
            counts.saved,
            counts.rejected,
            counts.unreadable,
            counts.unwritable
        );
        report.per_label.insert(label, counts);
    }

    log::info!("image preprocessing completed");
    Ok(report)
}
