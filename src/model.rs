//! Nearest-centroid classifier used as the default trainer and serving model.
//!
//! Images are reduced to a small RGB thumbnail; each class is the mean thumbnail of
//! its training images.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
};

use anyhow::Context;
use image::{DynamicImage, imageops::FilterType};
use serde::{Deserialize, Serialize};

use crate::{
    core::db::Label,
    error::{Error, Result},
    pipeline::{
        image_files,
        train::{Trainer, TrainingMetrics},
    },
    serving::Classifier,
};

pub const MODEL_FILE: &str = "model.json";
const DEFAULT_THUMBNAIL: u32 = 16;
/// Every fifth image (by name) is held out for validation.
const VALIDATION_STRIDE: usize = 5;

fn features(image: &DynamicImage, side: u32) -> Vec<f32> {
    image
        .resize_exact(side, side, FilterType::Triangle)
        .to_rgb8()
        .into_raw()
        .into_iter()
        .map(|v| v as f32 / 255.0)
        .collect()
}

fn distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentroidModel {
    pub thumbnail: u32,
    pub centroids: BTreeMap<Label, Vec<f32>>,
}

impl CentroidModel {
    pub fn load(model_dir: &Path) -> Result<Self> {
        let path = model_dir.join(MODEL_FILE);
        let bytes = fs::read(&path).map_err(|e| Error::io(&path, e))?;
        let model: CentroidModel = serde_json::from_slice(&bytes)?;
        if model.centroids.is_empty() {
            return Err(Error::Configuration(format!("model {:?} has no classes", path)));
        }
        Ok(model)
    }

    pub fn save(&self, model_dir: &Path) -> Result<()> {
        let path = model_dir.join(MODEL_FILE);
        fs::write(&path, serde_json::to_vec(self)?).map_err(|e| Error::io(&path, e))
    }

    fn nearest(&self, features: &[f32]) -> Option<Label> {
        self.centroids
            .iter()
            .map(|(label, c)| (*label, distance(c, features)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(label, _)| label)
    }

    fn accuracy(&self, samples: &[(Label, Vec<f32>)]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let correct = samples
            .iter()
            .filter(|(label, f)| self.nearest(f) == Some(*label))
            .count();
        correct as f64 / samples.len() as f64
    }
}

impl Classifier for CentroidModel {
    fn classify(&self, image: &DynamicImage) -> Result<Label> {
        self.nearest(&features(image, self.thumbnail))
            .ok_or_else(|| Error::Configuration("model has no classes".to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct CentroidTrainer {
    pub thumbnail: u32,
}

impl Default for CentroidTrainer {
    fn default() -> Self {
        Self {
            thumbnail: DEFAULT_THUMBNAIL,
        }
    }
}

impl Trainer for CentroidTrainer {
    fn name(&self) -> &str {
        "nearest-centroid"
    }

    fn params(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("thumbnail".to_string(), format!("{0}x{0}", self.thumbnail)),
            ("validation_stride".to_string(), VALIDATION_STRIDE.to_string()),
        ])
    }

    fn train(&self, data_dir: &Path, model_dir: &Path) -> anyhow::Result<TrainingMetrics> {
        let mut train = vec![];
        let mut val = vec![];
        for label in Label::ALL {
            let dir = data_dir.join(label.as_str());
            if !dir.is_dir() {
                continue;
            }
            for (i, path) in image_files(&dir)?.iter().enumerate() {
                let image = match image::open(path) {
                    Ok(image) => image,
                    Err(e) => {
                        log::warn!("skipping image due to error: {:?} -> {}", path, e);
                        continue;
                    }
                };
                let sample = (label, features(&image, self.thumbnail));
                if i % VALIDATION_STRIDE == VALIDATION_STRIDE - 1 {
                    val.push(sample);
                } else {
                    train.push(sample);
                }
            }
        }
        anyhow::ensure!(!train.is_empty(), "no readable training images in {:?}", data_dir);

        let mut sums: BTreeMap<Label, (Vec<f32>, usize)> = BTreeMap::new();
        for (label, f) in &train {
            let (sum, n) = sums
                .entry(*label)
                .or_insert_with(|| (vec![0.0; f.len()], 0));
            sum.iter_mut().zip(f).for_each(|(s, v)| *s += v);
            *n += 1;
        }
        let centroids = sums
            .into_iter()
            .map(|(label, (sum, n))| (label, sum.into_iter().map(|s| s / n as f32).collect()))
            .collect::<BTreeMap<_, Vec<f32>>>();
        let labels_seen: BTreeSet<Label> = centroids.keys().copied().collect();

        let model = CentroidModel {
            thumbnail: self.thumbnail,
            centroids,
        };
        model
            .save(model_dir)
            .with_context(|| format!("Failed to save model into {:?}", model_dir))?;

        Ok(TrainingMetrics {
            train_accuracy: model.accuracy(&train),
            val_accuracy: model.accuracy(&val),
            labels_seen,
        })
    }
}
