use std::{
    collections::BTreeSet,
    fs,
    io::Cursor,
    path::Path,
};

use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use rpsloop::{
    Config,
    core::{db::ImageStore, db::Label, tracking::Tracking},
    pipeline::train::{Trainer, TrainingMetrics},
};

pub const RED: [u8; 3] = [255, 0, 0];
pub const GREEN: [u8; 3] = [0, 255, 0];
pub const BLUE: [u8; 3] = [0, 0, 255];

/// Color used for each label in tests, far enough apart for a centroid model.
pub fn label_color(label: Label) -> [u8; 3] {
    match label {
        Label::Rock => RED,
        Label::Paper => GREEN,
        Label::Scissors => BLUE,
    }
}

fn encode(image: DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), format)
        .expect("Failed to encode test image");
    bytes
}

/// PNG bytes of a solid-colored image.
pub fn solid_png(rgb: [u8; 3], width: u32, height: u32) -> Vec<u8> {
    let img = ImageBuffer::from_fn(width, height, |_, _| Rgb(rgb));
    encode(DynamicImage::ImageRgb8(img), ImageFormat::Png)
}

/// PNG bytes of a one-pixel black/white checkerboard: as sharp as an image gets.
pub fn checkerboard_png(width: u32, height: u32) -> Vec<u8> {
    let img = ImageBuffer::from_fn(width, height, |x, y| {
        if (x + y) % 2 == 0 {
            Rgb([255u8, 255, 255])
        } else {
            Rgb([0u8, 0, 0])
        }
    });
    encode(DynamicImage::ImageRgb8(img), ImageFormat::Png)
}

pub fn write_file(path: &Path, bytes: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent directory");
    }
    fs::write(path, bytes).expect("Failed to write test file");
}

/// A configuration with every path inside `root`.
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.store.database = root.join("images.sqlite");
    config.counter.path = root.join("utils").join("prediction_counter.json");
    config.pipeline.raw_dir = root.join("raw_data");
    config.pipeline.preprocessed_dir = root.join("prep");
    config.tracking.database = root.join("tracking.sqlite");
    config.tracking.artifact_root = root.join("mlruns");
    config.tracking.registry_root = root.join("registry");
    config.setup.attempts = 1;
    config.setup.backoff_secs = 0;
    config
}

/// Creates an ImageStore with both tables in a temporary directory.
/// Returns both the store and the temp directory (which must be kept alive).
pub async fn create_test_store() -> (ImageStore, tempfile::TempDir) {
    let dir = tempfile::TempDir::new().expect("Failed to create temp directory");
    let store = ImageStore::open_and_create(dir.path().join("images.sqlite"))
        .await
        .expect("Failed to create test store");
    (store, dir)
}

pub async fn create_test_tracking(config: &Config) -> Tracking {
    Tracking::open(&config.tracking)
        .await
        .expect("Failed to open tracking store")
}

/// Trainer that writes a placeholder model, or fails when asked to.
#[derive(Debug, Clone, Default)]
pub struct StubTrainer {
    pub fail: bool,
}

impl Trainer for StubTrainer {
    fn name(&self) -> &str {
        "stub"
    }

    fn train(&self, data_dir: &Path, model_dir: &Path) -> anyhow::Result<TrainingMetrics> {
        anyhow::ensure!(!self.fail, "stub trainer asked to fail");
        let labels_seen: BTreeSet<Label> = Label::ALL
            .into_iter()
            .filter(|l| data_dir.join(l.as_str()).is_dir())
            .collect();
        fs::write(model_dir.join("weights.bin"), b"stub")?;
        Ok(TrainingMetrics {
            train_accuracy: 1.0,
            val_accuracy: 1.0,
            labels_seen,
        })
    }
}
