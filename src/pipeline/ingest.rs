use std::{collections::BTreeMap, fs, path::Path};

use crate::{
    core::db::Label,
    error::{Error, Result},
    pipeline::image_files,
};

/// Copy a labeled seed dataset (`src_dir/<label>/*`) into `dest_dir`.
///
/// Unlike extraction and preprocessing, every label folder must be present.
pub fn ingest_seed(src_dir: &Path, dest_dir: &Path) -> Result<BTreeMap<Label, usize>> {
    if !src_dir.is_dir() {
        return Err(Error::Configuration(format!(
            "source directory not found: {:?}",
            src_dir
        )));
    }
    fs::create_dir_all(dest_dir).map_err(|e| Error::io(dest_dir, e))?;

    let mut copied = BTreeMap::new();
    for label in Label::ALL {
        let src_label = src_dir.join(label.as_str());
        if !src_label.is_dir() {
            return Err(Error::Configuration(format!(
                "missing label folder: {}",
                label
            )));
        }
        let dest_label = dest_dir.join(label.as_str());
        fs::create_dir_all(&dest_label).map_err(|e| Error::io(&dest_label, e))?;

        let files = image_files(&src_label)?;
        for file in &files {
            if let Some(name) = file.file_name() {
                fs::copy(file, dest_label.join(name)).map_err(|e| Error::io(file, e))?;
            }
        }
        log::info!("copied {} images to '{}'", files.len(), label);
        copied.insert(label, files.len());
    }
    Ok(copied)
}
