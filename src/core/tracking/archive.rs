use std::{
    fs::{self, File},
    path::Path,
};

use tar::{Archive, Builder};
use zstd::stream::{read::Decoder as ZstdDecoder, write::Encoder as ZstdEncoder};

use crate::error::{Error, Result};

const ZSTD_LEVEL: i32 = 3;

/// Pack the contents of `src_dir` into a tar.zst file at `dest`.
pub(crate) fn pack_dir(src_dir: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }

    let out = File::create(dest).map_err(|e| Error::io(dest, e))?;

    let encoder = ZstdEncoder::new(out, ZSTD_LEVEL)
        .map_err(|e| Error::Archive(format!("Failed to create zstd encoder for {:?}: {}", dest, e)))?;

    let mut tar = Builder::new(encoder);
    tar.append_dir_all(".", src_dir)
        .map_err(|e| Error::Archive(format!("Failed to add {:?} to tar: {}", src_dir, e)))?;

    // Finish tar, then finish zstd stream
    let encoder = tar
        .into_inner()
        .map_err(|e| Error::Archive(format!("Failed to finalize tar for {:?}: {}", dest, e)))?;
    encoder
        .finish()
        .map_err(|e| Error::Archive(format!("Failed to finalize zstd stream for {:?}: {}", dest, e)))?;

    Ok(())
}

/// Extract a tar.zst file produced by [`pack_dir`] into `dest_dir`.
pub(crate) fn unpack(archive: &Path, dest_dir: &Path) -> Result<()> {
    fs::create_dir_all(dest_dir).map_err(|e| Error::io(dest_dir, e))?;

    let f = File::open(archive).map_err(|e| Error::io(archive, e))?;
    let decoder = ZstdDecoder::new(f)
        .map_err(|e| Error::Archive(format!("Invalid zstd stream in {:?}: {}", archive, e)))?;

    Archive::new(decoder).unpack(dest_dir).map_err(|e| {
        Error::Archive(format!(
            "Failed to extract archive {:?} into {:?}: {}",
            archive, dest_dir, e
        ))
    })
}

/// Recursively copy `src` into `dest`, replacing files that already exist.
pub(crate) fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).map_err(|e| Error::io(dest, e))?;
    for entry in fs::read_dir(src).map_err(|e| Error::io(src, e))? {
        let entry = entry.map_err(|e| Error::io(src, e))?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if from.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to).map_err(|e| Error::io(&from, e))?;
        }
    }
    Ok(())
}
