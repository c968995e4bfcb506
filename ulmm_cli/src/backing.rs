use std::{
    fs::{File, OpenOptions},
    path::Path,
};

use anyhow::{Context, Result, bail};
use humansize::{BINARY, format_size};

/// Open the data file at `path`, creating it with `pages` zeroed pages when
/// missing. An existing file must hold at least that many pages.
pub fn ensure_data_file(path: &Path, pages: usize, page_size: usize) -> Result<File> {
    let size = (pages * page_size) as u64;

    if !path.exists() {
        log::info!(
            "creating data file {} ({})",
            path.display(),
            format_size(size, BINARY)
        );
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("create data file {}", path.display()))?;
        file.set_len(size)
            .with_context(|| format!("extend data file {}", path.display()))?;
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("open data file {}", path.display()))?;
    let len = file.metadata()?.len();
    if len < size {
        bail!(
            "data file {} holds {} bytes, {} needed",
            path.display(),
            len,
            size
        );
    }
    Ok(file)
}
