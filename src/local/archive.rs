use std::fs::File;
use std::io::{self, Cursor};
use std::path::Path;

use anyhow::{Context, Result};
use walkdir::WalkDir;
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

use super::PARTIAL_PREFIX;

/// Packs everything below `dir` into an in-memory zip archive.
///
/// Entry names are relative to `dir` and use `/` separators. Entries that
/// cannot be read are skipped with a warning rather than failing the archive.
/// Uploads still being written are left out.
pub fn zip_directory(dir: &Path) -> Result<Vec<u8>> {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(9));
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let mut files = 0usize;

    let walker = WalkDir::new(dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with(PARTIAL_PREFIX));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        let relative = entry
            .path()
            .strip_prefix(dir)
            .with_context(|| format!("{} is outside {}", entry.path().display(), dir.display()))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if entry.file_type().is_dir() {
            zip.add_directory(name, options)
                .with_context(|| format!("Failed to add directory {}", relative.display()))?;
        } else if entry.file_type().is_file() {
            let mut source = File::open(entry.path())
                .with_context(|| format!("Failed to open {}", entry.path().display()))?;
            zip.start_file(name, options)
                .with_context(|| format!("Failed to add file {}", relative.display()))?;
            io::copy(&mut source, &mut zip)
                .with_context(|| format!("Failed to compress {}", entry.path().display()))?;
            files += 1;
        }
    }

    let cursor = zip.finish().context("Failed to finish archive")?;
    tracing::debug!(dir = %dir.display(), files, "Archive built");
    Ok(cursor.into_inner())
}
