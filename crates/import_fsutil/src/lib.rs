//! Small filesystem helpers shared by the descriptor and recipe sets.
//!
//! Both sets need to persist a structured document without ever leaving a
//! half-written file on disk if the process is interrupted mid-write.

use std::path::Path;

/// Build a [`tempfile::NamedTempFile`] in the same directory as `path`, using
/// the original filename as the prefix so the temp file is easily
/// identifiable (e.g. `.foo.morph.XXXXXX`).
fn temp_file_for(path: &Path) -> std::io::Result<tempfile::NamedTempFile> {
    let dir = path.parent().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "path has no parent directory",
        )
    })?;
    std::fs::create_dir_all(dir)?;

    let prefix = format!(
        ".{}.",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("tmp")
    );

    tempfile::Builder::new().prefix(&prefix).tempfile_in(dir)
}

/// Atomically write contents to a file: write to a temp file in the same
/// directory, then rename it into place. If the write fails, the original
/// file (if any) is untouched.
pub async fn atomic_write(path: &Path, contents: impl AsRef<[u8]>) -> std::io::Result<()> {
    let temp_file = temp_file_for(path)?;
    let temp_path = temp_file.into_temp_path();

    tokio::fs::write(&temp_path, contents).await?;

    temp_path.persist(path).map_err(|e| e.error)?;

    Ok(())
}
