use std::{
    io::Write,
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{bail, Context, Result};

static TEMP_FILE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Writes text using a temp file + rename so readers never observe partial data.
pub fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    write_text_atomic_with_mode(path, content, None)
}

/// Same as [`write_text_atomic`], additionally applying Unix permission bits to
/// the temp file before it is renamed into place. `mode` is ignored elsewhere.
pub fn write_text_atomic_with_mode(path: &Path, content: &str, mode: Option<u32>) -> Result<()> {
    if path.as_os_str().is_empty() {
        bail!("destination path cannot be empty");
    }
    if path.exists() && path.is_dir() {
        bail!("destination path '{}' is a directory", path.display());
    }

    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent_dir)
        .with_context(|| format!("failed to create {}", parent_dir.display()))?;

    let temp_name = format!(
        ".{}.tmp-{}-{}-{}",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("issuebot-store"),
        std::process::id(),
        temp_name_nonce(),
        TEMP_FILE_COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    let temp_path = parent_dir.join(temp_name);
    let written = write_and_sync(&temp_path, content, mode);
    if let Err(error) = written {
        let _ = std::fs::remove_file(&temp_path);
        return Err(error);
    }
    if let Err(error) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(error).with_context(|| {
            format!(
                "failed to rename temporary file {} to {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

fn temp_name_nonce() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default()
}

fn write_and_sync(temp_path: &Path, content: &str, mode: Option<u32>) -> Result<()> {
    let mut file = std::fs::File::create(temp_path)
        .with_context(|| format!("failed to create temporary file {}", temp_path.display()))?;
    apply_mode(&file, mode)
        .with_context(|| format!("failed to set permissions on {}", temp_path.display()))?;
    file.write_all(content.as_bytes())
        .with_context(|| format!("failed to write temporary file {}", temp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to sync temporary file {}", temp_path.display()))?;
    Ok(())
}

#[cfg(unix)]
fn apply_mode(file: &std::fs::File, mode: Option<u32>) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    match mode {
        Some(mode) => file.set_permissions(std::fs::Permissions::from_mode(mode)),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn apply_mode(_file: &std::fs::File, _mode: Option<u32>) -> std::io::Result<()> {
    Ok(())
}
