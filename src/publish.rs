//! Write-to-temp then rename, so readers never observe a half-written artifact.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::debug;

fn temp_sibling(path: &Path) -> io::Result<PathBuf> {
    let name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no file name in {}", path.display()),
        )
    })?;
    let mut temp = name.to_os_string();
    temp.push(format!(".tmp-{}", std::process::id()));
    Ok(path.with_file_name(temp))
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Atomically replace `path` with `bytes`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    ensure_parent(path)?;
    let temp = temp_sibling(path)?;

    let result = write_synced(&temp, bytes).and_then(|_| fs::rename(&temp, path));
    match result {
        Ok(()) => debug!("published {} ({} bytes)", path.display(), bytes.len()),
        Err(_) => {
            let _ = fs::remove_file(&temp);
        }
    }
    result
}

/// Publish a directory of files in one rename. Refuses to replace an existing `dir`.
pub fn publish_dir(dir: &Path, files: &[(String, Vec<u8>)]) -> io::Result<()> {
    if dir.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} already exists", dir.display()),
        ));
    }
    ensure_parent(dir)?;

    let temp = temp_sibling(dir)?;
    if temp.exists() {
        fs::remove_dir_all(&temp)?;
    }
    fs::create_dir(&temp)?;

    let result = files
        .iter()
        .try_for_each(|(name, bytes)| write_synced(&temp.join(name), bytes))
        .and_then(|_| fs::rename(&temp, dir));
    match result {
        Ok(()) => debug!("published {} ({} files)", dir.display(), files.len()),
        Err(_) => {
            let _ = fs::remove_dir_all(&temp);
        }
    }
    result
}
