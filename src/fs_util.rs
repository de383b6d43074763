//! Small capability-scoped file helpers.
//!
//! Every helper opens the parent directory with ambient authority and then
//! works relative to it, so paths are resolved the same way everywhere.

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};

/// Expands a leading `~/` prefix to the user's home directory.
///
/// The input is returned unchanged when `HOME` is unset.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

fn open_parent(path: &str) -> Result<(Dir, &Utf8Path), String> {
    let path_buf = Utf8Path::new(path);
    let (dir_path, file_path) = if path_buf.is_absolute() {
        let parent = path_buf
            .parent()
            .ok_or_else(|| format!("path has no parent directory: {path_buf}"))?;
        let file_name = path_buf
            .file_name()
            .ok_or_else(|| format!("path has no file name: {path_buf}"))?;
        (parent, Utf8Path::new(file_name))
    } else {
        (Utf8Path::new("."), path_buf)
    };
    let dir =
        Dir::open_ambient_dir(dir_path, ambient_authority()).map_err(|err| err.to_string())?;
    Ok((dir, file_path))
}

/// Reads a whole file as UTF-8.
///
/// # Errors
///
/// Returns the rendered I/O error when the file cannot be opened or read.
pub fn read_to_string(path: &str) -> Result<String, String> {
    let (dir, file) = open_parent(path)?;
    dir.read_to_string(file).map_err(|err| err.to_string())
}

/// Returns `true` when `path` names an existing regular file.
#[must_use]
pub fn is_file(path: &str) -> bool {
    open_parent(path).is_ok_and(|(dir, file)| dir.is_file(file))
}

/// Writes `contents` to `path` and restricts it to the owner.
///
/// # Errors
///
/// Returns the rendered I/O error when the file cannot be written.
pub fn write_private(path: &str, contents: &str) -> Result<(), String> {
    let (dir, file) = open_parent(path)?;
    dir.write(file, contents).map_err(|err| err.to_string())?;
    restrict_to_owner(&dir, file)
}

#[cfg(unix)]
fn restrict_to_owner(dir: &Dir, file: &Utf8Path) -> Result<(), String> {
    use std::os::unix::fs::PermissionsExt;

    let permissions = cap_std::fs::Permissions::from_std(std::fs::Permissions::from_mode(0o600));
    dir.set_permissions(file, permissions)
        .map_err(|err| err.to_string())
}

#[cfg(not(unix))]
fn restrict_to_owner(_dir: &Dir, _file: &Utf8Path) -> Result<(), String> {
    Ok(())
}

/// Deletes the file at `path`.
///
/// # Errors
///
/// Returns the rendered I/O error when the file cannot be removed.
pub fn remove_file(path: &str) -> Result<(), String> {
    let (dir, file) = open_parent(path)?;
    dir.remove_file(file).map_err(|err| err.to_string())
}
