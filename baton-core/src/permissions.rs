//! Write-permission probes for files and folders.
//!
//! The probe is live: it inspects the permission bits and then actually
//! tries to open the file (or create a scratch file in the folder). The bit
//! check keeps the answer meaningful for privileged users, who can otherwise
//! write to anything.

use std::fs::OpenOptions;
use std::path::Path;

/// Whether the current process can modify `path`.
///
/// A missing path is judged by its parent folder.
pub fn has_write_permission(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => has_folder_write_permission(path),
        Ok(meta) => {
            !meta.permissions().readonly() && OpenOptions::new().write(true).open(path).is_ok()
        }
        Err(_) => match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => has_write_permission(parent),
            _ => false,
        },
    }
}

/// Whether a new file can be created inside `dir`.
pub fn has_folder_write_permission(dir: &Path) -> bool {
    let readonly = match std::fs::metadata(dir) {
        Ok(meta) => meta.permissions().readonly(),
        Err(_) => return false,
    };
    if readonly {
        return false;
    }

    let probe = dir.join(format!(".baton-probe-{}", uuid::Uuid::new_v4()));
    match OpenOptions::new().write(true).create_new(true).open(&probe) {
        Ok(file) => {
            drop(file);
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}
