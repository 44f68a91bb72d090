//! Sibling image preloading.
//!
//! Opens every executable image next to the host, except the host itself, and
//! keeps the handles for the lifetime of the run. An open handle keeps the
//! original file contents reachable even after a step replaces the path.
//! Files that look like images but fail validation are skipped.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

const IMAGE_EXTENSIONS: &[&str] = &["so", "dylib", "dll", "exe"];

/// An image held open for the duration of the update
#[derive(Debug)]
pub struct LoadedImage {
    pub path: PathBuf,
    _file: File,
}

fn has_image_magic(header: &[u8]) -> bool {
    matches!(
        header,
        [0x7f, b'E', b'L', b'F', ..]
            | [b'M', b'Z', ..]
            | [0xfe, 0xed, 0xfa, 0xce | 0xcf, ..]
            | [0xce | 0xcf, 0xfa, 0xed, 0xfe, ..]
            | [0xca, 0xfe, 0xba, 0xbe, ..]
    )
}

fn looks_like_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

fn open_image(path: &Path) -> std::io::Result<Option<File>> {
    let mut file = File::open(path)?;
    let mut header = [0u8; 4];
    let read = file.read(&mut header)?;
    Ok(has_image_magic(&header[..read]).then_some(file))
}

/// Open the images in `dir`, skipping `own_exe`.
pub fn preload_siblings(dir: &Path, own_exe: &Path) -> Vec<LoadedImage> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Cannot list host folder, nothing preloaded");
            return Vec::new();
        }
    };

    let own_name = own_exe.file_name();
    let mut loaded = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() || path.file_name() == own_name {
            continue;
        }

        match open_image(&path) {
            Ok(Some(file)) => {
                debug!(path = %path.display(), "Preloaded image");
                loaded.push(LoadedImage { path, _file: file });
            }
            Ok(None) if looks_like_image(&path) => {
                warn!(path = %path.display(), "Skipping bad image");
            }
            Ok(None) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable file"),
        }
    }
    loaded
}
