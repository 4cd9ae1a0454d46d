//! Deterministic tar.gz codec for working trees.
//!
//! Entries are emitted in sorted path order with zeroed mtime and ownership and
//! normalised modes, so two identical trees always produce identical bytes and
//! therefore identical content hashes.

use devenv_core::{DevEnvError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::{Compression, GzBuilder};
use std::fs;
use std::io;
use std::path::Path;
use walkdir::WalkDir;

/// Written into a hydrated volume once extraction has completed. Never archived.
pub const READY_MARKER: &str = ".devenv-ready";

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;
const EXEC_MODE: u32 = 0o755;

fn header(entry_type: tar::EntryType, mode: u32, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    if metadata.permissions().mode() & 0o111 != 0 {
        EXEC_MODE
    } else {
        FILE_MODE
    }
}

#[cfg(not(unix))]
fn file_mode(_metadata: &fs::Metadata) -> u32 {
    FILE_MODE
}

/// Archive every entry below `root` (the root itself excluded).
pub fn pack(root: &Path) -> Result<Vec<u8>> {
    let encoder: GzEncoder<Vec<u8>> = GzBuilder::new()
        .mtime(0)
        .write(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry.map_err(|e| DevEnvError::Io(io::Error::other(e)))?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| DevEnvError::internal(e.to_string()))?;
        if relative == Path::new(READY_MARKER) {
            continue;
        }

        let file_type = entry.file_type();
        if file_type.is_dir() {
            let mut h = header(tar::EntryType::Directory, DIR_MODE, 0);
            builder.append_data(&mut h, relative, io::empty())?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            let mut h = header(tar::EntryType::Symlink, 0o777, 0);
            builder.append_link(&mut h, relative, target)?;
        } else if file_type.is_file() {
            let metadata = entry.metadata().map_err(|e| DevEnvError::Io(io::Error::other(e)))?;
            let file = fs::File::open(entry.path())?;
            let mut h = header(tar::EntryType::Regular, file_mode(&metadata), metadata.len());
            builder.append_data(&mut h, relative, file)?;
        }
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

/// Extract an archive produced by [`pack`] into `dest`, which must exist.
pub fn unpack(bytes: &[u8], dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    archive.set_preserve_mtime(false);
    archive.set_overwrite(true);
    archive.unpack(dest).map_err(|e| {
        DevEnvError::CorruptSnapshot {
            key: dest.display().to_string(),
            expected: "readable archive".to_string(),
            actual: e.to_string(),
        }
    })
}
