//! Gzip-compressed tar packaging of workspaces.
//!
//! Paths inside an archive are relative to the workspace root. Packaging and
//! extraction both honor the exclusion-prefix set, so an artifact never
//! contains (and seeding never reintroduces) build byproducts.

use anyhow::{Result, anyhow};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::path::{Component, Path};
use tar::{Archive, Builder};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::constants::EXCLUDED_PREFIXES;

/// Whether a workspace-relative path starts with an excluded prefix.
pub fn is_excluded(relative: &Path) -> bool {
    match relative.components().next() {
        Some(Component::Normal(first)) => EXCLUDED_PREFIXES
            .iter()
            .any(|prefix| first == std::ffi::OsStr::new(prefix)),
        _ => false,
    }
}

/// Pack a workspace into a gzip tar archive, excluding the prefix set.
/// Symlinks are not followed; a symlink entry is archived as a link.
pub fn pack_workspace(workspace: &Path) -> Result<Vec<u8>> {
    if !workspace.is_dir() {
        return Err(anyhow!("workspace is not a directory: {:?}", workspace));
    }

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);

    let walker = WalkDir::new(workspace)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            if entry.path() == workspace {
                return true;
            }
            match entry.path().strip_prefix(workspace) {
                Ok(relative) => !is_excluded(relative),
                Err(_) => false,
            }
        });

    for entry in walker.filter_map(|e| e.ok()) {
        let path = entry.path();
        let relative = path.strip_prefix(workspace)?;
        if relative.as_os_str().is_empty() {
            continue;
        }

        debug!("Adding to archive: {:?}", relative);

        if entry.file_type().is_dir() {
            builder.append_dir(relative, path)?;
        } else if entry.file_type().is_file() {
            let mut file = File::open(path)?;
            builder.append_file(relative, &mut file)?;
        } else {
            builder.append_path_with_name(path, relative)?;
        }
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

/// Extract a gzip tar archive into `target`, creating it if needed.
///
/// Entries whose normalized path escapes the target root are rejected;
/// excluded prefixes are skipped even if an old artifact contains them.
pub fn extract_archive(data: &[u8], target: &Path) -> Result<()> {
    std::fs::create_dir_all(target)?;

    let decoder = GzDecoder::new(data);
    let mut archive = Archive::new(decoder);
    archive.set_preserve_permissions(true);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(anyhow!("archive entry escapes extraction root: {:?}", path));
        }
        if is_excluded(&path) {
            warn!("Skipping excluded archive entry: {:?}", path);
            continue;
        }

        // unpack_in re-checks containment after link resolution.
        if !entry.unpack_in(target)? {
            return Err(anyhow!("archive entry escapes extraction root: {:?}", path));
        }
    }

    Ok(())
}
