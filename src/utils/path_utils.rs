use crate::error::AppError;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const MATERIALS_SUBFOLDER: &str = "Materials";
const STAGING_PREFIX: &str = "__ImportStaging_";

/// Normalizes a content-browser folder such as `/Game/Imports/`.
///
/// Backslashes become slashes, repeated and trailing slashes collapse, and the
/// result must be rooted (`/Game/...`). Parent (`..`) and current (`.`) segments
/// are rejected since the editor does not resolve them.
pub fn normalize_content_folder(folder: &str) -> Result<String, AppError> {
    let unified = folder.trim().replace('\\', "/");
    if !unified.starts_with('/') {
        return Err(AppError::InvalidInput(format!(
            "Content folder must start with '/', e.g. /Game/Imports: {}",
            folder
        )));
    }
    let mut segments = Vec::new();
    for segment in unified.split('/').filter(|s| !s.is_empty()) {
        if segment == ".." || segment == "." {
            return Err(AppError::InvalidInput(format!(
                "Content folder may not contain '{}' segments: {}",
                segment, folder
            )));
        }
        segments.push(segment);
    }
    if segments.is_empty() {
        return Err(AppError::InvalidInput(format!("Content folder has no mount point: {}", folder)));
    }
    let normalized = format!("/{}", segments.join("/"));
    debug!(input = %folder, normalized = %normalized, "Normalized content folder");
    Ok(normalized)
}

pub fn join_content(folder: &str, name: &str) -> String {
    format!("{}/{}", folder.trim_end_matches('/'), name.trim_start_matches('/'))
}

/// Derives an asset name from a source file path on either platform's separators.
pub fn asset_name_from_file(path: &str) -> String {
    let file_name = path.rsplit(['/', '\\']).next().unwrap_or(path);
    let stem = match file_name.rfind('.') {
        Some(0) | None => file_name,
        Some(idx) => &file_name[..idx],
    };
    stem.chars()
        .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// `/Game/A/Rock.Rock` -> `/Game/A/Rock`. Package paths pass through unchanged.
pub fn package_path(object_path: &str) -> &str {
    let last_slash = object_path.rfind('/').unwrap_or(0);
    match object_path[last_slash..].find('.') {
        Some(dot) => &object_path[..last_slash + dot],
        None => object_path,
    }
}

pub fn asset_basename(path: &str) -> &str {
    let package = package_path(path);
    package.rsplit('/').next().unwrap_or(package)
}

pub fn parent_folder(path: &str) -> &str {
    let package = package_path(path);
    match package.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &package[..idx],
    }
}

pub fn is_under(path: &str, folder: &str) -> bool {
    let package = package_path(path);
    package.len() > folder.len()
        && package.starts_with(folder)
        && package.as_bytes()[folder.len()] == b'/'
}

pub fn materials_folder(destination_folder: &str) -> String {
    join_content(destination_folder, MATERIALS_SUBFOLDER)
}

pub fn staging_folder(destination_folder: &str, token: &str) -> String {
    join_content(destination_folder, &format!("{}{}", STAGING_PREFIX, token))
}

pub fn is_staging_path(path: &str) -> bool {
    package_path(path).split('/').any(|segment| segment.starts_with(STAGING_PREFIX))
}

/// Resolves a local input file: tilde expansion, canonical form, must exist.
pub fn resolve_local_file(path_str: &str) -> Result<PathBuf, AppError> {
    let expanded = shellexpand::tilde(path_str.trim()).into_owned();
    let path = PathBuf::from(&expanded);
    if !path.is_file() {
        return Err(AppError::InvalidInput(format!("File not found: {}", expanded)));
    }
    // dunce keeps Windows paths free of the \\?\ prefix the editor cannot read.
    Ok(dunce::canonicalize(&path)?)
}

/// Local path as the editor's interpreter expects it: forward slashes only.
pub fn to_editor_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
