//! WebDriverAgent project discovery.

use std::path::{Path, PathBuf};

use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::error::ToolError;

/// Resolve the directory containing the WebDriverAgent project.
///
/// An explicit path must be an existing directory. Otherwise `search_root` is
/// walked for `descriptor` (e.g. `WebDriverAgent.xcodeproj`) and the directory
/// containing the first match, in sorted walk order, is returned.
#[instrument(skip_all, fields(explicit = explicit.is_some()))]
pub fn resolve_project(
    explicit: Option<&Path>,
    search_root: &Path,
    descriptor: &str,
) -> Result<PathBuf, ToolError> {
    if let Some(path) = explicit {
        return validate_project_dir(path);
    }

    let found = WalkDir::new(search_root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_skipped_dir(entry.file_name().to_str()))
        .filter_map(Result::ok)
        .find(|entry| entry.file_name() == descriptor)
        .and_then(|entry| entry.path().parent().map(Path::to_path_buf));

    match found {
        Some(dir) => {
            debug!(project = %dir.display(), "found project");
            Ok(dir)
        }
        None => Err(ToolError::ProjectNotFound {
            root: search_root.to_path_buf(),
            name: descriptor.to_string(),
        }),
    }
}

fn validate_project_dir(path: &Path) -> Result<PathBuf, ToolError> {
    if !path.exists() {
        return Err(ToolError::InvalidProjectPath {
            path: path.to_path_buf(),
            reason: "does not exist".to_string(),
        });
    }
    if !path.is_dir() {
        return Err(ToolError::InvalidProjectPath {
            path: path.to_path_buf(),
            reason: "not a directory".to_string(),
        });
    }
    Ok(path.to_path_buf())
}

/// Build output and VCS metadata never contain the project descriptor.
fn is_skipped_dir(name: Option<&str>) -> bool {
    matches!(name, Some("DerivedData" | ".git"))
}
