//! Provisioning profile discovery and parsing.
//!
//! A `.mobileprovision` file is a CMS (PKCS#7) envelope whose signed content is
//! an XML property list. We do not verify the signature; the plist is located by
//! its `<?xml` / `</plist>` markers and deserialized directly.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Deserialize;
use tracing::{debug, instrument};

use crate::core::types::ProvisioningProfile;
use crate::core::xcode::profiles_dir_for_version;
use crate::error::ToolError;
use crate::io::config::ServerConfig;
use crate::io::xcode::XcodeToolchain;

pub const PROFILE_EXTENSION: &str = "mobileprovision";

const PLIST_START: &[u8] = b"<?xml";
const PLIST_END: &[u8] = b"</plist>";

#[derive(Debug, Deserialize)]
struct ProfilePlist {
    #[serde(rename = "UUID")]
    uuid: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "TeamName", default)]
    team_name: String,
    #[serde(rename = "ExpirationDate")]
    expiration_date: Option<plist::Date>,
}

/// Directory holding installed profiles: the configured override, or the
/// location implied by the installed Xcode version.
pub fn resolve_profiles_dir<X: XcodeToolchain + ?Sized>(
    config: &ServerConfig,
    xcode: &X,
) -> Result<PathBuf, ToolError> {
    if let Some(dir) = &config.profiles_dir {
        return Ok(dir.clone());
    }
    let major = xcode.major_version()?;
    let home = dirs::home_dir()
        .ok_or_else(|| ToolError::validation("cannot determine home directory"))?;
    Ok(profiles_dir_for_version(&home, major))
}

/// Parse every `*.mobileprovision` in `dir`, ordered by file name.
///
/// Fails on the first unparseable file; no partial listing is returned.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn list_profiles(dir: &Path) -> Result<Vec<ProvisioningProfile>, ToolError> {
    if !dir.is_dir() {
        return Err(ToolError::NotFound {
            what: "provisioning profile directory",
            path: dir.to_path_buf(),
        });
    }

    let entries = fs::read_dir(dir).map_err(|err| ToolError::ProfileParse {
        path: dir.to_path_buf(),
        reason: format!("read directory: {err}"),
    })?;
    let mut files = profile_files(dir, entries.map(|entry| entry.map(|e| e.path())))?;
    files.sort();

    if files.is_empty() {
        return Err(ToolError::EmptyResult {
            dir: dir.to_path_buf(),
        });
    }

    let profiles = files
        .iter()
        .map(|path| parse_profile(path))
        .collect::<Result<Vec<_>, _>>()?;
    debug!(count = profiles.len(), "listed provisioning profiles");
    Ok(profiles)
}

/// Keep the profile files among `entries`. An unreadable entry fails the listing.
fn profile_files(
    dir: &Path,
    entries: impl Iterator<Item = io::Result<PathBuf>>,
) -> Result<Vec<PathBuf>, ToolError> {
    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|err| ToolError::ProfileParse {
            path: dir.to_path_buf(),
            reason: format!("read directory entry: {err}"),
        })?;
        if path.is_file() && has_profile_extension(&path) {
            files.push(path);
        }
    }
    Ok(files)
}

/// Resolve an explicitly selected profile file.
///
/// Selection is mandatory: `None` is a validation error rather than an implicit
/// pick from the directory listing.
pub fn resolve_profile(path: Option<&Path>) -> Result<ProvisioningProfile, ToolError> {
    let path = path.ok_or_else(|| {
        ToolError::validation(
            "no provisioning profile selected; call list_provisioning_profiles and pass profilePath",
        )
    })?;
    if !path.is_file() {
        return Err(ToolError::NotFound {
            what: "provisioning profile",
            path: path.to_path_buf(),
        });
    }
    parse_profile(path)
}

/// Parse one profile file.
pub fn parse_profile(path: &Path) -> Result<ProvisioningProfile, ToolError> {
    let parse_err = |reason: String| ToolError::ProfileParse {
        path: path.to_path_buf(),
        reason,
    };

    let bytes = fs::read(path).map_err(|err| parse_err(format!("read: {err}")))?;
    let xml = embedded_plist(&bytes)
        .ok_or_else(|| parse_err("no embedded property list".to_string()))?;
    let raw: ProfilePlist = plist::from_bytes(xml).map_err(|err| parse_err(err.to_string()))?;
    if raw.uuid.trim().is_empty() {
        return Err(parse_err("empty UUID".to_string()));
    }

    let expired = raw
        .expiration_date
        .map(|date| SystemTime::from(date) < SystemTime::now())
        .unwrap_or(false);

    Ok(ProvisioningProfile {
        name: display_name(&raw.name, &raw.team_name, &raw.uuid),
        bundle_id: bundle_id_fragment(&raw.name),
        uuid: raw.uuid,
        profile_name: raw.name,
        team_name: raw.team_name,
        file_path: path.to_path_buf(),
        expired,
    })
}

/// Xcode-managed profiles are named like `XC iOS: com.example.app`.
pub fn bundle_id_fragment(name: &str) -> Option<String> {
    let (_, rest) = name.split_once(':')?;
    let rest = rest.trim();
    if rest.is_empty() {
        None
    } else {
        Some(rest.to_string())
    }
}

fn display_name(name: &str, team: &str, uuid: &str) -> String {
    let label = bundle_id_fragment(name).unwrap_or_else(|| name.to_string());
    format!("{label} (Team: {team}) ({uuid})")
}

fn has_profile_extension(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some(PROFILE_EXTENSION)
}

fn embedded_plist(bytes: &[u8]) -> Option<&[u8]> {
    let start = find(bytes, PLIST_START)?;
    let end = find(&bytes[start..], PLIST_END)? + start + PLIST_END.len();
    Some(&bytes[start..end])
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
