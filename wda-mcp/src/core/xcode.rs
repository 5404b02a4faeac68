//! Xcode version parsing and the version-dependent profile location.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

/// Last Xcode major version that stored profiles under `MobileDevice`.
pub const LEGACY_PROFILES_MAX_MAJOR: u32 = 15;

const LEGACY_PROFILES_SUBDIR: &str = "Library/MobileDevice/Provisioning Profiles";
const CURRENT_PROFILES_SUBDIR: &str = "Library/Developer/Xcode/UserData/Provisioning Profiles";

static XCODE_VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Xcode (\d+)\.").expect("valid Xcode version regex"));

/// Extract the major version from `xcodebuild -version` output.
///
/// Returns `None` if the output does not contain an `Xcode <major>.` line.
pub fn parse_major_version(output: &str) -> Option<u32> {
    let caps = XCODE_VERSION_RE.captures(output)?;
    caps.get(1)?.as_str().parse().ok()
}

/// Directory Xcode uses for installed provisioning profiles.
pub fn profiles_dir_for_version(home: &Path, major: u32) -> PathBuf {
    if major <= LEGACY_PROFILES_MAX_MAJOR {
        home.join(LEGACY_PROFILES_SUBDIR)
    } else {
        home.join(CURRENT_PROFILES_SUBDIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_major_from_version_banner() {
        let out = "Xcode 16.2\nBuild version 16C5032a\n";
        assert_eq!(parse_major_version(out), Some(16));
    }

    #[test]
    fn parses_two_part_versions() {
        assert_eq!(parse_major_version("Xcode 15.4\n"), Some(15));
    }

    #[test]
    fn rejects_unrelated_output() {
        assert_eq!(
            parse_major_version("xcode-select: error: tool 'xcodebuild' requires Xcode"),
            None
        );
        assert_eq!(parse_major_version("Xcode 16\n"), None);
    }

    #[test]
    fn version_fifteen_uses_legacy_location() {
        let home = Path::new("/Users/dev");
        assert_eq!(
            profiles_dir_for_version(home, 15),
            PathBuf::from("/Users/dev/Library/MobileDevice/Provisioning Profiles")
        );
        assert_eq!(
            profiles_dir_for_version(home, 9),
            PathBuf::from("/Users/dev/Library/MobileDevice/Provisioning Profiles")
        );
    }

    #[test]
    fn newer_versions_use_user_data_location() {
        let home = Path::new("/Users/dev");
        assert_eq!(
            profiles_dir_for_version(home, 16),
            PathBuf::from("/Users/dev/Library/Developer/Xcode/UserData/Provisioning Profiles")
        );
    }
}
