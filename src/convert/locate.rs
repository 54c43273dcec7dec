//! Finding the yt-dlp executable

use std::{
    env,
    ffi::OsStr,
    path::{Path, PathBuf},
};
use tracing::{debug, trace};

use super::ConvertError;

const TOOL_NAME: &str = "yt-dlp";

/// Install locations checked before falling back to `PATH`, most specific first
const WELL_KNOWN_LOCATIONS: &[&str] = &[
    "/opt/homebrew/bin/yt-dlp", // Homebrew on Apple Silicon
    "/usr/local/bin/yt-dlp",    // Homebrew on Intel, manual installs
    "/usr/bin/yt-dlp",          // distro packages
    "C:\\yt-dlp\\yt-dlp.exe",
    "./yt-dlp",
    "./yt-dlp.exe",
];

/// Resolve the extractor binary.
///
/// An explicitly configured path wins and must exist. Otherwise the well-known
/// locations are tried in order, then every `PATH` entry.
#[tracing::instrument(level = "debug")]
pub fn locate_tool(configured: Option<&Path>) -> Result<PathBuf, ConvertError> {
    if let Some(path) = configured {
        return if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(ConvertError::ToolNotFound)
        };
    }

    if let Some(path) = WELL_KNOWN_LOCATIONS
        .iter()
        .map(Path::new)
        .find(|p| p.is_file())
    {
        debug!(path = %path.display(), "Found yt-dlp in a well-known location");
        return Ok(path.to_path_buf());
    }

    env::var_os("PATH")
        .and_then(|paths| search_path(TOOL_NAME, &paths))
        .ok_or(ConvertError::ToolNotFound)
}

/// Look for `name` (or `name.exe`) in every directory of a `PATH`-style list
pub fn search_path(name: &str, path_var: &OsStr) -> Option<PathBuf> {
    let exe_name = format!("{name}.exe");

    env::split_paths(path_var)
        .filter(|dir| !dir.as_os_str().is_empty())
        .flat_map(|dir| [dir.join(name), dir.join(&exe_name)])
        .find(|candidate| {
            trace!(candidate = %candidate.display(), "Checking for yt-dlp");
            candidate.is_file()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    fn path_of(dirs: &[&Path]) -> OsString {
        env::join_paths(dirs).unwrap()
    }

    #[test]
    fn test_search_path_finds_plain_binary() {
        let empty = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        std::fs::write(bin.path().join("yt-dlp"), b"").unwrap();

        let found = search_path("yt-dlp", &path_of(&[empty.path(), bin.path()]));
        assert_eq!(found, Some(bin.path().join("yt-dlp")));
    }

    #[test]
    fn test_search_path_finds_exe_suffix() {
        let bin = tempfile::tempdir().unwrap();
        std::fs::write(bin.path().join("yt-dlp.exe"), b"").unwrap();

        let found = search_path("yt-dlp", &path_of(&[bin.path()]));
        assert_eq!(found, Some(bin.path().join("yt-dlp.exe")));
    }

    #[test]
    fn test_search_path_ignores_directories() {
        let bin = tempfile::tempdir().unwrap();
        std::fs::create_dir(bin.path().join("yt-dlp")).unwrap();

        assert_eq!(search_path("yt-dlp", &path_of(&[bin.path()])), None);
    }

    #[test]
    fn test_search_path_missing() {
        let bin = tempfile::tempdir().unwrap();
        assert_eq!(search_path("yt-dlp", &path_of(&[bin.path()])), None);
        assert_eq!(search_path("yt-dlp", OsStr::new("")), None);
    }

    #[test]
    fn test_configured_path() {
        let bin = tempfile::tempdir().unwrap();
        let tool = bin.path().join("my-yt-dlp");
        std::fs::write(&tool, b"").unwrap();

        assert_eq!(locate_tool(Some(&tool)).unwrap(), tool);
        assert!(matches!(
            locate_tool(Some(&bin.path().join("nope"))),
            Err(ConvertError::ToolNotFound)
        ));
    }
}
