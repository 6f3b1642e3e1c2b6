//! Export archive discovery via the system `unzip`.
//!
//! Every archive is listed first (`unzip -Z -1`). If any entry is absolute,
//! carries a drive prefix, or contains a `..` segment, the whole archive is
//! rejected with a warning and nothing is extracted. Safe archives are
//! extracted (`unzip -oq`) into `<temp_root>/<stem>-<n>`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::process::ProcessRunner;

const UNZIP: &str = "unzip";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedArchive {
    pub archive: PathBuf,
    pub directory: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveDiscovery {
    pub extracted: Vec<ExtractedArchive>,
    pub warnings: Vec<String>,
}

/// Why an entry name is unsafe to extract, if it is.
pub fn unsafe_entry_reason(entry: &str) -> Option<&'static str> {
    let normalized = entry.replace('\\', "/");
    if normalized.starts_with('/') {
        return Some("absolute path");
    }
    let bytes = normalized.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Some("drive prefix");
    }
    if normalized.split('/').any(|segment| segment == "..") {
        return Some("parent directory segment");
    }
    None
}

/// List, validate, and extract each archive.
///
/// Per-archive failures become warnings; only an unusable `temp_root` is
/// an error.
pub async fn discover_archives(
    runner: &dyn ProcessRunner,
    archives: &[PathBuf],
    temp_root: &Path,
) -> Result<ArchiveDiscovery> {
    std::fs::create_dir_all(temp_root)
        .with_context(|| format!("Failed to create {}", temp_root.display()))?;

    let mut discovery = ArchiveDiscovery::default();
    for (n, archive) in archives.iter().enumerate() {
        match extract_one(runner, archive, temp_root, n + 1).await {
            Ok(directory) => discovery.extracted.push(ExtractedArchive {
                archive: archive.clone(),
                directory,
            }),
            Err(warning) => {
                log::warn!("{}", warning);
                discovery.warnings.push(warning);
            }
        }
    }
    Ok(discovery)
}

/// `Err` carries the warning for an unsafe or unreadable archive.
async fn extract_one(
    runner: &dyn ProcessRunner,
    archive: &Path,
    temp_root: &Path,
    n: usize,
) -> Result<PathBuf, String> {
    let shown = archive.display().to_string();
    let listing = runner
        .run(UNZIP, &["-Z".to_string(), "-1".to_string(), shown.clone()])
        .await
        .map_err(|e| format!("{}: could not list archive: {:#}", shown, e))?;
    if !listing.success() {
        return Err(format!(
            "{}: could not list archive: {}",
            shown,
            listing.failure_detail()
        ));
    }

    for entry in listing.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(reason) = unsafe_entry_reason(entry) {
            return Err(format!(
                "{}: rejected unsafe archive, entry '{}' has {}",
                shown, entry, reason
            ));
        }
    }

    let stem = archive
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "archive".to_string());
    let directory = temp_root.join(format!("{}-{}", stem, n));
    let output = runner
        .run(
            UNZIP,
            &[
                "-oq".to_string(),
                shown.clone(),
                "-d".to_string(),
                directory.display().to_string(),
            ],
        )
        .await
        .map_err(|e| format!("{}: could not extract archive: {:#}", shown, e))?;
    if !output.success() {
        return Err(format!(
            "{}: could not extract archive: {}",
            shown,
            output.failure_detail()
        ));
    }
    Ok(directory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ProcessOutput, ScriptedRunner};
    use tempfile::TempDir;

    #[test]
    fn classifies_unsafe_entries() {
        assert_eq!(unsafe_entry_reason("conversations.json"), None);
        assert_eq!(unsafe_entry_reason("a/b..c/d.json"), None);
        assert_eq!(unsafe_entry_reason("/etc/passwd"), Some("absolute path"));
        assert_eq!(unsafe_entry_reason("C:\\evil.txt"), Some("drive prefix"));
        assert_eq!(unsafe_entry_reason("data/../../evil"), Some("parent directory segment"));
        assert_eq!(unsafe_entry_reason("..\\evil"), Some("parent directory segment"));
    }

    #[tokio::test]
    async fn traversal_rejects_whole_archive() {
        let tmp = TempDir::new().unwrap();
        let runner = ScriptedRunner::new();
        runner.push(ProcessOutput::ok("conversations.json\n../../outside.txt\n"));

        let discovery = discover_archives(&runner, &[PathBuf::from("/in/export.zip")], tmp.path())
            .await
            .unwrap();
        assert!(discovery.extracted.is_empty());
        assert_eq!(discovery.warnings.len(), 1);
        assert!(discovery.warnings[0].contains("../../outside.txt"));
        // Only the listing ran; nothing was extracted.
        assert_eq!(runner.calls().len(), 1);
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn extracts_safe_archives_into_numbered_dirs() {
        let tmp = TempDir::new().unwrap();
        let runner = ScriptedRunner::new();
        runner
            .push(ProcessOutput::ok("conversations.json\n"))
            .push(ProcessOutput::ok(""))
            .push(ProcessOutput::failed(9, "End-of-central-directory signature not found"));

        let archives = vec![PathBuf::from("/in/chatgpt.zip"), PathBuf::from("/in/broken.zip")];
        let discovery = discover_archives(&runner, &archives, tmp.path()).await.unwrap();
        assert_eq!(discovery.extracted.len(), 1);
        assert_eq!(discovery.extracted[0].directory, tmp.path().join("chatgpt-1"));
        assert!(discovery.warnings[0].starts_with("/in/broken.zip: could not list archive"));

        let calls = runner.calls();
        assert_eq!(calls[1].args[0], "-oq");
        assert_eq!(calls[1].args[3], tmp.path().join("chatgpt-1").display().to_string());
    }
}
