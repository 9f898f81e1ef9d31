use anyhow::Result;
use std::path::{Path, PathBuf};

/// Map a caller-supplied device identifier onto something safe to use as a
/// directory name. Anything outside alphanumerics, `_`, `-` and `.` becomes
/// an underscore, matching the layout the archive writes. A dot-only result
/// would name the current or parent directory, so those become underscores
/// too.
pub fn sanitize_device_id(device_id: &str) -> String {
    let sanitized: String = device_id
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.chars().all(|c| c == '.') {
        "_".repeat(sanitized.len().max(1))
    } else {
        sanitized
    }
}

/// Enumerates device identifiers that have ever sent data, independent of
/// live state: one sub-directory per device under the archive root.
pub struct StoredDeviceCatalog {
    root: PathBuf,
}

impl StoredDeviceCatalog {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Sorted list of known device folder names.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut devices = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                devices.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        devices.sort();
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("drover-catalog-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn sanitizes_hostile_identifiers() {
        assert_eq!(sanitize_device_id("pixel-7_user.1"), "pixel-7_user.1");
        assert_eq!(sanitize_device_id("../etc/passwd"), ".._etc_passwd");
        assert_eq!(sanitize_device_id("dev id/with spaces"), "dev_id_with_spaces");
    }

    #[test]
    fn dot_only_identifiers_cannot_name_a_parent_directory() {
        assert_eq!(sanitize_device_id("."), "_");
        assert_eq!(sanitize_device_id(".."), "__");
        assert_eq!(sanitize_device_id("..."), "___");
        // A dot among other characters is still fine.
        assert_eq!(sanitize_device_id(".hidden"), ".hidden");
    }

    #[test]
    fn lists_device_folders_sorted() {
        let root = temp_root();
        let catalog = StoredDeviceCatalog::new(&root).unwrap();
        assert!(catalog.list().unwrap().is_empty());

        std::fs::create_dir(root.join("dev-b")).unwrap();
        std::fs::create_dir(root.join("dev-a")).unwrap();
        std::fs::write(root.join("stray-file"), b"x").unwrap();

        assert_eq!(catalog.list().unwrap(), vec!["dev-a", "dev-b"]);
        std::fs::remove_dir_all(root).unwrap();
    }
}
