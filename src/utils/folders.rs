//! OS folder naming and lookup.

use std::path::{Path, PathBuf};

/// Replace characters that are unsafe in a path component.
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    cleaned.trim_matches('.').trim().to_string()
}

/// Folder name for an OS: `<id>-<nickname>`, or just the id without one.
pub fn os_folder_name(entity_id: i64, nickname: &str) -> String {
    let nickname = sanitize_component(nickname);
    if nickname.is_empty() {
        entity_id.to_string()
    } else {
        format!("{}-{}", entity_id, nickname)
    }
}

/// Locate the folder of an OS inside `work_dir` by its id prefix.
pub fn find_os_folder(work_dir: &Path, entity_id: i64) -> std::io::Result<Option<PathBuf>> {
    let exact = entity_id.to_string();
    let prefix = format!("{}-", entity_id);

    let mut found: Option<PathBuf> = None;
    for entry in std::fs::read_dir(work_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == exact || name.starts_with(&prefix) {
            let path = entry.path();
            // Deterministic pick if a nickname changed between downloads.
            if found.as_ref().map_or(true, |f| path < *f) {
                found = Some(path);
            }
        }
    }
    Ok(found)
}

/// Path for `file_name` in `dir` that does not collide with an existing file.
pub fn unique_path(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());

    (1..)
        .map(|n| match &ext {
            Some(ext) => dir.join(format!("{} ({}).{}", stem, n, ext)),
            None => dir.join(format!("{} ({})", stem, n)),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_folder_name() {
        assert_eq!(os_folder_name(42, "PADARIA BOM PÃO"), "42-PADARIA BOM PÃO");
        assert_eq!(os_folder_name(42, " a/b:c "), "42-a_b_c");
        assert_eq!(os_folder_name(42, "  "), "42");
    }

    #[test]
    fn test_find_by_prefix() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("42-PADARIA")).unwrap();
        std::fs::create_dir(dir.path().join("420-OUTRO")).unwrap();

        let found = find_os_folder(dir.path(), 42).unwrap().unwrap();
        assert!(found.ends_with("42-PADARIA"));
        assert!(find_os_folder(dir.path(), 4).unwrap().is_none());
    }

    #[test]
    fn test_unique_path() {
        let dir = tempdir().unwrap();
        assert_eq!(unique_path(dir.path(), "a.pdf"), dir.path().join("a.pdf"));
        std::fs::write(dir.path().join("a.pdf"), b"").unwrap();
        assert_eq!(unique_path(dir.path(), "a.pdf"), dir.path().join("a (1).pdf"));
    }
}
