//! Recursive zip extraction inside an OS folder.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};
use zip::ZipArchive;

use crate::utils::{detect_kind, unique_path, FileKind};

/// Folder for files triage could not handle.
pub const ERROR_DIR: &str = "ERRO_PROCESSAMENTO";
/// Subfolder holding stubs for archive members that failed to extract.
pub const EXTRACTION_ERROR_DIR: &str = "EXTRACAO_INTEGRIDADE";
/// List of failed members, written next to the stubs.
pub const EXTRACTION_ERROR_LIST: &str = "lista_erros_extracao.txt";

/// Nested archives deeper than this are left for manual review.
const MAX_ROUNDS: usize = 8;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Failed to open archive: {0}")]
    OpenFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtractionSummary {
    pub archives: usize,
    pub extracted: usize,
    /// Members that could not be extracted.
    pub failed_members: Vec<String>,
    /// Archives that could not be opened at all.
    pub broken_archives: Vec<PathBuf>,
}

/// Extract one zip into `dest`.
///
/// Directories, `__MACOSX` metadata and hidden files are skipped. Members
/// that fail to extract, including names that would escape `dest`, leave
/// an empty stub under `error_dir` and are returned by name.
pub fn extract_zip(
    archive_path: &Path,
    dest: &Path,
    error_dir: &Path,
) -> Result<(usize, Vec<String>), ArchiveError> {
    let file = File::open(archive_path).map_err(|e| ArchiveError::OpenFailed(e.to_string()))?;
    let mut archive = ZipArchive::new(file)?;

    let mut extracted = 0;
    let mut failed = Vec::new();

    for i in 0..archive.len() {
        let mut member = match archive.by_index(i) {
            Ok(member) => member,
            Err(e) => {
                warn!("Unreadable entry {} in {}: {}", i, archive_path.display(), e);
                failed.push(format!("#{}", i));
                continue;
            }
        };
        let name = member.name().to_string();

        if member.is_dir() || name.starts_with("__MACOSX") {
            continue;
        }
        let filename = name.rsplit('/').next().unwrap_or(&name).to_string();
        if filename.is_empty() || filename.starts_with('.') {
            continue;
        }

        let result = match member.enclosed_name() {
            Some(relative) => {
                let target = dest.join(relative);
                write_member(&mut member, &target)
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "entry escapes the extraction directory",
            )),
        };

        match result {
            Ok(()) => extracted += 1,
            Err(e) => {
                warn!("Failed to extract {} from {}: {}", name, archive_path.display(), e);
                std::fs::create_dir_all(error_dir)?;
                File::create(error_dir.join(&filename))?;
                failed.push(name);
            }
        }
    }

    if !failed.is_empty() {
        std::fs::create_dir_all(error_dir)?;
        std::fs::write(error_dir.join(EXTRACTION_ERROR_LIST), failed.join("\n"))?;
    }

    Ok((extracted, failed))
}

fn write_member(member: &mut zip::read::ZipFile<'_>, target: &Path) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let target = match (target.parent(), target.file_name()) {
        (Some(parent), Some(name)) => unique_path(parent, &name.to_string_lossy()),
        _ => target.to_path_buf(),
    };
    let mut out = File::create(&target)?;
    std::io::copy(member, &mut out)?;
    out.flush()
}

fn is_zip(path: &Path) -> std::io::Result<bool> {
    let mut head = [0u8; 8];
    let n = {
        use std::io::Read;
        let mut f = File::open(path)?;
        f.read(&mut head)?
    };
    Ok(detect_kind(path, &head[..n]) == FileKind::Archive)
}

fn find_archives(dir: &Path, root: &Path, found: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            if dir == root && entry.file_name() == ERROR_DIR {
                continue;
            }
            find_archives(&path, root, found)?;
        } else if is_zip(&path)? {
            found.push(path);
        }
    }
    Ok(())
}

/// Extract every zip under `root` in place, repeating until no archives are
/// left so nested archives are unpacked too.
///
/// Extracted archives are deleted. Archives that cannot be opened are moved
/// to `ERRO_PROCESSAMENTO`.
pub fn extract_all(root: &Path) -> Result<ExtractionSummary, ArchiveError> {
    let error_root = root.join(ERROR_DIR);
    let stub_dir = error_root.join(EXTRACTION_ERROR_DIR);
    let mut summary = ExtractionSummary::default();

    for _ in 0..MAX_ROUNDS {
        let mut archives = Vec::new();
        find_archives(root, root, &mut archives)?;
        if archives.is_empty() {
            return Ok(summary);
        }
        archives.sort();

        for archive in archives {
            let dest = archive.parent().unwrap_or(root).to_path_buf();
            match extract_zip(&archive, &dest, &stub_dir) {
                Ok((extracted, failed)) => {
                    info!(
                        "Extracted {} files from {}",
                        extracted,
                        archive.display()
                    );
                    summary.archives += 1;
                    summary.extracted += extracted;
                    summary.failed_members.extend(failed);
                    std::fs::remove_file(&archive)?;
                }
                Err(ArchiveError::Io(e)) => return Err(ArchiveError::Io(e)),
                Err(e) => {
                    warn!("Cannot open archive {}: {}", archive.display(), e);
                    std::fs::create_dir_all(&error_root)?;
                    let name = archive
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "arquivo.zip".to_string());
                    let moved = unique_path(&error_root, &name);
                    std::fs::rename(&archive, &moved)?;
                    summary.broken_archives.push(moved);
                }
            }
        }
    }

    warn!("Archive nesting too deep under {}", root.display());
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, SimpleFileOptions::default()).unwrap();
            } else {
                writer.start_file(*name, SimpleFileOptions::default()).unwrap();
                writer.write_all(body).unwrap();
            }
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_extract_skips_metadata_and_hidden_files() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("docs.zip");
        std::fs::write(
            &archive,
            zip_bytes(&[
                ("notas/", b""),
                ("notas/nota.pdf", b"%PDF-1.4"),
                ("__MACOSX/notas/._nota.pdf", b"junk"),
                ("notas/.DS_Store", b"junk"),
            ]),
        )
        .unwrap();

        let (extracted, failed) =
            extract_zip(&archive, dir.path(), &dir.path().join("errors")).unwrap();
        assert_eq!(extracted, 1);
        assert!(failed.is_empty());
        assert!(dir.path().join("notas/nota.pdf").exists());
        assert!(!dir.path().join("__MACOSX").exists());
        assert!(!dir.path().join("notas/.DS_Store").exists());
    }

    #[test]
    fn test_extract_all_unpacks_nested_archives() {
        let dir = tempdir().unwrap();
        let inner = zip_bytes(&[("extrato.pdf", b"%PDF-1.4")]);
        std::fs::write(
            dir.path().join("outer.zip"),
            zip_bytes(&[("boleto.pdf", b"%PDF-1.4"), ("inner.zip", &inner)]),
        )
        .unwrap();

        let summary = extract_all(dir.path()).unwrap();
        assert_eq!(summary.archives, 2);
        assert_eq!(summary.extracted, 3);
        assert!(dir.path().join("boleto.pdf").exists());
        assert!(dir.path().join("extrato.pdf").exists());
        assert!(!dir.path().join("outer.zip").exists());
        assert!(!dir.path().join("inner.zip").exists());
    }

    #[test]
    fn test_broken_archive_moves_to_error_folder() {
        let dir = tempdir().unwrap();
        // Zip magic followed by garbage.
        std::fs::write(dir.path().join("quebrado.zip"), b"PK\x03\x04garbage").unwrap();

        let summary = extract_all(dir.path()).unwrap();
        assert_eq!(summary.broken_archives.len(), 1);
        assert!(dir.path().join(ERROR_DIR).join("quebrado.zip").exists());
        assert!(!dir.path().join("quebrado.zip").exists());
    }
}
