//! Moves every file of an OS folder into its destination folder.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::archive::ERROR_DIR;
use crate::services::{Classifier, DocumentCategory};
use crate::stages::download::MESSAGE_FILE;
use crate::utils::{detect_kind, unique_path, FileKind};

pub const LOW_CONFIDENCE_DIR: &str = "LOW_CONFIDENCE";
pub const PAGE_LIMIT_DIR: &str = "LIMITE_PAGINAS";
/// Marker written once an OS folder has been fully triaged.
pub const DONE_MARKER: &str = "processamento_concluido.txt";

/// Top-level folders that hold routed files and are not routed again.
const DESTINATIONS: &[&str] = &[
    "DOCUMENTOS GERAIS",
    "INVOICE",
    "DANFE",
    "TOMADOS",
    "EXTRATO",
    "PLANILHA",
    "TXT",
    "IMAGEM_PRINT",
    "XML",
    LOW_CONFIDENCE_DIR,
    PAGE_LIMIT_DIR,
    ERROR_DIR,
];

#[derive(Debug, Clone, Copy)]
pub struct RoutingSettings {
    pub max_pages: u32,
    pub confidence_threshold: f32,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoutingSummary {
    pub total: usize,
    /// Files moved per destination folder.
    pub routed: BTreeMap<String, usize>,
}

impl RoutingSummary {
    pub fn count(&self, folder: &str) -> usize {
        self.routed.get(folder).copied().unwrap_or(0)
    }
}

/// Files under `root` that still need routing.
pub fn pending_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    fn walk(dir: &Path, root: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if entry.file_type()?.is_dir() {
                if dir == root && DESTINATIONS.contains(&name.as_ref()) {
                    continue;
                }
                walk(&entry.path(), root, out)?;
            } else if !(dir == root && (name == MESSAGE_FILE || name == DONE_MARKER)) {
                out.push(entry.path());
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    walk(root, root, &mut files)?;
    files.sort();
    Ok(files)
}

fn read_head(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut head = vec![0u8; 512];
    let n = std::fs::File::open(path)?.read(&mut head)?;
    head.truncate(n);
    Ok(head)
}

/// Decide the destination folder of one file.
async fn destination(
    path: &Path,
    classifier: &dyn Classifier,
    settings: &RoutingSettings,
) -> &'static str {
    let kind = match read_head(path) {
        Ok(head) => detect_kind(path, &head),
        Err(e) => {
            warn!("Cannot read {}: {}", path.display(), e);
            return ERROR_DIR;
        }
    };

    if let Some(folder) = kind.folder() {
        return folder;
    }
    if kind != FileKind::Pdf {
        debug!("Unsupported file {}", path.display());
        return ERROR_DIR;
    }

    match classifier.classify(path).await {
        Ok(c) if c.pages.is_some_and(|p| p > settings.max_pages) => PAGE_LIMIT_DIR,
        Ok(c) if c.confidence > settings.confidence_threshold => c
            .category
            .folder()
            .unwrap_or(LOW_CONFIDENCE_DIR),
        Ok(c) => {
            debug!(
                "{} classified as {} with confidence {:.2}",
                path.display(),
                c.category,
                c.confidence
            );
            LOW_CONFIDENCE_DIR
        }
        Err(e) => {
            warn!("Classification failed for {}: {}", path.display(), e);
            ERROR_DIR
        }
    }
}

/// Route every pending file under `root`, then remove emptied directories.
pub async fn route_folder(
    root: &Path,
    classifier: &dyn Classifier,
    settings: &RoutingSettings,
) -> std::io::Result<RoutingSummary> {
    let files = pending_files(root)?;
    let mut summary = RoutingSummary {
        total: files.len(),
        ..Default::default()
    };

    for file in files {
        let folder = destination(&file, classifier, settings).await;
        let target_dir = root.join(folder);
        std::fs::create_dir_all(&target_dir)?;

        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        std::fs::rename(&file, unique_path(&target_dir, &name))?;
        *summary.routed.entry(folder.to_string()).or_default() += 1;
    }

    remove_empty_dirs(root, root)?;
    Ok(summary)
}

fn remove_empty_dirs(dir: &Path, root: &Path) -> std::io::Result<bool> {
    let mut empty = true;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if !remove_empty_dirs(&entry.path(), root)? {
                empty = false;
            }
        } else {
            empty = false;
        }
    }
    if empty && dir != root {
        std::fs::remove_dir(dir)?;
        return Ok(true);
    }
    Ok(empty)
}

/// Whether the routed folder holds invoices for the tomados stage.
pub fn has_tomados_documents(root: &Path) -> bool {
    let Some(folder) = DocumentCategory::NotaServico.folder() else {
        return false;
    };
    std::fs::read_dir(root.join(folder))
        .map(|entries| {
            entries.flatten().any(|e| {
                e.path()
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
            })
        })
        .unwrap_or(false)
}
