//! File kind detection for routing.

use std::path::Path;

/// Coarse file kinds that decide where triage sends a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Pdf,
    Archive,
    Spreadsheet,
    Text,
    Image,
    Xml,
    Other,
}

impl FileKind {
    pub fn id(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Archive => "archive",
            Self::Spreadsheet => "spreadsheet",
            Self::Text => "text",
            Self::Image => "image",
            Self::Xml => "xml",
            Self::Other => "other",
        }
    }

    /// Destination folder for kinds routed by type alone.
    ///
    /// PDFs and archives return `None`: PDFs are classified by content and
    /// archives are unpacked.
    pub fn folder(&self) -> Option<&'static str> {
        match self {
            Self::Spreadsheet => Some("PLANILHA"),
            Self::Text => Some("TXT"),
            Self::Image => Some("IMAGEM_PRINT"),
            Self::Xml => Some("XML"),
            Self::Pdf | Self::Archive | Self::Other => None,
        }
    }
}

/// Categorize a MIME type into a file kind.
pub fn mime_type_kind(mime: &str) -> FileKind {
    let mime_lower = mime.to_lowercase();

    if mime_lower == "application/pdf" {
        FileKind::Pdf
    } else if mime_lower == "application/zip"
        || mime_lower == "application/x-zip"
        || mime_lower == "application/x-zip-compressed"
    {
        FileKind::Archive
    } else if mime_lower.contains("spreadsheet")
        || mime_lower.contains("excel")
        || mime_lower == "text/csv"
    {
        FileKind::Spreadsheet
    } else if mime_lower == "application/xml" || mime_lower == "text/xml" {
        FileKind::Xml
    } else if mime_lower == "image/png" || mime_lower == "image/jpeg" {
        FileKind::Image
    } else if mime_lower == "text/plain" {
        FileKind::Text
    } else {
        FileKind::Other
    }
}

/// Kind implied by the file extension alone.
pub fn kind_from_extension(path: &Path) -> FileKind {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());

    match ext.as_deref() {
        Some("pdf") => FileKind::Pdf,
        Some("zip") => FileKind::Archive,
        Some("csv" | "xls" | "xlsx") => FileKind::Spreadsheet,
        Some("txt") => FileKind::Text,
        Some("png" | "jpg" | "jpeg") => FileKind::Image,
        Some("xml") => FileKind::Xml,
        _ => mime_guess::from_path(path)
            .first()
            .map(|m| mime_type_kind(m.essence_str()))
            .unwrap_or(FileKind::Other),
    }
}

/// Kind from the file's leading bytes, falling back to the extension.
///
/// Content wins for PDFs so a misnamed attachment is still classified. Zip
/// content only counts as an archive when the extension says nothing else:
/// office formats are zips internally.
pub fn detect_kind(path: &Path, head: &[u8]) -> FileKind {
    let by_extension = kind_from_extension(path);
    match infer::get(head).map(|t| mime_type_kind(t.mime_type())) {
        Some(FileKind::Pdf) => FileKind::Pdf,
        Some(FileKind::Archive)
            if by_extension == FileKind::Other && mime_guess::from_path(path).first().is_none() =>
        {
            FileKind::Archive
        }
        _ => by_extension,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_routing() {
        assert_eq!(kind_from_extension(Path::new("a.PDF")), FileKind::Pdf);
        assert_eq!(kind_from_extension(Path::new("b.xlsx")), FileKind::Spreadsheet);
        assert_eq!(kind_from_extension(Path::new("c.jpeg")), FileKind::Image);
        assert_eq!(kind_from_extension(Path::new("d.xml")), FileKind::Xml);
        assert_eq!(kind_from_extension(Path::new("e")), FileKind::Other);
        assert_eq!(FileKind::Spreadsheet.folder(), Some("PLANILHA"));
        assert_eq!(FileKind::Pdf.folder(), None);
    }

    #[test]
    fn test_content_overrides_extension() {
        assert_eq!(detect_kind(Path::new("nota.bin"), b"%PDF-1.7\n"), FileKind::Pdf);
        assert_eq!(
            detect_kind(Path::new("pacote"), b"PK\x03\x04\x14\x00\x00\x00"),
            FileKind::Archive
        );
        assert_eq!(
            detect_kind(Path::new("contrato.docx"), b"PK\x03\x04\x14\x00\x00\x00"),
            FileKind::Other
        );
        assert_eq!(
            detect_kind(Path::new("planilha.xlsx"), b"PK\x03\x04\x14\x00\x00\x00"),
            FileKind::Spreadsheet
        );
        assert_eq!(detect_kind(Path::new("leia.txt"), b"hello"), FileKind::Text);
    }
}
