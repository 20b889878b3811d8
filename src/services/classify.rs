//! Document classification.

use std::path::Path;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::bytes::Regex as BytesRegex;
use thiserror::Error;

use crate::utils::{detect_kind, FileKind};

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Classifier error: {0}")]
    Other(String),
}

/// Document types triage knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentCategory {
    Guia,
    Boleto,
    FaturaConsumo,
    ComprovantePagamento,
    Danfe,
    /// Service invoice taken by the client; feeds the tomados stage.
    NotaServico,
    Extrato,
    InvoiceExterior,
    Unknown,
}

impl DocumentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Guia => "guia",
            Self::Boleto => "boleto",
            Self::FaturaConsumo => "fatura_consumo",
            Self::ComprovantePagamento => "comprovante_pagamento",
            Self::Danfe => "danfe",
            Self::NotaServico => "nota_servico",
            Self::Extrato => "extrato",
            Self::InvoiceExterior => "invoice_exterior",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "guia" => Some(Self::Guia),
            "boleto" => Some(Self::Boleto),
            "fatura_consumo" => Some(Self::FaturaConsumo),
            "comprovante_pagamento" => Some(Self::ComprovantePagamento),
            "danfe" => Some(Self::Danfe),
            "nota_servico" => Some(Self::NotaServico),
            "extrato" => Some(Self::Extrato),
            "invoice_exterior" => Some(Self::InvoiceExterior),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Destination folder inside the OS folder, `None` for unknown documents.
    pub fn folder(&self) -> Option<&'static str> {
        match self {
            Self::Guia | Self::Boleto | Self::FaturaConsumo | Self::ComprovantePagamento => {
                Some("DOCUMENTOS GERAIS")
            }
            Self::Danfe => Some("DANFE"),
            Self::NotaServico => Some("TOMADOS"),
            Self::Extrato => Some("EXTRATO"),
            Self::InvoiceExterior => Some("INVOICE"),
            Self::Unknown => None,
        }
    }
}

impl std::fmt::Display for DocumentCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub category: DocumentCategory,
    /// 0.0 to 1.0.
    pub confidence: f32,
    /// Page count, when the classifier could tell.
    pub pages: Option<u32>,
}

impl Classification {
    pub fn unknown() -> Self {
        Self {
            category: DocumentCategory::Unknown,
            confidence: 0.0,
            pages: None,
        }
    }
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, path: &Path) -> Result<Classification, ClassifyError>;
}

/// Keyword table checked against the lowercased file name, first match wins.
const NAME_KEYWORDS: &[(&str, DocumentCategory)] = &[
    ("danfe", DocumentCategory::Danfe),
    ("nfse", DocumentCategory::NotaServico),
    ("nfs-e", DocumentCategory::NotaServico),
    ("nota servico", DocumentCategory::NotaServico),
    ("nota_servico", DocumentCategory::NotaServico),
    ("tomad", DocumentCategory::NotaServico),
    ("boleto", DocumentCategory::Boleto),
    ("comprovante", DocumentCategory::ComprovantePagamento),
    ("extrato", DocumentCategory::Extrato),
    ("invoice", DocumentCategory::InvoiceExterior),
    ("fatura", DocumentCategory::FaturaConsumo),
    ("darf", DocumentCategory::Guia),
    ("guia", DocumentCategory::Guia),
];

static PAGE_OBJECT: LazyLock<Option<BytesRegex>> =
    LazyLock::new(|| BytesRegex::new(r"/Type\s*/Page[^s]").ok());

/// Count page objects in a PDF body.
pub fn count_pdf_pages(body: &[u8]) -> Option<u32> {
    let re = PAGE_OBJECT.as_ref()?;
    let pages = re.find_iter(body).count() as u32;
    (pages > 0).then_some(pages)
}

/// Classifier that sniffs content type with `infer` and recognizes document
/// types by file-name keywords.
///
/// Anything it cannot name gets confidence 0, so triage sends it to review.
#[derive(Debug, Default, Clone)]
pub struct MimeClassifier;

impl MimeClassifier {
    pub fn new() -> Self {
        Self
    }

    fn category_for_name(name: &str) -> Option<DocumentCategory> {
        let lower = name.to_lowercase();
        NAME_KEYWORDS
            .iter()
            .find(|(keyword, _)| lower.contains(keyword))
            .map(|(_, category)| *category)
    }
}

#[async_trait]
impl Classifier for MimeClassifier {
    async fn classify(&self, path: &Path) -> Result<Classification, ClassifyError> {
        let body = tokio::fs::read(path).await?;
        if detect_kind(path, &body) != FileKind::Pdf {
            return Ok(Classification::unknown());
        }

        let pages = count_pdf_pages(&body);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(match Self::category_for_name(&name) {
            Some(category) => Classification {
                category,
                confidence: 1.0,
                pages,
            },
            None => Classification {
                pages,
                ..Classification::unknown()
            },
        })
    }
}
