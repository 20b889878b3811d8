//! `GERAL.txt` rows built from extracted invoice fields, and the
//! per-tomador `TOMADOS <razao> - <cnpj>.txt` files split from them.
//!
//! Each row is 28 `;`-separated columns in the layout the accounting import
//! expects. Unused columns stay empty.

use std::sync::LazyLock;

use regex::Regex;

use crate::services::Fields;
use crate::utils::sanitize_component;

pub const LEDGER_FILE: &str = "GERAL.txt";

const ZERO: &str = "0,00";

enum Column {
    Field(&'static str),
    /// Monetary field, `0,00` when absent.
    Amount(&'static str),
    Literal(&'static str),
    /// PIS + COFINS + CSLL.
    Csrf,
    Blank,
}

const LAYOUT: [Column; 28] = [
    Column::Field("cnpj_prestador"),
    Column::Field("razao_social"),
    Column::Field("uf"),
    Column::Field("municipio"),
    Column::Blank,
    Column::Field("numero_nota"),
    Column::Blank,
    Column::Field("data_emissao"),
    Column::Literal("0"),
    Column::Field("acumulador"),
    Column::Blank,
    Column::Amount("valor_total"),
    Column::Blank,
    Column::Amount("valor_total"),
    Column::Amount("valor_total"),
    Column::Blank,
    Column::Blank,
    Column::Blank,
    Column::Amount("ir"),
    Column::Blank,
    Column::Blank,
    Column::Blank,
    Column::Csrf,
    Column::Amount("valor_inss"),
    Column::Blank,
    Column::Blank,
    Column::Blank,
    Column::Field("cnpj_tomador"),
];

fn clean(value: &str) -> String {
    value
        .chars()
        .map(|c| if c == ';' || c.is_control() { ' ' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Parse a Brazilian or plain decimal amount into cents.
///
/// `1.234,56`, `1234,56`, `1234.56` and `R$ 10` are all accepted.
pub fn parse_cents(value: &str) -> Option<i64> {
    let cleaned: String = value
        .trim()
        .trim_start_matches("R$")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let normalized = if cleaned.contains(',') {
        cleaned.replace('.', "").replace(',', ".")
    } else {
        cleaned
    };

    let (negative, digits) = match normalized.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, normalized.as_str()),
    };
    let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let frac: String = frac.chars().chain("00".chars()).take(2).collect();
    let cents = whole.checked_mul(100)?.checked_add(frac.parse::<i64>().ok()?)?;
    Some(if negative { -cents } else { cents })
}

/// Format cents as `1234,56`.
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}{},{:02}", sign, abs / 100, abs % 100)
}

fn amount(fields: &Fields, key: &str) -> String {
    match fields.get(key).map(|v| clean(v)) {
        Some(v) if !v.is_empty() => v,
        _ => ZERO.to_string(),
    }
}

/// PIS + COFINS + CSLL; `0,00` when the sum does not fit.
fn csrf(fields: &Fields) -> String {
    let total = ["pis", "cofins", "csll"]
        .iter()
        .filter_map(|key| fields.get(*key).and_then(|v| parse_cents(v)))
        .try_fold(0i64, |acc, cents| acc.checked_add(cents));
    match total {
        Some(total) => format_cents(total),
        None => ZERO.to_string(),
    }
}

fn columns(fields: &Fields) -> Vec<String> {
    LAYOUT
        .iter()
        .map(|column| match column {
            Column::Field(key) => fields.get(*key).map(|v| clean(v)).unwrap_or_default(),
            Column::Amount(key) => amount(fields, key),
            Column::Literal(value) => (*value).to_string(),
            Column::Csrf => csrf(fields),
            Column::Blank => String::new(),
        })
        .collect()
}

/// Prefix shared by every per-tomador file.
pub const TOMADOS_FILE_PREFIX: &str = "TOMADOS";

const PRESTADOR_COLUMN: usize = 0;
const UF_COLUMN: usize = 2;
const NUMERO_COLUMN: usize = 5;
const CFOP_COLUMN: usize = 10;
const TOMADOR_COLUMN: usize = 27;

const CFOP_SAME_STATE: &str = "1933";
const CFOP_OTHER_STATE: &str = "2933";

const HEADER: [&str; 28] = [
    "CPF/CNPJ",
    "Razão Social",
    "UF",
    "Município",
    "Endereço",
    "Número Documento",
    "Série",
    "Data",
    "Situação (0- Regular / 2- Cancelada)",
    "Acumulador",
    "CFOP",
    "Valor Serviços",
    "Valor Descontos",
    "Valor Contábil",
    "Base de Calculo",
    "Alíquota ISS",
    "Valor ISS Normal",
    "Valor ISS Retido",
    "Valor IRRF",
    "Valor PIS",
    "Valor COFINS",
    "Valor CSLL",
    "Valo CRF",
    "Valor INSS",
    "Código do Item",
    "Quantidade",
    "Valor Unitário",
    "tomador",
];

/// One extracted invoice, ready for both ledgers.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    columns: Vec<String>,
    /// Invoiced company name, when the extractor reported it.
    tomador_name: String,
    /// Invoiced company state, when the extractor reported it.
    tomador_uf: String,
}

impl LedgerEntry {
    pub fn from_fields(fields: &Fields) -> Self {
        Self {
            columns: columns(fields),
            tomador_name: fields
                .get("razao_social_tomador")
                .map(|v| company_name(v))
                .unwrap_or_default(),
            tomador_uf: fields
                .get("uf_tomador")
                .map(|v| clean(v).to_uppercase())
                .unwrap_or_default(),
        }
    }

    /// The `GERAL.txt` row, without the trailing newline.
    pub fn row(&self) -> String {
        self.columns.join(";")
    }

    fn tomador_digits(&self) -> String {
        digits(&self.columns[TOMADOR_COLUMN])
    }
}

/// A `TOMADOS <razao> - <cnpj>.txt` file to write next to `GERAL.txt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TomadorFile {
    pub file_name: String,
    pub contents: String,
    pub rows: usize,
}

fn digits(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Letters, digits and spaces only, as the accounting import names files.
fn company_name(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Split ledger entries into one file per tomador.
///
/// Duplicate invoices (same prestador and document number) keep their first
/// occurrence. Files come out in order of each tomador's first invoice. The
/// CFOP column is 1933 when the prestador is in the tomador's state and 2933
/// otherwise, including when the tomador's state is unknown. Entries
/// without a tomador CNPJ are left out.
pub fn split_by_tomador(entries: &[LedgerEntry]) -> Vec<TomadorFile> {
    let mut seen = std::collections::HashSet::new();
    let mut groups: Vec<(String, Vec<&LedgerEntry>)> = Vec::new();

    for entry in entries {
        let key = (
            entry.columns[PRESTADOR_COLUMN].clone(),
            entry.columns[NUMERO_COLUMN].clone(),
        );
        if !seen.insert(key) {
            continue;
        }
        let tomador = entry.tomador_digits();
        if tomador.is_empty() {
            continue;
        }
        match groups.iter_mut().find(|(cnpj, _)| *cnpj == tomador) {
            Some((_, group)) => group.push(entry),
            None => groups.push((tomador, vec![entry])),
        }
    }

    groups
        .into_iter()
        .map(|(cnpj, group)| {
            let name = group
                .iter()
                .map(|e| e.tomador_name.as_str())
                .find(|n| !n.is_empty())
                .unwrap_or_default();
            let uf = group
                .iter()
                .map(|e| e.tomador_uf.as_str())
                .find(|u| !u.is_empty())
                .unwrap_or_default();

            let mut contents = HEADER.join(";");
            contents.push('\n');
            for entry in &group {
                let mut columns = entry.columns.clone();
                let same_state = !uf.is_empty() && columns[UF_COLUMN].eq_ignore_ascii_case(uf);
                columns[CFOP_COLUMN] = if same_state {
                    CFOP_SAME_STATE
                } else {
                    CFOP_OTHER_STATE
                }
                .to_string();
                contents.push_str(&columns.join(";"));
                contents.push('\n');
            }

            let file_name = if name.is_empty() {
                format!("{} {}.txt", TOMADOS_FILE_PREFIX, cnpj)
            } else {
                format!("{} {} - {}.txt", TOMADOS_FILE_PREFIX, name, cnpj)
            };
            TomadorFile {
                file_name,
                contents,
                rows: group.len(),
            }
        })
        .collect()
}

static RENAMED: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)-[0-9a-f]{6}\.pdf$").ok());

/// Whether a file name already carries the rename suffix.
pub fn is_renamed(file_name: &str) -> bool {
    RENAMED.as_ref().is_some_and(|re| re.is_match(file_name))
}

/// `<numero_nota> <razao_social>-<suffix>.pdf`, when both fields are present.
pub fn renamed_file_name(fields: &Fields, suffix: &str) -> Option<String> {
    let numero = fields.get("numero_nota").map(|v| sanitize_component(v))?;
    let razao = fields.get("razao_social").map(|v| sanitize_component(v))?;
    if numero.is_empty() || razao.is_empty() {
        return None;
    }
    Some(format!("{} {}-{}.pdf", numero, razao, suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_row_layout() {
        let f = fields(&[
            ("cnpj_prestador", "11.222.333/0001-44"),
            ("razao_social", "FORNECEDOR; LTDA"),
            ("numero_nota", "123"),
            ("data_emissao", "05/03/2025"),
            ("valor_total", "1.500,00"),
            ("pis", "9,75"),
            ("cofins", "45,00"),
            ("csll", "15,00"),
            ("cnpj_tomador", "55.666.777/0001-88"),
        ]);

        let row = LedgerEntry::from_fields(&f).row();
        let cols: Vec<&str> = row.split(';').collect();
        assert_eq!(cols.len(), 28);
        assert_eq!(cols[0], "11.222.333/0001-44");
        assert_eq!(cols[1], "FORNECEDOR  LTDA");
        assert_eq!(cols[5], "123");
        assert_eq!(cols[7], "05/03/2025");
        assert_eq!(cols[8], "0");
        assert_eq!(cols[11], "1.500,00");
        assert_eq!(cols[13], "1.500,00");
        assert_eq!(cols[18], "0,00");
        assert_eq!(cols[22], "69,75");
        assert_eq!(cols[23], "0,00");
        assert_eq!(cols[27], "55.666.777/0001-88");
    }

    #[test]
    fn test_parse_cents() {
        assert_eq!(parse_cents("1.234,56"), Some(123456));
        assert_eq!(parse_cents("1234.5"), Some(123450));
        assert_eq!(parse_cents("R$ 10"), Some(1000));
        assert_eq!(parse_cents("-0,01"), Some(-1));
        assert_eq!(parse_cents("abc"), None);
        assert_eq!(parse_cents(""), None);
        assert_eq!(format_cents(123456), "1234,56");
        assert_eq!(format_cents(-5), "-0,05");
    }

    #[test]
    fn test_rename() {
        let f = fields(&[("numero_nota", "123"), ("razao_social", "ACME/SA")]);
        let name = renamed_file_name(&f, "a1b2c3").unwrap();
        assert_eq!(name, "123 ACME_SA-a1b2c3.pdf");
        assert!(is_renamed(&name));
        assert!(!is_renamed("nfse 123.pdf"));
        assert!(renamed_file_name(&fields(&[("numero_nota", "1")]), "a1b2c3").is_none());
    }

    fn invoice(prestador: &str, numero: &str, uf: &str, tomador: &str) -> Fields {
        fields(&[
            ("cnpj_prestador", prestador),
            ("razao_social", "FORNECEDOR"),
            ("uf", uf),
            ("numero_nota", numero),
            ("valor_total", "100,00"),
            ("cnpj_tomador", tomador),
            ("razao_social_tomador", "PADARIA & CIA LTDA."),
            ("uf_tomador", "pr"),
        ])
    }

    #[test]
    fn test_split_by_tomador() {
        let entries: Vec<LedgerEntry> = [
            invoice("11.111.111/0001-11", "1", "PR", "23.880.273/0001-73"),
            invoice("22.222.222/0001-22", "7", "SP", "23.880.273/0001-73"),
            invoice("11.111.111/0001-11", "1", "PR", "23.880.273/0001-73"),
            invoice("33.333.333/0001-33", "9", "PR", "99.888.777/0001-66"),
            invoice("44.444.444/0001-44", "2", "PR", ""),
        ]
        .iter()
        .map(LedgerEntry::from_fields)
        .collect();

        let files = split_by_tomador(&entries);
        assert_eq!(files.len(), 2);

        let first = &files[0];
        assert_eq!(first.file_name, "TOMADOS PADARIA  CIA LTDA - 23880273000173.txt");
        assert_eq!(first.rows, 2);
        let lines: Vec<&str> = first.contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("CPF/CNPJ;Razão Social;UF;"));
        assert_eq!(lines[1].split(';').nth(10), Some("1933"));
        assert_eq!(lines[2].split(';').nth(10), Some("2933"));
        assert_eq!(lines[1].split(';').count(), 28);

        assert_eq!(files[1].file_name, "TOMADOS PADARIA  CIA LTDA - 99888777000166.txt");
        assert_eq!(files[1].rows, 1);

        // GERAL.txt rows leave the CFOP column empty.
        assert_eq!(entries[0].row().split(';').nth(10), Some(""));
    }

    #[test]
    fn test_split_without_tomador_name() {
        let f = fields(&[
            ("cnpj_prestador", "11.111.111/0001-11"),
            ("numero_nota", "5"),
            ("cnpj_tomador", "55.666.777/0001-88"),
        ]);
        let files = split_by_tomador(&[LedgerEntry::from_fields(&f)]);
        assert_eq!(files[0].file_name, "TOMADOS 55666777000188.txt");
        // Unknown tomador state never matches the prestador's.
        let row = files[0].contents.lines().nth(1).unwrap();
        assert_eq!(row.split(';').nth(10), Some("2933"));
    }

    #[test]
    fn test_csrf_overflow_falls_back_to_zero() {
        let huge = format!("{}", i64::MAX / 100);
        let f = fields(&[("pis", &huge), ("cofins", &huge), ("csll", "1,00")]);
        let cols: Vec<String> = LedgerEntry::from_fields(&f).row().split(';').map(str::to_string).collect();
        assert_eq!(cols[22], "0,00");
    }
}
