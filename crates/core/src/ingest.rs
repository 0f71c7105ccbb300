use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::company::CompanyRegistry;
use crate::error::{FilingError, Result};
use crate::parser::{clean_whitespace, dehyphenate, parse_company_year_from_filename};

static COLUMN_GAP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\t+| {2,}").expect("valid regex"));
static NUMERIC_CELL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\(?[-\u{2212}]?\$?\s?\d[\d,]*(?:\.\d+)?\s?%?\)?$").expect("valid regex")
});

/// One PDF page: prose followed by its tables rendered as markdown.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageRecord {
    /// 1-based page number.
    pub page: u32,
    pub text: String,
    #[serde(default)]
    pub tables: Vec<String>,
}

/// A filing after ingestion, ready to be chunked.
#[derive(Debug, Clone)]
pub struct IngestedFiling {
    pub doc_id: String,
    pub source_pdf: PathBuf,
    pub markdown_path: PathBuf,
    pub company: Option<String>,
    pub year: Option<String>,
    pub pages: Vec<PageRecord>,
}

/// Extracts page-indexed text from a PDF. Pages without extractable text come
/// back as empty records rather than errors.
pub fn extract_pdf_pages(path: &Path) -> Result<Vec<PageRecord>> {
    let is_pdf = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("pdf"))
        .unwrap_or(false);
    if !is_pdf {
        return Err(FilingError::UnsupportedInput(path.to_path_buf()));
    }
    let raw_pages =
        pdf_extract::extract_text_by_pages(path).map_err(|e| FilingError::PdfExtract {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    Ok(pages_from_texts(&raw_pages))
}

pub fn pages_from_texts<S: AsRef<str>>(raw_pages: &[S]) -> Vec<PageRecord> {
    raw_pages
        .iter()
        .enumerate()
        .map(|(idx, raw)| build_page(idx as u32 + 1, raw.as_ref()))
        .collect()
}

/// Cleans one page of raw text and inlines any detected tables after the prose
/// under `**Table p{page}_{n}**` headings.
pub fn build_page(page: u32, raw: &str) -> PageRecord {
    let (prose, tables) = split_tables(raw);
    let text = dehyphenate(&clean_whitespace(&prose));
    let tables: Vec<String> = tables
        .iter()
        .map(|rows| table_to_markdown(rows))
        .filter(|md| !md.trim().is_empty())
        .collect();

    let mut combined = text;
    for (idx, md) in tables.iter().enumerate() {
        combined.push_str(&format!("\n\n**Table p{}_{}**\n\n{}\n", page, idx + 1, md));
    }
    tracing::debug!(page, tables = tables.len(), chars = combined.len(), "page extracted");
    PageRecord {
        page,
        text: combined,
        tables,
    }
}

/// Renders rows as a GitHub markdown table. The first row with any content is
/// the header; rows are padded to a common width. All-empty input renders to
/// an empty string.
pub fn table_to_markdown(rows: &[Vec<String>]) -> String {
    let mut cleaned = rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|cell| cell.trim().replace('|', "\\|"))
                .collect::<Vec<_>>()
        })
        .filter(|row| row.iter().any(|cell| !cell.is_empty()));
    let Some(header) = cleaned.next() else {
        return String::new();
    };
    let body: Vec<Vec<String>> = cleaned.collect();
    let width = body
        .iter()
        .map(Vec::len)
        .chain(std::iter::once(header.len()))
        .max()
        .unwrap_or(1);
    let pad = |mut row: Vec<String>| {
        row.resize(width, String::new());
        row
    };

    let mut lines = Vec::with_capacity(body.len() + 2);
    lines.push(format!("| {} |", pad(header).join(" | ")));
    lines.push(format!("| {} |", vec!["---"; width].join(" | ")));
    for row in body {
        lines.push(format!("| {} |", pad(row).join(" | ")));
    }
    lines.join("\n")
}

/// Markdown artifact for a whole filing, one `# [Page N]` section per page.
pub fn render_markdown(pages: &[PageRecord]) -> String {
    pages
        .iter()
        .map(|p| format!("\n\n# [Page {}]\n\n{}", p.page, p.text))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Extracts a PDF, writes `<out_dir>/<stem>.md` and tags the filing with the
/// company/year parsed from its file name.
pub fn persist_markdown(
    pdf_path: &Path,
    out_dir: &Path,
    registry: &CompanyRegistry,
) -> Result<IngestedFiling> {
    let pages = extract_pdf_pages(pdf_path)?;
    write_filing(pdf_path, pages, out_dir, registry)
}

pub fn write_filing(
    pdf_path: &Path,
    pages: Vec<PageRecord>,
    out_dir: &Path,
    registry: &CompanyRegistry,
) -> Result<IngestedFiling> {
    fs::create_dir_all(out_dir)?;
    let doc_id = pdf_path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
        .ok_or_else(|| FilingError::UnsupportedInput(pdf_path.to_path_buf()))?;
    let markdown_path = out_dir.join(format!("{doc_id}.md"));
    fs::write(&markdown_path, render_markdown(&pages))?;
    let (company, year) = parse_company_year_from_filename(pdf_path, registry);
    Ok(IngestedFiling {
        doc_id,
        source_pdf: pdf_path.to_path_buf(),
        markdown_path,
        company,
        year,
        pages,
    })
}

fn split_columns(line: &str) -> Vec<String> {
    COLUMN_GAP_RE
        .split(line.trim())
        .map(|cell| cell.trim().to_string())
        .collect()
}

fn is_numeric_cell(cell: &str) -> bool {
    NUMERIC_CELL_RE.is_match(cell)
}

// A table is a run of at least two consecutive lines that split into two or
// more columns on wide gaps, one of them with three or more. Column counts may
// differ by one at most, and every row after the header needs a numeric cell;
// justified prose has wide gaps too but fails both.
fn looks_like_table(rows: &[Vec<String>]) -> bool {
    let widest = rows.iter().map(Vec::len).max().unwrap_or(0);
    let narrowest = rows.iter().map(Vec::len).min().unwrap_or(0);
    rows.len() >= 2
        && widest >= 3
        && widest - narrowest <= 1
        && rows[1..]
            .iter()
            .all(|cols| cols.iter().any(|cell| is_numeric_cell(cell)))
}

fn split_tables(raw: &str) -> (String, Vec<Vec<Vec<String>>>) {
    let mut prose = Vec::new();
    let mut tables = Vec::new();
    let mut block: Vec<(&str, Vec<String>)> = Vec::new();

    let mut close_block = |block: &mut Vec<(&str, Vec<String>)>, prose: &mut Vec<String>| {
        let rows: Vec<Vec<String>> = block.iter().map(|(_, cols)| cols.clone()).collect();
        if looks_like_table(&rows) {
            tables.push(block.drain(..).map(|(_, cols)| cols).collect());
        } else {
            prose.extend(block.drain(..).map(|(line, _)| line.to_string()));
        }
    };

    for line in raw.lines() {
        let columns = split_columns(line);
        if !line.trim().is_empty() && columns.len() >= 2 {
            block.push((line, columns));
            continue;
        }
        close_block(&mut block, &mut prose);
        prose.push(line.to_string());
    }
    close_block(&mut block, &mut prose);
    (prose.join("\n"), tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn rows(data: &[&[&str]]) -> Vec<Vec<String>> {
        data.iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    #[test]
    fn renders_padded_markdown_table() {
        let md = table_to_markdown(&rows(&[
            &["", ""],
            &["Segment", "2023", "2022"],
            &["Cloud", "33.1"],
        ]));
        assert_eq!(
            md,
            "| Segment | 2023 | 2022 |\n| --- | --- | --- |\n| Cloud | 33.1 |  |"
        );
        assert_eq!(table_to_markdown(&rows(&[&["", " "]])), "");
    }

    #[test]
    fn inlines_detected_tables_after_prose() {
        let raw = "Results of Oper-\nations\nSegment    2023    2022\nCloud    33.1    26.3\nMore prose.";
        let page = build_page(4, raw);
        assert_eq!(page.tables.len(), 1);
        assert!(page.text.starts_with("Results of Operations\nMore prose."));
        assert!(page.text.contains("**Table p4_1**"));
        assert!(page.text.contains("| Cloud | 33.1 | 26.3 |"));
    }

    #[test]
    fn two_column_lines_alone_stay_prose() {
        let (prose, tables) = split_tables("Name    Value\nOther    Thing");
        assert!(tables.is_empty());
        assert_eq!(prose, "Name    Value\nOther    Thing");
    }

    #[test]
    fn justified_prose_is_not_a_table() {
        let raw = "Revenue  increased  due to  growth in\nAzure  and other  cloud services  offset by\nlower  device sales.";
        let page = build_page(1, raw);
        assert!(page.tables.is_empty());
        assert_eq!(
            page.text,
            "Revenue increased due to growth in\nAzure and other cloud services offset by\nlower device sales."
        );
    }

    #[test]
    fn table_rows_need_numbers_and_matching_widths() {
        assert!(is_numeric_cell("$1,234.5"));
        assert!(is_numeric_cell("(12.0)"));
        assert!(is_numeric_cell("42 %"));
        assert!(!is_numeric_cell("FY2023 total"));
        let (_, tables) = split_tables("Segment    2023    2022\nCloud    33.1\nDevices    (1.2)    4.0");
        assert_eq!(tables.len(), 1);
        let (_, tables) = split_tables("Segment    2023    2022    2021    2020\nCloud    33.1");
        assert!(tables.is_empty());
    }

    #[test]
    fn writes_markdown_artifact() {
        let dir = tempdir().unwrap();
        let pages = pages_from_texts(&["first page", "", "third page"]);
        let filing = write_filing(
            Path::new("data/pdfs/NVDA_2023.pdf"),
            pages,
            dir.path(),
            &CompanyRegistry::default(),
        )
        .unwrap();
        assert_eq!(filing.doc_id, "NVDA_2023");
        assert_eq!(filing.company.as_deref(), Some("NVDA"));
        assert_eq!(filing.year.as_deref(), Some("2023"));
        let md = fs::read_to_string(&filing.markdown_path).unwrap();
        assert!(md.starts_with("# [Page 1]\n\nfirst page"));
        assert!(md.contains("# [Page 3]\n\nthird page"));
    }

    #[test]
    fn rejects_non_pdf_inputs() {
        let err = extract_pdf_pages(Path::new("notes.txt")).unwrap_err();
        assert!(matches!(err, FilingError::UnsupportedInput(_)));
    }
}
