use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::company::CompanyRegistry;

static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"([12][0-9]{3})").expect("valid regex"));
static HORIZONTAL_WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\t\r]").expect("valid regex"));
static NEWLINE_PAD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r" *\n *").expect("valid regex"));
static BLANK_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("valid regex"));
static SPACE_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r" {2,}").expect("valid regex"));
static HYPHEN_BREAK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\w+)-\n(\w+)").expect("valid regex"));

/// Reads `(ticker, year)` out of a filing name such as `MSFT_2023.pdf`.
///
/// The ticker must be followed by a year with no digits in between; failing
/// that, any alias anywhere in the name selects the company and the first
/// four-digit year (if any) is taken. Unparseable names give `(None, None)`.
pub fn parse_company_year_from_filename(
    path: impl AsRef<Path>,
    registry: &CompanyRegistry,
) -> (Option<String>, Option<String>) {
    let name = path
        .as_ref()
        .file_name()
        .map(|n| n.to_string_lossy().to_uppercase())
        .unwrap_or_default();
    if name.is_empty() || registry.is_empty() {
        return (None, None);
    }

    let alternation = registry
        .tickers()
        .map(|t| regex::escape(&t.to_uppercase()))
        .collect::<Vec<_>>()
        .join("|");
    if let Ok(re) = Regex::new(&format!(r"({alternation})[^\d]*([12][0-9]{{3}})")) {
        if let Some(caps) = re.captures(&name) {
            let ticker = registry
                .canonical(&caps[1])
                .map(str::to_string)
                .unwrap_or_else(|| caps[1].to_string());
            return (Some(ticker), Some(caps[2].to_string()));
        }
    }

    for company in registry.companies() {
        let hit = company
            .aliases
            .iter()
            .map(|a| a.to_uppercase())
            .chain(std::iter::once(company.ticker.to_uppercase()))
            .any(|alias| name.contains(&alias));
        if hit {
            let year = YEAR_RE.captures(&name).map(|c| c[1].to_string());
            return (Some(company.ticker.clone()), year);
        }
    }
    (None, None)
}

/// Normalizes extracted PDF text: compatibility forms folded (ligatures,
/// non-breaking spaces), tabs/CR to spaces, spaces around newlines removed,
/// at most one blank line in a row, single spaces.
pub fn clean_whitespace(text: &str) -> String {
    let folded = text.replace('\u{00a0}', " ").nfkc().collect::<String>();
    let text = HORIZONTAL_WS_RE.replace_all(&folded, " ");
    let text = NEWLINE_PAD_RE.replace_all(&text, "\n");
    let text = BLANK_RUN_RE.replace_all(&text, "\n\n");
    let text = SPACE_RUN_RE.replace_all(&text, " ");
    text.trim().to_string()
}

/// Joins words split across a line break: `oper-\nating` -> `operating`.
pub fn dehyphenate(text: &str) -> String {
    HYPHEN_BREAK_RE.replace_all(text, "$1$2").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(name: &str) -> (Option<String>, Option<String>) {
        parse_company_year_from_filename(name, &CompanyRegistry::default())
    }

    #[test]
    fn parses_ticker_and_year() {
        assert_eq!(parse("MSFT_2023.pdf"), (Some("MSFT".into()), Some("2023".into())));
        assert_eq!(
            parse("data/pdfs/googl_10k_2022.PDF"),
            (Some("GOOGL".into()), Some("2022".into()))
        );
        assert_eq!(
            parse("Alphabet-annual-2021.pdf"),
            (Some("GOOGL".into()), Some("2021".into()))
        );
        assert_eq!(parse("nvidia.pdf"), (Some("NVDA".into()), None));
        assert_eq!(parse("report.pdf"), (None, None));
    }

    #[test]
    fn cleans_pdf_whitespace() {
        let raw = "Revenue\u{00a0}grew \t  strongly  \n\n\n\n  in 2023\r";
        assert_eq!(clean_whitespace(raw), "Revenue grew strongly\n\nin 2023");
    }

    #[test]
    fn folds_ligatures() {
        assert_eq!(clean_whitespace("pro\u{FB01}t"), "profit");
    }

    #[test]
    fn joins_hyphenated_line_breaks() {
        assert_eq!(dehyphenate("oper-\nating margin"), "operating margin");
        assert_eq!(dehyphenate("long-term\nplans"), "long-term\nplans");
    }
}
