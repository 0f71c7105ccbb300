use serde::{Deserialize, Serialize};

/// A company known to the corpus, identified by its ticker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Company {
    pub ticker: String,
    pub name: String,
    /// Lower-case spellings that refer to this company in free text.
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl Company {
    pub fn new(ticker: &str, name: &str, aliases: &[&str]) -> Self {
        Self {
            ticker: ticker.to_string(),
            name: name.to_string(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Aliases plus the ticker itself, lower-cased.
    fn spellings(&self) -> impl Iterator<Item = String> + '_ {
        self.aliases
            .iter()
            .map(|alias| alias.to_lowercase())
            .chain(std::iter::once(self.ticker.to_lowercase()))
    }
}

/// Ordered set of companies; order decides which company wins when a text
/// mentions several.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompanyRegistry {
    companies: Vec<Company>,
}

impl Default for CompanyRegistry {
    fn default() -> Self {
        Self {
            companies: vec![
                Company::new("GOOGL", "Google", &["google", "googl", "alphabet"]),
                Company::new("MSFT", "Microsoft", &["microsoft", "msft"]),
                Company::new("NVDA", "NVIDIA", &["nvidia", "nvda"]),
            ],
        }
    }
}

impl CompanyRegistry {
    pub fn new(companies: Vec<Company>) -> Self {
        Self { companies }
    }

    pub fn companies(&self) -> &[Company] {
        &self.companies
    }

    pub fn tickers(&self) -> impl Iterator<Item = &str> {
        self.companies.iter().map(|c| c.ticker.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.companies.is_empty()
    }

    /// First company (registry order) with an alias occurring in `text`.
    pub fn match_company(&self, text: &str) -> Option<&Company> {
        let lower = text.to_lowercase();
        self.companies
            .iter()
            .find(|company| company.spellings().any(|s| lower.contains(&s)))
    }

    /// Maps a ticker or alias to the canonical ticker.
    pub fn canonical(&self, name: &str) -> Option<&str> {
        let lower = name.trim().to_lowercase();
        self.companies
            .iter()
            .find(|company| company.spellings().any(|s| s == lower))
            .map(|company| company.ticker.as_str())
    }

    /// "Google, Microsoft, NVIDIA" style listing for prompts.
    pub fn display_names(&self) -> String {
        self.companies
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}
