use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

const MONEY_TAIL: &str = r"(\$?[\d,\.]+)\s*(?:(billion|million|thousand|bn|m|k)\b)?";

/// Financial metrics the extractor knows how to read out of prose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricKey {
    #[serde(rename = "operating margin")]
    OperatingMargin,
    #[serde(rename = "gross margin")]
    GrossMargin,
    #[serde(rename = "cloud revenue")]
    CloudRevenue,
    #[serde(rename = "data center revenue")]
    DataCenterRevenue,
    #[serde(rename = "total revenue")]
    TotalRevenue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Percent,
    Money,
}

/// A parsed figure. Percentages are plain numbers (`42.5` for 42.5%), money is
/// an absolute amount after applying the magnitude suffix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub kind: ValueKind,
    pub value: f64,
}

struct MetricPattern {
    key: MetricKey,
    kind: ValueKind,
    regex: Regex,
}

static PATTERNS: Lazy<Vec<MetricPattern>> = Lazy::new(|| {
    let percent = |label: &str| format!(r"(?i){label}[^\d%]*([0-9]{{1,3}}(?:\.[0-9]+)?)\s*%");
    let money = |prefix: &str| format!(r"(?i){prefix}[^\$\d%]{{0,40}}{MONEY_TAIL}");
    vec![
        (MetricKey::OperatingMargin, ValueKind::Percent, percent("operating margin")),
        (MetricKey::GrossMargin, ValueKind::Percent, percent("gross margin")),
        (
            MetricKey::CloudRevenue,
            ValueKind::Money,
            money(r"(?:cloud|google cloud|microsoft cloud|azure|gcp)"),
        ),
        (MetricKey::DataCenterRevenue, ValueKind::Money, money(r"data\s*center")),
        (MetricKey::TotalRevenue, ValueKind::Money, money(r"total\s+revenue")),
    ]
    .into_iter()
    .map(|(key, kind, pattern)| MetricPattern {
        key,
        kind,
        regex: Regex::new(&pattern).expect("valid metric regex"),
    })
    .collect()
});

impl MetricKey {
    pub const ALL: [MetricKey; 5] = [
        MetricKey::OperatingMargin,
        MetricKey::GrossMargin,
        MetricKey::CloudRevenue,
        MetricKey::DataCenterRevenue,
        MetricKey::TotalRevenue,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            MetricKey::OperatingMargin => "operating margin",
            MetricKey::GrossMargin => "gross margin",
            MetricKey::CloudRevenue => "cloud revenue",
            MetricKey::DataCenterRevenue => "data center revenue",
            MetricKey::TotalRevenue => "total revenue",
        }
    }

    /// First metric whose label appears in the (lower-cased) query.
    pub fn infer(query: &str) -> Option<MetricKey> {
        let lower = query.to_lowercase();
        Self::ALL.into_iter().find(|key| lower.contains(key.label()))
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

fn unit_multiplier(unit: Option<&str>) -> f64 {
    match unit.map(|u| u.to_lowercase()).as_deref() {
        Some("billion") | Some("bn") => 1e9,
        Some("million") | Some("m") => 1e6,
        Some("thousand") | Some("k") => 1e3,
        _ => 1.0,
    }
}

/// `"$1.5", Some("billion")` -> `1.5e9`. Malformed literals yield `NaN`.
pub fn money_to_float(literal: &str, unit: Option<&str>) -> f64 {
    let digits = literal.replace(['$', ','], "");
    match digits.parse::<f64>() {
        Ok(value) => value * unit_multiplier(unit),
        Err(_) => f64::NAN,
    }
}

/// Looks for `key` in `text`. `None` means the passage does not state the
/// metric in a recognizable form; it is never an error.
pub fn find_metric_value(text: &str, key: MetricKey) -> Option<MetricValue> {
    let pattern = PATTERNS.iter().find(|p| p.key == key)?;
    let caps = pattern.regex.captures(text)?;
    let literal = caps.get(1)?.as_str();
    let value = match pattern.kind {
        ValueKind::Percent => literal.parse::<f64>().ok()?,
        ValueKind::Money => money_to_float(literal, caps.get(2).map(|m| m.as_str())),
    };
    if value.is_nan() {
        return None;
    }
    Some(MetricValue {
        kind: pattern.kind,
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_money_with_units() {
        assert_eq!(money_to_float("$1.5", Some("billion")), 1.5e9);
        assert_eq!(money_to_float("2,300", Some("million")), 2.3e9);
        assert_eq!(money_to_float("$750", Some("K")), 750_000.0);
        assert_eq!(money_to_float("12", None), 12.0);
        assert!(money_to_float("1.2.3", Some("bn")).is_nan());
        assert!(money_to_float("$", None).is_nan());
    }

    #[test]
    fn extracts_percent_case_insensitively() {
        let text = "Our OPERATING MARGIN was 42.3 % compared with 38% last year.";
        let value = find_metric_value(text, MetricKey::OperatingMargin).unwrap();
        assert_eq!(value.kind, ValueKind::Percent);
        assert_eq!(value.value, 42.3);
    }

    #[test]
    fn extracts_money_amounts() {
        let text = "Data Center revenue was a record $47.5 billion, up 217%.";
        let value = find_metric_value(text, MetricKey::DataCenterRevenue).unwrap();
        assert_eq!(value.kind, ValueKind::Money);
        assert_eq!(value.value, 47.5e9);

        let text = "Total revenue was $211,915 million";
        let value = find_metric_value(text, MetricKey::TotalRevenue).unwrap();
        assert_eq!(value.value, 211_915e6);
    }

    #[test]
    fn unit_must_be_a_whole_word() {
        let text = "Azure and other cloud services revenue grew $5 more than expected";
        let value = find_metric_value(text, MetricKey::CloudRevenue).unwrap();
        assert_eq!(value.value, 5.0);
    }

    #[test]
    fn absent_metric_is_none() {
        assert!(find_metric_value("Gross profit increased.", MetricKey::GrossMargin).is_none());
        assert!(find_metric_value("total revenue rose sharply.", MetricKey::TotalRevenue).is_none());
    }

    #[test]
    fn malformed_money_literal_is_none() {
        assert!(find_metric_value("Total revenue ... was strong", MetricKey::TotalRevenue).is_none());
    }

    #[test]
    fn infers_first_metric_mentioned() {
        assert_eq!(
            MetricKey::infer("NVIDIA Data Center Revenue 2023"),
            Some(MetricKey::DataCenterRevenue)
        );
        assert_eq!(
            MetricKey::infer("gross margin and operating margin"),
            Some(MetricKey::OperatingMargin)
        );
        assert_eq!(MetricKey::infer("AI mentions"), None);
    }

    #[test]
    fn serializes_with_labels() {
        let json = serde_json::to_string(&MetricKey::CloudRevenue).unwrap();
        assert_eq!(json, "\"cloud revenue\"");
        let value = MetricValue {
            kind: ValueKind::Percent,
            value: 12.0,
        };
        assert_eq!(
            serde_json::to_string(&value).unwrap(),
            r#"{"kind":"percent","value":12.0}"#
        );
    }
}
