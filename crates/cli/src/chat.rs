use std::fs;
use std::io::{BufRead, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use finrag_rag::{QueryError, QueryResponse};

/// One interactive exchange as written to the history file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub timestamp: String,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<QueryResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn is_exit(line: &str) -> bool {
    matches!(line.to_lowercase().as_str(), "exit" | "quit")
}

/// Reads questions until `exit`, `quit` or end of input. A failing question is
/// printed and recorded, and the session goes on.
pub fn run_chat<I, O, F>(input: I, mut output: O, mut ask: F) -> Result<Vec<ChatTurn>>
where
    I: BufRead,
    O: Write,
    F: FnMut(&str) -> std::result::Result<QueryResponse, QueryError>,
{
    let mut turns = Vec::new();
    let mut lines = input.lines();
    loop {
        write!(output, "> ")?;
        output.flush()?;
        let Some(line) = lines.next() else {
            writeln!(output)?;
            break;
        };
        let line = line?;
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        if is_exit(query) {
            break;
        }
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        match ask(query) {
            Ok(response) => {
                writeln!(output, "{}", format_response(&response))?;
                turns.push(ChatTurn {
                    timestamp,
                    query: query.to_string(),
                    response: Some(response),
                    error: None,
                });
            }
            Err(err) => {
                writeln!(output, "[error] {err}")?;
                turns.push(ChatTurn {
                    timestamp,
                    query: query.to_string(),
                    response: None,
                    error: Some(err.to_string()),
                });
            }
        }
    }
    Ok(turns)
}

pub fn format_response(response: &QueryResponse) -> String {
    let mut block = String::new();
    block.push_str(&format!("Q: {}\n", response.query));
    block.push_str(&format!(
        "A: {}\n",
        response.answer.as_deref().unwrap_or("(no answer)")
    ));
    if let Some(reasoning) = &response.reasoning {
        block.push_str(&format!("Reasoning: {reasoning}\n"));
    }
    block.push_str(&format!("Intent: {}\n", response.intent));
    block.push_str("Sub-queries:\n");
    for sub_query in &response.sub_queries {
        block.push_str(&format!("  - {sub_query}\n"));
    }
    block.push_str("Sources:\n");
    if response.sources.is_empty() {
        block.push_str("  (none)\n");
    }
    for (idx, source) in response.sources.iter().enumerate() {
        block.push_str(&format!(
            "  [{}] {} {} p.{}\n",
            idx + 1,
            source.company.as_deref().unwrap_or("?"),
            source.year.as_deref().unwrap_or("?"),
            source
                .page
                .map(|p| p.to_string())
                .unwrap_or_else(|| "?".to_string()),
        ));
    }
    block.push_str(&"-".repeat(60));
    block
}

pub fn write_history(path: &Path, turns: &[ChatTurn]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(turns)?;
    fs::write(path, json).with_context(|| format!("failed to write history {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use finrag_rag::{Intent, Source};
    use std::io::Cursor;
    use tempfile::tempdir;

    fn canned(query: &str) -> QueryResponse {
        QueryResponse {
            query: query.to_string(),
            answer: Some("Microsoft: 42%".to_string()),
            reasoning: Some("quoted".to_string()),
            intent: Intent::DirectMetric,
            sub_queries: vec!["Microsoft operating margin 2023".to_string()],
            sources: vec![Source {
                company: Some("MSFT".to_string()),
                year: Some("2023".to_string()),
                excerpt: "Operating margin was 42%.".to_string(),
                page: Some(37),
            }],
        }
    }

    #[test]
    fn loop_skips_blanks_and_stops_on_exit() {
        let input = Cursor::new("\n   \nmargin?\nboom\nQUIT\nnever asked\n");
        let mut out = Vec::new();
        let turns = run_chat(input, &mut out, |q| {
            if q == "boom" {
                Err(QueryError::LlmUnavailable("offline".to_string()))
            } else {
                Ok(canned(q))
            }
        })
        .unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].query, "margin?");
        assert!(turns[0].response.is_some());
        assert!(turns[1].error.as_deref().unwrap().contains("offline"));
        let printed = String::from_utf8(out).unwrap();
        assert!(printed.contains("MSFT 2023 p.37"));
        assert!(printed.contains("[error]"));
    }

    #[test]
    fn eof_ends_session() {
        let turns = run_chat(Cursor::new("one"), Vec::new(), |q| Ok(canned(q))).unwrap();
        assert_eq!(turns.len(), 1);
    }

    #[test]
    fn history_is_a_json_array() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out").join("chat_history.json");
        let turns = vec![
            ChatTurn {
                timestamp: "2024-05-01T10:00:00Z".to_string(),
                query: "margin?".to_string(),
                response: Some(canned("margin?")),
                error: None,
            },
            ChatTurn {
                timestamp: "2024-05-01T10:01:00Z".to_string(),
                query: "boom".to_string(),
                response: None,
                error: Some("llm not available".to_string()),
            },
        ];
        write_history(&path, &turns).unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let items = raw.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["response"]["sources"][0]["page"], 37);
        assert!(items[0].get("error").is_none());
        assert!(items[1].get("response").is_none());
        let back: Vec<ChatTurn> = serde_json::from_value(raw).unwrap();
        assert_eq!(back, turns);
    }
}
