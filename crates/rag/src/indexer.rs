use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use glob::{glob_with, MatchOptions, Pattern};
use tracing::{info, warn};

use finrag_core::{persist_markdown, Chunker, CompanyRegistry, IngestedFiling, TokenCodec};

use crate::store::{ChunkMetadata, ChunkStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub filings: usize,
    pub pages: usize,
    pub chunks: usize,
}

#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub pdf_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    /// Reset the collection before indexing.
    pub rebuild: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// No PDFs were found; the store was left untouched.
    EmptyCorpus { pdf_dir: PathBuf },
    Indexed(IndexStats),
}

/// Chunks one ingested filing and stores it with its metadata.
pub fn index_filing<C: TokenCodec>(
    store: &ChunkStore,
    chunker: &Chunker<C>,
    filing: &IngestedFiling,
) -> Result<IndexStats> {
    let chunks = chunker.chunk_pages(&filing.pages);
    if chunks.is_empty() {
        warn!(
            target: "finrag::indexer",
            doc_id = %filing.doc_id,
            "filing produced no text; nothing indexed"
        );
    }
    let meta = ChunkMetadata {
        company: filing.company.clone(),
        year: filing.year.clone(),
        source_pdf: filing.source_pdf.display().to_string(),
    };
    let ids = store
        .add(&filing.doc_id, &chunks, &meta)
        .with_context(|| format!("failed to store chunks for {}", filing.doc_id))?;
    Ok(IndexStats {
        filings: 1,
        pages: filing.pages.len(),
        chunks: ids.len(),
    })
}

/// `*.pdf` directly inside `dir`, extension matched case-insensitively, sorted.
pub fn discover_pdfs(dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = format!("{}/*.pdf", Pattern::escape(&dir.to_string_lossy()));
    let options = MatchOptions {
        case_sensitive: false,
        ..MatchOptions::new()
    };
    let mut files = Vec::new();
    for entry in glob_with(&pattern, options)? {
        let path = entry?;
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub fn build_index<C: TokenCodec>(
    store: &ChunkStore,
    chunker: &Chunker<C>,
    registry: &CompanyRegistry,
    settings: &BuildSettings,
) -> Result<BuildOutcome> {
    let pdfs = discover_pdfs(&settings.pdf_dir)?;
    if pdfs.is_empty() {
        warn!(
            target: "finrag::indexer",
            pdf_dir = %settings.pdf_dir.display(),
            "no PDFs found; index left unchanged"
        );
        return Ok(BuildOutcome::EmptyCorpus {
            pdf_dir: settings.pdf_dir.clone(),
        });
    }
    if settings.rebuild {
        info!(target: "finrag::indexer", collection = store.collection(), "resetting collection");
        store.reset()?;
    }

    let mut totals = IndexStats::default();
    for pdf in &pdfs {
        let filing = persist_markdown(pdf, &settings.artifacts_dir, registry)
            .with_context(|| format!("failed to ingest {}", pdf.display()))?;
        let stats = index_filing(store, chunker, &filing)?;
        info!(
            target: "finrag::indexer",
            pdf = %pdf.display(),
            company = filing.company.as_deref().unwrap_or("-"),
            year = filing.year.as_deref().unwrap_or("-"),
            pages = stats.pages,
            chunks = stats.chunks,
            "filing indexed"
        );
        totals.filings += stats.filings;
        totals.pages += stats.pages;
        totals.chunks += stats.chunks;
    }
    info!(
        target: "finrag::indexer",
        filings = totals.filings,
        chunks = totals.chunks,
        total_in_store = store.count()?,
        "index build complete"
    );
    Ok(BuildOutcome::Indexed(totals))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingClient;
    use finrag_core::{pages_from_texts, write_filing, ChunkConfig, TokenizerKind};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn discovery_is_sorted_and_case_insensitive() {
        let dir = tempdir().unwrap();
        for name in ["b_2023.PDF", "a_2022.pdf", "notes.txt"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        fs::create_dir(dir.path().join("nested.pdf")).unwrap();
        let found = discover_pdfs(dir.path()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a_2022.pdf", "b_2023.PDF"]);
    }

    #[test]
    fn empty_corpus_leaves_store_alone() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(
            dir.path().join("s.sqlite"),
            "filings",
            EmbeddingClient::hash(32),
        )
        .unwrap();
        let chunker = Chunker::new(TokenizerKind::Cl100k.build().unwrap(), ChunkConfig::default());
        let filing = write_filing(
            &dir.path().join("MSFT_2023.pdf"),
            pages_from_texts(&["Operating margin was 42%."]),
            &dir.path().join("md"),
            &CompanyRegistry::default(),
        )
        .unwrap();
        index_filing(&store, &chunker, &filing).unwrap();

        let pdf_dir = dir.path().join("pdfs");
        fs::create_dir(&pdf_dir).unwrap();
        let outcome = build_index(
            &store,
            &chunker,
            &CompanyRegistry::default(),
            &BuildSettings {
                pdf_dir: pdf_dir.clone(),
                artifacts_dir: dir.path().join("md"),
                rebuild: true,
            },
        )
        .unwrap();
        assert_eq!(outcome, BuildOutcome::EmptyCorpus { pdf_dir });
        assert_eq!(store.count().unwrap(), 1);
    }
}
