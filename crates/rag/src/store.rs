use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use bytemuck::{allocation::pod_collect_to_vec, cast_slice};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;

use finrag_core::Chunk;

use crate::embedding::EmbeddingClient;

/// Metadata columns that retrieval can filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterField {
    Company,
    Year,
}

impl FilterField {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterField::Company => "company",
            FilterField::Year => "year",
        }
    }

    fn column(&self) -> &'static str {
        match self {
            FilterField::Company => "chunks.company",
            FilterField::Year => "chunks.year",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetadataFilter {
    Eq(FilterField, String),
    In(FilterField, Vec<String>),
    And(Vec<MetadataFilter>),
}

impl MetadataFilter {
    /// SQL fragment with anonymous placeholders plus the values bound to them.
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        match self {
            MetadataFilter::Eq(field, value) => (
                format!("{} = ?", field.column()),
                vec![Value::Text(value.clone())],
            ),
            MetadataFilter::In(field, values) => {
                let marks = vec!["?"; values.len()].join(", ");
                (
                    format!("{} IN ({marks})", field.column()),
                    values.iter().cloned().map(Value::Text).collect(),
                )
            }
            MetadataFilter::And(parts) => {
                let mut clauses = Vec::with_capacity(parts.len());
                let mut values = Vec::new();
                for part in parts {
                    let (clause, mut bound) = part.to_sql();
                    clauses.push(format!("({clause})"));
                    values.append(&mut bound);
                }
                (clauses.join(" AND "), values)
            }
        }
    }

    /// The where-document shape used by vector stores such as Chroma; handy for
    /// logging a filter the same way it is described to users.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            MetadataFilter::Eq(field, value) => json!({ field.as_str(): value }),
            MetadataFilter::In(field, values) => json!({ field.as_str(): { "$in": values } }),
            MetadataFilter::And(parts) => {
                let inner: Vec<_> = parts.iter().map(MetadataFilter::to_json).collect();
                json!({ "$and": inner })
            }
        }
    }
}

fn field_filter(field: FilterField, values: &[String]) -> Option<MetadataFilter> {
    match values {
        [] => None,
        [single] => Some(MetadataFilter::Eq(field, single.clone())),
        many => Some(MetadataFilter::In(field, many.to_vec())),
    }
}

/// One value matches by equality, several by membership, and a company
/// constraint combined with a year constraint requires both.
pub fn build_filter(companies: &[String], years: &[String]) -> Option<MetadataFilter> {
    match (
        field_filter(FilterField::Company, companies),
        field_filter(FilterField::Year, years),
    ) {
        (Some(company), Some(year)) => Some(MetadataFilter::And(vec![company, year])),
        (Some(only), None) | (None, Some(only)) => Some(only),
        (None, None) => None,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChunkMetadata {
    pub company: Option<String>,
    pub year: Option<String>,
    pub source_pdf: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalHit {
    pub id: String,
    pub doc_id: String,
    pub text: String,
    pub company: Option<String>,
    pub year: Option<String>,
    pub source_pdf: String,
    pub page_start: u32,
    pub page_end: u32,
    /// Cosine distance; smaller is closer.
    pub distance: f32,
}

pub trait Retriever {
    fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<RetrievalHit>>;
}

#[derive(Clone)]
pub struct ChunkStore {
    path: PathBuf,
    collection: String,
    embedder: EmbeddingClient,
}

impl ChunkStore {
    pub fn open<P: AsRef<Path>>(
        path: P,
        collection: impl Into<String>,
        embedder: EmbeddingClient,
    ) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            collection: collection.into(),
            embedder,
        };
        store.init()?;
        store.ensure_collection()?;
        Ok(store)
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn embedder(&self) -> &EmbeddingClient {
        &self.embedder
    }

    fn connection(&self) -> Result<Connection> {
        Connection::open(&self.path)
            .with_context(|| format!("failed to open store {}", self.path.display()))
    }

    fn init(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS collections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                dimensions INTEGER,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                collection_id INTEGER NOT NULL,
                doc_id TEXT NOT NULL,
                company TEXT,
                year TEXT,
                source_pdf TEXT NOT NULL,
                page_start INTEGER NOT NULL,
                page_end INTEGER NOT NULL,
                text TEXT NOT NULL,
                embedding BLOB NOT NULL,
                FOREIGN KEY(collection_id) REFERENCES collections(id)
            );
            CREATE INDEX IF NOT EXISTS idx_chunks_collection ON chunks(collection_id);
            CREATE INDEX IF NOT EXISTS idx_chunks_company_year ON chunks(company, year);
            "#,
        )?;
        Ok(())
    }

    fn ensure_collection(&self) -> Result<i64> {
        let conn = self.connection()?;
        if let Some(id) = collection_id(&conn, &self.collection)? {
            return Ok(id);
        }
        conn.execute(
            "INSERT INTO collections (name) VALUES (?1)",
            params![self.collection],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Embeds and stores `chunks` in one transaction. Ids are
    /// `{doc_id}:{position}:{8 hex}`; re-adding a filing gets fresh ids.
    pub fn add(&self, doc_id: &str, chunks: &[Chunk], meta: &ChunkMetadata) -> Result<Vec<String>> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embedder.embed_passages(&texts)?;
        let dims = embeddings.first().map(Vec::len).unwrap_or_default();
        if embeddings.iter().any(|e| e.len() != dims) {
            return Err(anyhow!("embedding backend returned ragged vectors"));
        }

        let collection_id = self.ensure_collection()?;
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let stored: Option<i64> = tx.query_row(
            "SELECT dimensions FROM collections WHERE id = ?1",
            [collection_id],
            |row| row.get(0),
        )?;
        match stored {
            Some(existing) if existing as usize != dims => {
                return Err(anyhow!(
                    "collection {} holds {existing}-d embeddings but {} produced {dims}-d",
                    self.collection,
                    self.embedder.label()
                ));
            }
            Some(_) => {}
            None => {
                tx.execute(
                    "UPDATE collections SET dimensions = ?1 WHERE id = ?2",
                    params![dims as i64, collection_id],
                )?;
            }
        }

        let mut ids = Vec::with_capacity(chunks.len());
        for (idx, (chunk, embedding)) in chunks.iter().zip(&embeddings).enumerate() {
            let id = format!("{doc_id}:{idx}:{:08x}", rand::random::<u32>());
            tx.execute(
                "INSERT INTO chunks (id, collection_id, doc_id, company, year, source_pdf, page_start, page_end, text, embedding) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    id,
                    collection_id,
                    doc_id,
                    meta.company,
                    meta.year,
                    meta.source_pdf,
                    chunk.page_start,
                    chunk.page_end,
                    chunk.text,
                    cast_slice::<f32, u8>(embedding),
                ],
            )?;
            ids.push(id);
        }
        tx.commit()?;
        Ok(ids)
    }

    pub fn query(
        &self,
        text: &str,
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<RetrievalHit>> {
        let embedding = self.embedder.embed_query(text)?;
        self.search_embedding(&embedding, top_k, filter)
    }

    pub fn search_embedding(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<RetrievalHit>> {
        let conn = self.connection()?;
        let mut sql = String::from(
            r#"
            SELECT chunks.id, chunks.doc_id, chunks.text, chunks.company, chunks.year,
                   chunks.source_pdf, chunks.page_start, chunks.page_end, chunks.embedding
            FROM chunks
            JOIN collections ON chunks.collection_id = collections.id
            WHERE collections.name = ?
            "#,
        );
        let mut bound = vec![Value::Text(self.collection.clone())];
        if let Some(filter) = filter {
            let (clause, mut values) = filter.to_sql();
            sql.push_str(&format!(" AND ({clause})"));
            bound.append(&mut values);
        }

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bound))?;
        let mut hits = Vec::new();
        while let Some(row) = rows.next()? {
            let blob: Vec<u8> = row.get(8)?;
            if blob.len() % std::mem::size_of::<f32>() != 0 {
                return Err(anyhow!("invalid embedding blob for chunk"));
            }
            let embedding: Vec<f32> = pod_collect_to_vec(blob.as_slice());
            if embedding.len() != query_embedding.len() {
                return Err(anyhow!(
                    "query embedding has {} dimensions but collection {} stores {}",
                    query_embedding.len(),
                    self.collection,
                    embedding.len()
                ));
            }
            hits.push(RetrievalHit {
                id: row.get(0)?,
                doc_id: row.get(1)?,
                text: row.get(2)?,
                company: row.get(3)?,
                year: row.get(4)?,
                source_pdf: row.get(5)?,
                page_start: row.get(6)?,
                page_end: row.get(7)?,
                distance: 1.0 - cosine_similarity(query_embedding, &embedding),
            });
        }
        hits.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.connection()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chunks JOIN collections ON chunks.collection_id = collections.id WHERE collections.name = ?1",
            [&self.collection],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Drops every chunk in the collection and recreates it empty.
    pub fn reset(&self) -> Result<()> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        if let Some(id) = collection_id(&tx, &self.collection)? {
            tx.execute("DELETE FROM chunks WHERE collection_id = ?1", [id])?;
            tx.execute("DELETE FROM collections WHERE id = ?1", [id])?;
        }
        tx.execute(
            "INSERT INTO collections (name) VALUES (?1)",
            params![self.collection],
        )?;
        tx.commit()?;
        Ok(())
    }
}

impl Retriever for ChunkStore {
    fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<RetrievalHit>> {
        self.query(query, top_k, filter)
    }
}

fn collection_id(conn: &Connection, name: &str) -> Result<Option<i64>> {
    Ok(conn
        .query_row("SELECT id FROM collections WHERE name = ?1", [name], |row| {
            row.get(0)
        })
        .optional()?)
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut a_norm = 0.0f32;
    let mut b_norm = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        a_norm += x * x;
        b_norm += y * y;
    }
    if a_norm == 0.0 || b_norm == 0.0 {
        return 0.0;
    }
    dot / (a_norm.sqrt() * b_norm.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn chunk(text: &str, page: u32) -> Chunk {
        Chunk {
            text: text.to_string(),
            page_start: page,
            page_end: page,
            token_count: text.len(),
        }
    }

    fn meta(company: &str, year: &str) -> ChunkMetadata {
        ChunkMetadata {
            company: Some(company.to_string()),
            year: Some(year.to_string()),
            source_pdf: format!("data/pdfs/{company}_{year}.pdf"),
        }
    }

    #[test]
    fn filter_shapes() {
        let s = |v: &[&str]| v.iter().map(|x| x.to_string()).collect::<Vec<_>>();
        assert_eq!(build_filter(&[], &[]), None);
        assert_eq!(
            build_filter(&s(&["MSFT"]), &[]).unwrap().to_json(),
            json!({"company": "MSFT"})
        );
        assert_eq!(
            build_filter(&s(&["MSFT", "GOOGL"]), &[]).unwrap().to_json(),
            json!({"company": {"$in": ["MSFT", "GOOGL"]}})
        );
        assert_eq!(
            build_filter(&s(&["NVDA"]), &s(&["2022", "2023"])).unwrap().to_json(),
            json!({"$and": [{"company": "NVDA"}, {"year": {"$in": ["2022", "2023"]}}]})
        );
        let (clause, values) = build_filter(&s(&["NVDA"]), &s(&["2023"])).unwrap().to_sql();
        assert_eq!(clause, "(chunks.company = ?) AND (chunks.year = ?)");
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn add_query_and_filter() {
        let dir = tempdir().unwrap();
        let store =
            ChunkStore::open(dir.path().join("s.sqlite"), "filings", EmbeddingClient::hash(128))
                .unwrap();
        let ids = store
            .add(
                "MSFT_2023",
                &[chunk("operating margin was 42%", 3), chunk("cloud revenue grew", 4)],
                &meta("MSFT", "2023"),
            )
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids[0].starts_with("MSFT_2023:0:"));
        assert_eq!(ids[0].rsplit(':').next().unwrap().len(), 8);
        store
            .add("NVDA_2023", &[chunk("operating margin was 54%", 7)], &meta("NVDA", "2023"))
            .unwrap();
        assert_eq!(store.count().unwrap(), 3);

        let all = store.query("operating margin", 10, None).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].distance <= w[1].distance));

        let filter = build_filter(&["NVDA".to_string()], &[]).unwrap();
        let hits = store.query("operating margin", 10, Some(&filter)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].company.as_deref(), Some("NVDA"));
        assert_eq!(hits[0].page_start, 7);

        let missing = build_filter(&["GOOGL".to_string()], &[]).unwrap();
        assert!(store.query("operating margin", 10, Some(&missing)).unwrap().is_empty());
    }

    #[test]
    fn dimension_mismatch_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.sqlite");
        let small = ChunkStore::open(&path, "filings", EmbeddingClient::hash(32)).unwrap();
        small
            .add("a", &[chunk("revenue", 1)], &meta("MSFT", "2023"))
            .unwrap();
        let large = ChunkStore::open(&path, "filings", EmbeddingClient::hash(64)).unwrap();
        assert!(large.add("b", &[chunk("revenue", 1)], &meta("MSFT", "2023")).is_err());
        assert!(large.query("revenue", 5, None).is_err());
    }

    #[test]
    fn reset_empties_collection() {
        let dir = tempdir().unwrap();
        let store =
            ChunkStore::open(dir.path().join("s.sqlite"), "filings", EmbeddingClient::hash(32))
                .unwrap();
        store.add("a", &[chunk("revenue", 1)], &meta("MSFT", "2023")).unwrap();
        store.reset().unwrap();
        assert_eq!(store.count().unwrap(), 0);
        store.add("a", &[chunk("revenue", 1)], &meta("MSFT", "2023")).unwrap();
        assert_eq!(store.count().unwrap(), 1);
    }
}
