use serde::{Deserialize, Serialize};

use crate::ingest::PageRecord;
use crate::tokenizer::TokenCodec;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkConfig {
    pub chunk_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_tokens: 900,
            overlap_tokens: 100,
        }
    }
}

/// A token-bounded window of one document's text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    pub page_start: u32,
    pub page_end: u32,
    #[serde(default)]
    pub token_count: usize,
}

/// Token-aware chunker across page records.
///
/// Pages are tokenized once and poured into a fixed-capacity window. A full
/// window is emitted and the next one starts with the last `overlap_tokens`
/// tokens of the emitted chunk, so neighbours share context. Cuts and overlap
/// starts move to the nearest token that begins a whole character, so a chunk
/// may run a few tokens short of the window. Page numbers travel with every
/// token, which keeps `page_start`/`page_end` exact even when the overlap
/// reaches back into the previous page.
pub struct Chunker<C> {
    codec: C,
    config: ChunkConfig,
}

impl<C: TokenCodec> Chunker<C> {
    pub fn new(codec: C, config: ChunkConfig) -> Self {
        Self { codec, config }
    }

    pub fn config(&self) -> ChunkConfig {
        self.config
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn chunk_pages(&self, pages: &[PageRecord]) -> Vec<Chunk> {
        let chunk_tokens = self.config.chunk_tokens.max(1);
        let overlap_tokens = self.config.overlap_tokens.min(chunk_tokens - 1);
        let mut chunks = Vec::new();
        let mut window = Window::default();

        for record in pages {
            let text = record.text.trim();
            if text.is_empty() {
                continue;
            }
            let tokens = self.codec.encode(text);
            let mut consumed = 0usize;
            while consumed < tokens.len() {
                let space_left = chunk_tokens - window.len();
                let mut end = (consumed + space_left).min(tokens.len());
                if end < tokens.len() {
                    end = self.clean_cut(&tokens, consumed, end);
                }
                window.extend(record.page, &tokens[consumed..end]);
                consumed = end;
                if window.len() >= chunk_tokens || consumed < tokens.len() {
                    chunks.push(self.flush(&window));
                    window = window.tail(overlap_tokens, &self.codec);
                }
            }
        }

        if window.fresh > 0 {
            chunks.push(self.flush(&window));
        }
        chunks
    }

    // Latest cut in (consumed, end] that does not split a character. A window
    // too narrow to reach one keeps the raw cut.
    fn clean_cut(&self, tokens: &[usize], consumed: usize, end: usize) -> usize {
        (consumed + 1..=end)
            .rev()
            .find(|&cut| self.codec.starts_clean(tokens[cut]))
            .unwrap_or(end)
    }

    fn flush(&self, window: &Window) -> Chunk {
        let mut parts = Vec::new();
        let mut run: Vec<usize> = Vec::new();
        let mut run_page = None;
        for &(page, token) in &window.tokens {
            if run_page.is_some() && run_page != Some(page) {
                parts.push(self.codec.decode(&run));
                run.clear();
            }
            run_page = Some(page);
            run.push(token);
        }
        if !run.is_empty() {
            parts.push(self.codec.decode(&run));
        }
        let page_start = window.tokens.first().map(|(p, _)| *p).unwrap_or(0);
        let page_end = window.tokens.last().map(|(p, _)| *p).unwrap_or(page_start);
        Chunk {
            text: parts.join("\n"),
            page_start,
            page_end,
            token_count: window.len(),
        }
    }
}

#[derive(Default)]
struct Window {
    tokens: Vec<(u32, usize)>,
    // tokens not yet part of any emitted chunk
    fresh: usize,
}

impl Window {
    fn len(&self) -> usize {
        self.tokens.len()
    }

    fn extend(&mut self, page: u32, tokens: &[usize]) {
        self.tokens.extend(tokens.iter().map(|&t| (page, t)));
        self.fresh += tokens.len();
    }

    /// The last `overlap` tokens, shortened when needed so the carried text
    /// starts on a whole character. Page changes are always clean.
    fn tail<C: TokenCodec>(&self, overlap: usize, codec: &C) -> Window {
        let mut start = self.tokens.len().saturating_sub(overlap);
        while start > 0 && start < self.tokens.len() {
            let (page, token) = self.tokens[start];
            if self.tokens[start - 1].0 != page || codec.starts_clean(token) {
                break;
            }
            start += 1;
        }
        Window {
            tokens: self.tokens[start..].to_vec(),
            fresh: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CharCodec;

    impl TokenCodec for CharCodec {
        fn encode(&self, text: &str) -> Vec<usize> {
            text.chars().map(|c| c as usize).collect()
        }

        fn decode(&self, tokens: &[usize]) -> String {
            tokens
                .iter()
                .filter_map(|&t| char::from_u32(t as u32))
                .collect()
        }
    }

    fn page(page: u32, text: &str) -> PageRecord {
        PageRecord {
            page,
            text: text.to_string(),
            tables: Vec::new(),
        }
    }

    fn chunker(chunk_tokens: usize, overlap_tokens: usize) -> Chunker<CharCodec> {
        Chunker::new(
            CharCodec,
            ChunkConfig {
                chunk_tokens,
                overlap_tokens,
            },
        )
    }

    #[test]
    fn short_document_is_one_chunk() {
        let chunks = chunker(100, 10).chunk_pages(&[page(1, "alpha"), page(2, "beta")]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "alpha\nbeta");
        assert_eq!((chunks[0].page_start, chunks[0].page_end), (1, 2));
        assert_eq!(chunks[0].token_count, 9);
    }

    #[test]
    fn empty_pages_do_not_move_page_start() {
        let chunks = chunker(100, 10).chunk_pages(&[page(1, "   "), page(2, "body"), page(3, "")]);
        assert_eq!(chunks.len(), 1);
        assert_eq!((chunks[0].page_start, chunks[0].page_end), (2, 2));
    }

    #[test]
    fn windows_overlap_by_tail() {
        let chunks = chunker(4, 2).chunk_pages(&[page(1, "abcdefgh")]);
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["abcd", "cdef", "efgh"]);
    }

    #[test]
    fn exact_fit_emits_no_tail_only_chunk() {
        let chunks = chunker(4, 2).chunk_pages(&[page(1, "abcd")]);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn overlap_reaching_previous_page_keeps_its_page() {
        let chunks = chunker(4, 2).chunk_pages(&[page(1, "abc"), page(2, "defg")]);
        assert_eq!(chunks[0].text, "abc\nd");
        assert_eq!((chunks[0].page_start, chunks[0].page_end), (1, 2));
        assert_eq!(chunks[1].text, "c\ndef");
        assert_eq!((chunks[1].page_start, chunks[1].page_end), (1, 2));
        assert_eq!(chunks[2].text, "efg");
        assert_eq!((chunks[2].page_start, chunks[2].page_end), (2, 2));
    }

    #[test]
    fn bpe_cuts_never_split_characters() {
        let codec = crate::tokenizer::TokenizerKind::Cl100k.build().unwrap();
        let text = "Revenue rose \u{2014} \u{201c}Data Center\u{201d} grew \u{9f98}\u{1d509}\u{6570}\u{636e} again. "
            .repeat(12);
        let chunks = Chunker::new(
            codec,
            ChunkConfig {
                chunk_tokens: 37,
                overlap_tokens: 5,
            },
        )
        .chunk_pages(&[page(1, &text), page(2, &text)]);
        assert!(chunks.len() > 2);
        for chunk in &chunks {
            assert!(chunk.token_count <= 37);
            assert!(!chunk.text.contains('\u{FFFD}'), "split character in {:?}", chunk.text);
        }
        assert_eq!(chunks.last().unwrap().page_end, 2);
    }

    #[test]
    fn oversized_overlap_is_clamped() {
        let chunks = chunker(3, 10).chunk_pages(&[page(1, "abcdef")]);
        assert!(chunks.iter().all(|c| c.token_count <= 3));
        assert_eq!(chunks.last().unwrap().text, "def");
    }
}
