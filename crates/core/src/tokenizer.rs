use std::str::FromStr;

use tiktoken_rs::CoreBPE;

use crate::error::{FilingError, Result};

/// Splits text into model units and back. The chunker only needs these two
/// operations, so tests can swap in a trivial codec.
pub trait TokenCodec {
    fn encode(&self, text: &str) -> Vec<usize>;
    fn decode(&self, tokens: &[usize]) -> String;

    /// False when `token` begins in the middle of a multi-byte character, so a
    /// slice starting there would decode to garbage.
    fn starts_clean(&self, _token: usize) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizerKind {
    Cl100k,
    O200k,
    P50k,
}

impl TokenizerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenizerKind::Cl100k => "cl100k_base",
            TokenizerKind::O200k => "o200k_base",
            TokenizerKind::P50k => "p50k_base",
        }
    }

    pub fn build(&self) -> Result<BpeCodec> {
        let bpe = match self {
            TokenizerKind::Cl100k => tiktoken_rs::cl100k_base(),
            TokenizerKind::O200k => tiktoken_rs::o200k_base(),
            TokenizerKind::P50k => tiktoken_rs::p50k_base(),
        }
        .map_err(|e| FilingError::Tokenizer(e.to_string()))?;
        Ok(BpeCodec { bpe })
    }
}

impl Default for TokenizerKind {
    fn default() -> Self {
        TokenizerKind::Cl100k
    }
}

impl FromStr for TokenizerKind {
    type Err = FilingError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "cl100k" | "cl100k_base" => Ok(TokenizerKind::Cl100k),
            "o200k" | "o200k_base" => Ok(TokenizerKind::O200k),
            "p50k" | "p50k_base" | "gpt2" => Ok(TokenizerKind::P50k),
            other => Err(FilingError::UnknownTokenizer(other.to_string())),
        }
    }
}

/// Byte-pair codec backed by `tiktoken-rs`.
pub struct BpeCodec {
    bpe: CoreBPE,
}

impl BpeCodec {
    pub fn count(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }
}

impl TokenCodec for BpeCodec {
    fn encode(&self, text: &str) -> Vec<usize> {
        self.bpe.encode_ordinary(text)
    }

    fn decode(&self, tokens: &[usize]) -> String {
        if let Ok(text) = self.bpe.decode(tokens.to_vec()) {
            return text;
        }
        decode_lossy(&self.bpe, tokens)
    }

    fn starts_clean(&self, token: usize) -> bool {
        self.bpe
            ._decode_native(&[token])
            .first()
            .map_or(true, |&byte| !is_continuation_byte(byte))
    }
}

fn is_continuation_byte(byte: u8) -> bool {
    byte & 0b1100_0000 == 0b1000_0000
}

// The chunker cuts on clean starts, so this only runs for slices built some
// other way. Decode greedily, letting up to four tokens pile up until they form
// valid UTF-8, and replace whatever never does.
fn decode_lossy(bpe: &CoreBPE, tokens: &[usize]) -> String {
    let mut out = String::new();
    let mut pending: Vec<usize> = Vec::new();
    for &token in tokens {
        pending.push(token);
        if let Ok(text) = bpe.decode(pending.clone()) {
            out.push_str(&text);
            pending.clear();
        } else if pending.len() >= 4 {
            out.push(char::REPLACEMENT_CHARACTER);
            pending.clear();
        }
    }
    if !pending.is_empty() {
        out.push(char::REPLACEMENT_CHARACTER);
    }
    out
}
