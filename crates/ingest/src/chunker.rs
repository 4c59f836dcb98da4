use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::chunk::{Chunk, Document};
use crate::tokenizer::{Tokenizer, WordTokenizer};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Token budget per chunk
    pub chunk_size: usize,
    /// Tokens shared by consecutive chunks
    pub overlap: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            overlap: 64,
        }
    }
}

impl ChunkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            anyhow::bail!("chunk_size must be greater than zero");
        }
        if self.overlap >= self.chunk_size {
            anyhow::bail!(
                "overlap ({}) must be smaller than chunk_size ({})",
                self.overlap,
                self.chunk_size
            );
        }
        Ok(())
    }

    fn stride(&self) -> usize {
        self.chunk_size - self.overlap
    }
}

pub struct Chunker {
    config: ChunkerConfig,
    tokenizer: Box<dyn Tokenizer>,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        Self::with_tokenizer(config, Box::new(WordTokenizer::new()))
    }

    pub fn with_tokenizer(config: ChunkerConfig, tokenizer: Box<dyn Tokenizer>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, tokenizer })
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Slide a `chunk_size` window over the document's tokens, advancing by
    /// `chunk_size - overlap`. The last window ends exactly at the final token.
    pub fn chunk_document(&self, document: &Document) -> Result<Vec<Chunk>> {
        let tokens = self
            .tokenizer
            .encode(&document.content)
            .with_context(|| format!("Failed to tokenize document {}", document.id))?;

        let mut chunks = Vec::new();
        if tokens.is_empty() {
            return Ok(chunks);
        }

        let total = tokens.len();
        let mut start = 0;

        loop {
            let end = (start + self.config.chunk_size).min(total);
            let text = self.tokenizer.decode(&document.content, &tokens[start..end])?;

            chunks.push(Chunk::new(
                &document.id,
                chunks.len(),
                text.trim().to_string(),
                (start, end),
            ));

            if end == total {
                break;
            }
            start += self.config.stride();
        }

        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered_words(n: usize) -> String {
        (0..n).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn test_basic_chunking() {
        let chunker = Chunker::new(ChunkerConfig::default()).unwrap();
        let doc = Document::new("test.txt", "This is a test paragraph.\n\nThis is another paragraph.".to_string());
        let chunks = chunker.chunk_document(&doc).unwrap();

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].doc_id, doc.id);
        assert_eq!(chunks[0].start_token, 0);
        assert!(chunks[0].content.starts_with("This is a test"));
    }

    #[test]
    fn test_overlap_invariant() {
        let config = ChunkerConfig { chunk_size: 10, overlap: 3 };
        let chunker = Chunker::new(config).unwrap();
        let doc = Document::new("long.txt", numbered_words(47));
        let chunks = chunker.chunk_document(&doc).unwrap();

        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            assert_eq!(pair[1].start_token, pair[0].end_token - 3);
            assert_eq!(pair[0].token_count(), 10);
        }
        assert_eq!(chunks.last().unwrap().end_token, 47);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
        }
    }

    #[test]
    fn test_window_text_matches_tokens() {
        let chunker = Chunker::new(ChunkerConfig { chunk_size: 4, overlap: 1 }).unwrap();
        let doc = Document::new("a.txt", numbered_words(7));
        let chunks = chunker.chunk_document(&doc).unwrap();

        assert_eq!(chunks[0].content, "w0 w1 w2 w3");
        assert_eq!(chunks[1].content, "w3 w4 w5 w6");
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn test_empty_document_has_no_chunks() {
        let chunker = Chunker::new(ChunkerConfig::default()).unwrap();
        let doc = Document::new("empty.txt", "   \n\t ".to_string());

        assert!(chunker.chunk_document(&doc).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_overlap_not_smaller_than_size() {
        assert!(Chunker::new(ChunkerConfig { chunk_size: 8, overlap: 8 }).is_err());
        assert!(Chunker::new(ChunkerConfig { chunk_size: 0, overlap: 0 }).is_err());
    }
}
