use anyhow::Result;
use std::ops::Range;
use unicode_segmentation::UnicodeSegmentation;

/// Byte span of one token inside the encoded text.
pub type Token = Range<usize>;

/// Splits text into tokens and maps token windows back to text.
///
/// Implementations holding native resources release them on drop; the
/// chunker owns its tokenizer, so dropping the pipeline releases it.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<Token>>;

    /// Text covered by `window`, from the first token start to the last token end.
    fn decode(&self, text: &str, window: &[Token]) -> Result<String> {
        match (window.first(), window.last()) {
            (Some(first), Some(last)) => text
                .get(first.start..last.end)
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("Token window {}..{} is out of bounds", first.start, last.end)),
            _ => Ok(String::new()),
        }
    }

    fn name(&self) -> &str;
}

/// Unicode word-boundary tokenizer: every word and punctuation mark is a
/// token, whitespace is not.
#[derive(Debug, Default, Clone)]
pub struct WordTokenizer;

impl WordTokenizer {
    pub fn new() -> Self {
        Self
    }
}

impl Tokenizer for WordTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<Token>> {
        Ok(text
            .split_word_bound_indices()
            .filter(|(_, segment)| !segment.trim().is_empty())
            .map(|(start, segment)| start..start + segment.len())
            .collect())
    }

    fn name(&self) -> &str {
        "unicode-words"
    }
}
