pub mod chunk;
pub mod chunker;
pub mod scanner;
pub mod tokenizer;

pub use chunk::{chunk_id_prefix, content_digest, generate_chunk_id, generate_doc_id, Chunk, Document};
pub use chunker::{Chunker, ChunkerConfig};
pub use scanner::{Scanner, ScannerConfig};
pub use tokenizer::{Token, Tokenizer, WordTokenizer};
