pub mod chunker;
pub mod loader;
pub mod types;

pub use chunker::{AdaptiveChunker, ChunkerConfig};
#[cfg(feature = "pdf")]
pub use loader::PdfLoader;
pub use loader::{DocumentError, DocumentLoader, TextLoader, load_document};
pub use types::{Chunk, Document, Embedding};
