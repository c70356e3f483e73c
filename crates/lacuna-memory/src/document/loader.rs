use std::path::Path;

use super::types::Document;

/// Default maximum file size: 50 MiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Page break emitted by text extractors between pages.
const FORM_FEED: char = '\u{c}';

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("file too large: {0} bytes")]
    FileTooLarge(u64),

    #[cfg(feature = "pdf")]
    #[error("PDF error: {0}")]
    Pdf(String),
}

pub trait DocumentLoader: Send + Sync {
    fn load<'a>(
        &'a self,
        id: &'a str,
        path: &'a Path,
    ) -> crate::vector_store::BoxFuture<'a, Result<Document, DocumentError>>;

    fn supported_extensions(&self) -> &[&str];
}

/// Split extracted text into pages on form feeds.
fn pages_of(text: &str) -> Vec<&str> {
    let mut pages: Vec<&str> = text.split(FORM_FEED).collect();
    if pages.len() > 1 && pages.last().is_some_and(|p| p.trim().is_empty()) {
        pages.pop();
    }
    pages
}

async fn checked_size(path: &Path, max_size: u64) -> Result<u64, DocumentError> {
    let meta = tokio::fs::metadata(path).await?;
    if meta.len() > max_size {
        return Err(DocumentError::FileTooLarge(meta.len()));
    }
    Ok(meta.len())
}

pub struct TextLoader {
    pub max_file_size: u64,
}

impl Default for TextLoader {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl DocumentLoader for TextLoader {
    fn load<'a>(
        &'a self,
        id: &'a str,
        path: &'a Path,
    ) -> crate::vector_store::BoxFuture<'a, Result<Document, DocumentError>> {
        Box::pin(async move {
            let bytes = checked_size(path, self.max_file_size).await?;
            let content = tokio::fs::read_to_string(path).await?;
            Ok(Document::from_pages(id, &pages_of(&content), bytes))
        })
    }

    fn supported_extensions(&self) -> &[&str] {
        &["txt", "md", "markdown"]
    }
}

#[cfg(feature = "pdf")]
pub struct PdfLoader {
    pub max_file_size: u64,
}

#[cfg(feature = "pdf")]
impl Default for PdfLoader {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

#[cfg(feature = "pdf")]
impl DocumentLoader for PdfLoader {
    fn load<'a>(
        &'a self,
        id: &'a str,
        path: &'a Path,
    ) -> crate::vector_store::BoxFuture<'a, Result<Document, DocumentError>> {
        Box::pin(async move {
            let bytes = checked_size(path, self.max_file_size).await?;
            let path_buf = path.to_path_buf();
            let content = tokio::task::spawn_blocking(move || {
                pdf_extract::extract_text(&path_buf).map_err(|e| DocumentError::Pdf(e.to_string()))
            })
            .await
            .map_err(|e| DocumentError::Io(std::io::Error::other(e)))??;
            Ok(Document::from_pages(id, &pages_of(&content), bytes))
        })
    }

    fn supported_extensions(&self) -> &[&str] {
        &["pdf"]
    }
}

/// Load `path` with the loader registered for its extension.
///
/// # Errors
///
/// Returns `DocumentError::UnsupportedFormat` for unknown extensions, or any
/// loader error.
pub async fn load_document(id: &str, path: &Path) -> Result<Document, DocumentError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let text = TextLoader::default();
    if ext.is_empty() || text.supported_extensions().contains(&ext.as_str()) {
        return text.load(id, path).await;
    }
    #[cfg(feature = "pdf")]
    {
        let pdf = PdfLoader::default();
        if pdf.supported_extensions().contains(&ext.as_str()) {
            return pdf.load(id, path).await;
        }
    }
    Err(DocumentError::UnsupportedFormat(ext))
}
