/// Extracted course document. Pages are joined with a blank line; `page_starts`
/// records the character offset where each page begins in `text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: String,
    pub text: String,
    pub page_starts: Vec<usize>,
    pub source_bytes: u64,
}

pub const PAGE_SEPARATOR: &str = "\n\n";

impl Document {
    /// Build from per-page text, dropping blank pages but keeping page numbering.
    #[must_use]
    pub fn from_pages<S: AsRef<str>>(id: impl Into<String>, pages: &[S], source_bytes: u64) -> Self {
        let mut text = String::new();
        let mut page_starts = Vec::with_capacity(pages.len());
        let mut offset = 0usize;
        for (i, page) in pages.iter().enumerate() {
            if i > 0 {
                text.push_str(PAGE_SEPARATOR);
                offset += PAGE_SEPARATOR.chars().count();
            }
            page_starts.push(offset);
            text.push_str(page.as_ref());
            offset += page.as_ref().chars().count();
        }
        Self {
            id: id.into(),
            text,
            page_starts,
            source_bytes,
        }
    }

    /// Single-page document.
    #[must_use]
    pub fn from_text(id: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        let source_bytes = text.len() as u64;
        Self {
            id: id.into(),
            text,
            page_starts: vec![0],
            source_bytes,
        }
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.page_starts.len().max(1)
    }

    #[must_use]
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// 1-based page containing character `offset`.
    #[must_use]
    pub fn page_at(&self, offset: usize) -> u32 {
        let idx = self.page_starts.partition_point(|start| *start <= offset);
        u32::try_from(idx.max(1)).unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub document_id: String,
    pub index: usize,
    pub text: String,
    /// Page the chunk starts on.
    pub page: u32,
    /// Every page the chunk spans, ascending.
    pub pages: Vec<u32>,
    /// Character offsets into the document text, end exclusive.
    pub start: usize,
    pub end: usize,
}

impl Chunk {
    /// Stable id derived from document identity and sequence.
    #[must_use]
    pub fn id(&self) -> String {
        chunk_id(&self.document_id, self.index)
    }
}

#[must_use]
pub fn chunk_id(document_id: &str, index: usize) -> String {
    format!("{document_id}:{index}")
}

#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub model: String,
}
