use super::types::{Chunk, Document};

/// Separators tried in order when snapping a chunk end to a natural break.
const BREAKS: &[&str] = &["\n\n", "\n", ". ", "! ", "? ", ".", "!", "?", " "];

/// Chunks every document of at least this many characters must yield.
pub const MIN_CHUNKS: usize = 10;

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Chunk size for long documents.
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Smallest chunk the adaptive policy will choose.
    pub min_chunk_size: usize,
    /// Upper bound on chunk size when growing chunks to respect `max_chunks`.
    pub max_chunk_size: usize,
    pub max_chunks: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            min_chunk_size: 100,
            max_chunk_size: 4000,
            max_chunks: 400,
        }
    }
}

/// Size and overlap picked for one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub size: usize,
    pub overlap: usize,
}

/// Splits a whole document as one character stream with length-adaptive
/// chunk size.
#[derive(Debug, Clone, Default)]
pub struct AdaptiveChunker {
    config: ChunkerConfig,
}

impl AdaptiveChunker {
    #[must_use]
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Chunk size and overlap for a document of `len` characters.
    #[must_use]
    pub fn plan(&self, len: usize) -> ChunkPlan {
        let cfg = &self.config;
        let min_size = cfg.min_chunk_size.max(2);

        let (mut size, mut overlap) = if len < 2000 {
            let size = (len / 10).max(min_size);
            (size, (size / 5).max(20))
        } else if len < 5000 {
            let size = (len / 10).clamp(300, 500);
            (size, cfg.chunk_overlap)
        } else if len < 10_000 {
            let size = (len / 10).clamp(500, 700);
            (size, cfg.chunk_overlap)
        } else {
            (cfg.chunk_size.max(min_size), cfg.chunk_overlap)
        };

        if len >= MIN_CHUNKS * min_size {
            size = size.min(len / MIN_CHUNKS).max(min_size);
        }
        if len < 10_000 {
            overlap = overlap.min(size / 5);
        }

        // Worst-case stride is when the break lands at the start of the search window.
        let worst_stride = (size * 7 / 10).saturating_sub(overlap).max(1);
        if cfg.max_chunks > 0 && len / worst_stride > cfg.max_chunks {
            let needed = ((len.div_ceil(cfg.max_chunks) + overlap) * 10).div_ceil(7);
            size = needed.min(cfg.max_chunk_size.max(size));
        }

        overlap = overlap.clamp(1, size - 1);
        ChunkPlan { size, overlap }
    }

    /// Split `document` into ordered, overlapping chunks. Blank input yields none.
    #[must_use]
    pub fn split(&self, document: &Document) -> Vec<Chunk> {
        let chars: Vec<char> = document.text.chars().collect();
        let n = chars.len();
        if document.is_blank() {
            return Vec::new();
        }

        let ChunkPlan { size, overlap } = self.plan(n);
        tracing::debug!(
            document_id = %document.id,
            chars = n,
            size,
            overlap,
            "chunking document"
        );

        let mut chunks = Vec::new();
        let mut start = 0usize;
        while start < n {
            let mut end = (start + size).min(n);
            if end < n
                && let Some(brk) = find_break(&chars, start + size * 7 / 10, end)
            {
                end = brk;
            }

            if let Some(chunk) = make_chunk(document, &chars, start, end, chunks.len()) {
                chunks.push(chunk);
            }
            if end >= n {
                break;
            }
            start = (start + 1).max(end.saturating_sub(overlap));
        }
        chunks
    }
}

/// Offset just past the last preferred separator inside `[from, to)`.
fn find_break(chars: &[char], from: usize, to: usize) -> Option<usize> {
    let window = chars.get(from..to)?;
    for sep in BREAKS {
        let sep: Vec<char> = sep.chars().collect();
        if window.len() < sep.len() {
            continue;
        }
        if let Some(pos) = (0..=window.len() - sep.len())
            .rev()
            .find(|&i| window[i..i + sep.len()] == sep[..])
        {
            return Some(from + pos + sep.len());
        }
    }
    None
}

fn make_chunk(
    document: &Document,
    chars: &[char],
    start: usize,
    end: usize,
    index: usize,
) -> Option<Chunk> {
    let span = &chars[start..end];
    let lead = span.iter().take_while(|c| c.is_whitespace()).count();
    if lead == span.len() {
        return None;
    }
    let trail = span.iter().rev().take_while(|c| c.is_whitespace()).count();
    let (start, end) = (start + lead, end - trail);

    let first_page = document.page_at(start);
    let last_page = document.page_at(end - 1);
    Some(Chunk {
        document_id: document.id.clone(),
        index,
        text: chars[start..end].iter().collect(),
        page: first_page,
        pages: (first_page..=last_page).collect(),
        start,
        end,
    })
}

/// Lower bound on chunk count for a document of `len` characters under the
/// default configuration.
#[must_use]
pub fn min_chunk_floor(len: usize) -> usize {
    if len >= MIN_CHUNKS * 100 {
        MIN_CHUNKS
    } else {
        len / 100
    }
}
