use crate::config::ChunkingConfig;
use crate::processing::type_detector::DocumentGenre;
use uuid::Uuid;

const SENTENCE_TERMINATORS: [char; 6] = ['。', '！', '？', '.', '!', '?'];

#[derive(Debug, Clone)]
pub struct ChunkResult {
    pub id: Uuid,
    pub text: String,
    pub index: usize,
    pub heading: Option<String>,
    pub start_offset: usize,
    pub end_offset: usize,
}

pub struct TextChunker {
    chunk_size: usize,
    chunk_overlap: usize,
    min_chunk_size: usize,
}

impl TextChunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize, min_chunk_size: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
            min_chunk_size,
        }
    }

    pub fn chunk(&self, text: &str) -> Vec<ChunkResult> {
        if text.len() <= self.chunk_size {
            if text.len() < self.min_chunk_size {
                return Vec::new();
            }
            return vec![ChunkResult {
                id: Uuid::new_v4(),
                text: text.to_string(),
                index: 0,
                heading: None,
                start_offset: 0,
                end_offset: text.len(),
            }];
        }

        let mut chunks = Vec::new();
        let mut start = 0;
        let mut index = 0;

        while start < text.len() {
            let raw_end = (start + self.chunk_size).min(text.len());
            let end = snap_to_char_boundary(text, raw_end);

            // Try to find a sentence boundary near the end
            let actual_end = if end < text.len() {
                self.find_break_point(text, start, end)
            } else {
                end
            };

            let chunk_text = &text[start..actual_end];

            if chunk_text.len() >= self.min_chunk_size {
                let heading = self.extract_heading(chunk_text);

                chunks.push(ChunkResult {
                    id: Uuid::new_v4(),
                    text: chunk_text.to_string(),
                    index,
                    heading,
                    start_offset: start,
                    end_offset: actual_end,
                });
                index += 1;
            }

            // Move forward with overlap
            let step = if actual_end - start > self.chunk_overlap {
                actual_end - start - self.chunk_overlap
            } else {
                actual_end - start
            };

            let raw_next = start + step;
            start = snap_to_char_boundary(text, raw_next);
            if start >= text.len() {
                break;
            }
        }

        chunks
    }

    fn find_break_point(&self, text: &str, start: usize, preferred_end: usize) -> usize {
        let raw_search_start = if preferred_end > 200 {
            preferred_end - 200
        } else {
            start
        };
        let search_start = snap_to_char_boundary(text, raw_search_start);
        let safe_end = snap_to_char_boundary(text, preferred_end);

        if search_start >= safe_end {
            return safe_end;
        }

        let search_region = &text[search_start..safe_end];

        // Priority: paragraph break > sentence end > line break > word break
        if let Some(pos) = search_region.rfind("\n\n") {
            return search_start + pos + 2;
        }
        if let Some(pos) = search_region.rfind(". ") {
            return search_start + pos + 2;
        }
        if let Some(pos) = search_region.rfind(".\n") {
            return search_start + pos + 2;
        }
        if let Some(pos) = search_region.rfind('\n') {
            return search_start + pos + 1;
        }
        if let Some(pos) = search_region.rfind(' ') {
            return search_start + pos + 1;
        }

        safe_end
    }

    fn extract_heading(&self, text: &str) -> Option<String> {
        let first_line = text.lines().next()?;
        if first_line.starts_with('#') {
            Some(first_line.trim_start_matches('#').trim().to_string())
        } else {
            None
        }
    }
}

/// Sizing/behaviour knobs for one chunking run (§4.2). Picked per document
/// genre by `params_for_genre`.
#[derive(Debug, Clone, Copy)]
pub struct ChunkParams {
    pub target_size: usize,
    pub overlap: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub semantic_split: bool,
    pub preserve_structure: bool,
}

/// Picks chunking parameters for a detected document genre. Code/Structured/
/// Unknown keep the plain sliding window (splitting JSON or source on blank
/// lines would scatter related tokens); prose-like genres get paragraph-first
/// semantic splitting with a structure-preserving post-pass.
pub fn params_for_genre(genre: DocumentGenre, config: &ChunkingConfig) -> ChunkParams {
    match genre {
        DocumentGenre::Code | DocumentGenre::Structured | DocumentGenre::Unknown => ChunkParams {
            target_size: config.chunk_size,
            overlap: config.chunk_overlap,
            min_size: config.min_chunk_size,
            max_size: config.max_chunk_size,
            semantic_split: false,
            preserve_structure: false,
        },
        _ => ChunkParams {
            target_size: config.chunk_size,
            overlap: config.chunk_overlap,
            min_size: config.min_chunk_size,
            max_size: config.max_chunk_size,
            semantic_split: true,
            preserve_structure: true,
        },
    }
}

impl TextChunker {
    /// Normalizes whitespace, then dispatches to semantic (paragraph-first)
    /// or sliding-window splitting per `params.semantic_split`, finishing with
    /// the structure-preserving bisect/merge pass when requested.
    pub fn chunk_with_params(text: &str, params: ChunkParams) -> Vec<ChunkResult> {
        let normalized = normalize_whitespace(text);
        if normalized.trim().is_empty() {
            return Vec::new();
        }

        let mut chunks = if params.semantic_split {
            Self::semantic_chunks(&normalized, params.target_size)
        } else {
            TextChunker::new(params.target_size, params.overlap, params.min_size).chunk(&normalized)
        };

        if params.preserve_structure {
            chunks = Self::apply_structure_pass(chunks, params);
        }

        chunks
    }

    /// Paragraph-first split (§4.2 step 2): accumulates `\n\n`-separated
    /// paragraphs until the running chunk would exceed `target_size`, then
    /// flushes; a paragraph that alone exceeds `target_size` is flushed on
    /// its own after splitting by sentence terminator.
    fn semantic_chunks(text: &str, target_size: usize) -> Vec<ChunkResult> {
        let mut chunks = Vec::new();
        let mut current = String::new();
        let mut index = 0usize;

        for paragraph in text.split("\n\n") {
            let paragraph = paragraph.trim();
            if paragraph.is_empty() {
                continue;
            }

            if paragraph.len() > target_size {
                if !current.is_empty() {
                    chunks.push(Self::make_chunk(&current, index));
                    index += 1;
                    current.clear();
                }
                for sentence_chunk in Self::split_by_sentences(paragraph, target_size) {
                    chunks.push(Self::make_chunk(&sentence_chunk, index));
                    index += 1;
                }
                continue;
            }

            if !current.is_empty() && current.len() + paragraph.len() + 2 > target_size {
                chunks.push(Self::make_chunk(&current, index));
                index += 1;
                current.clear();
            }
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(paragraph);
        }

        if !current.trim().is_empty() {
            chunks.push(Self::make_chunk(&current, index));
        }

        chunks
    }

    fn make_chunk(text: &str, index: usize) -> ChunkResult {
        let trimmed = text.trim().to_string();
        let heading = trimmed
            .lines()
            .next()
            .filter(|l| l.starts_with('#'))
            .map(|l| l.trim_start_matches('#').trim().to_string());
        ChunkResult {
            id: Uuid::new_v4(),
            end_offset: trimmed.len(),
            text: trimmed,
            index,
            heading,
            start_offset: 0,
        }
    }

    fn split_by_sentences(text: &str, target_size: usize) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let mut sentences = Vec::new();
        let mut sentence_start = 0usize;

        for (i, ch) in chars.iter().enumerate() {
            if SENTENCE_TERMINATORS.contains(ch) {
                sentences.push(chars[sentence_start..=i].iter().collect::<String>());
                sentence_start = i + 1;
            }
        }
        if sentence_start < chars.len() {
            sentences.push(chars[sentence_start..].iter().collect::<String>());
        }

        let mut out = Vec::new();
        let mut current = String::new();
        for sentence in sentences {
            if !current.is_empty() && current.len() + sentence.len() > target_size {
                out.push(current.trim().to_string());
                current.clear();
            }
            current.push_str(&sentence);
        }
        if !current.trim().is_empty() {
            out.push(current.trim().to_string());
        }
        out
    }

    /// Post-pass (§4.2 step 4): bisects chunks above `max_size` at the
    /// nearest sentence terminator, then merges chunks below `min_size` into
    /// their predecessor when the combined size still fits `max_size`.
    fn apply_structure_pass(chunks: Vec<ChunkResult>, params: ChunkParams) -> Vec<ChunkResult> {
        let mut bisected = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            if chunk.text.len() > params.max_size {
                bisected.extend(Self::bisect_chunk(&chunk, params.max_size));
            } else {
                bisected.push(chunk);
            }
        }

        let mut merged: Vec<ChunkResult> = Vec::with_capacity(bisected.len());
        for chunk in bisected {
            if chunk.text.len() < params.min_size {
                if let Some(prev) = merged.last_mut() {
                    if prev.text.len() + chunk.text.len() + 2 <= params.max_size {
                        prev.text.push_str("\n\n");
                        prev.text.push_str(&chunk.text);
                        prev.end_offset = prev.text.len();
                        continue;
                    }
                }
            }
            merged.push(chunk);
        }

        for (i, chunk) in merged.iter_mut().enumerate() {
            chunk.index = i;
        }
        merged
    }

    fn bisect_chunk(chunk: &ChunkResult, max_size: usize) -> Vec<ChunkResult> {
        let text = &chunk.text;
        if text.len() <= max_size {
            return vec![chunk.clone()];
        }

        let mid = snap_to_char_boundary(text, text.len() / 2);
        let window = (text.len() / 4).clamp(1, 200);
        let search_start = snap_to_char_boundary(text, mid.saturating_sub(window));
        let search_end = snap_to_char_boundary(text, (mid + window).min(text.len()));

        let mut split_at = None;
        if search_start < search_end {
            for (offset, ch) in text[search_start..search_end].char_indices() {
                if SENTENCE_TERMINATORS.contains(&ch) {
                    split_at = Some(search_start + offset + ch.len_utf8());
                }
            }
        }
        let split_at = split_at.unwrap_or(mid);
        if split_at == 0 || split_at >= text.len() {
            return vec![chunk.clone()];
        }

        let (left, right) = text.split_at(split_at);
        let mut out = vec![Self::make_chunk(left, chunk.index)];
        if right.trim().len() > max_size {
            out.extend(Self::bisect_chunk(&Self::make_chunk(right, chunk.index + 1), max_size));
        } else if !right.trim().is_empty() {
            out.push(Self::make_chunk(right, chunk.index + 1));
        }
        out
    }
}

/// Collapses runs of non-newline whitespace to a single space while keeping
/// paragraph breaks (capped at one blank line, i.e. `\n\n`).
fn normalize_whitespace(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut newline_run = 0usize;
    let mut pending_space = false;

    for ch in text.chars() {
        if ch == '\n' {
            newline_run += 1;
            if newline_run <= 2 {
                result.push('\n');
            }
            pending_space = false;
        } else if ch.is_whitespace() {
            newline_run = 0;
            pending_space = true;
        } else {
            newline_run = 0;
            if pending_space {
                result.push(' ');
                pending_space = false;
            }
            result.push(ch);
        }
    }

    result
}

/// Snap a byte offset to the nearest valid UTF-8 char boundary (rounding down).
/// If `pos` is already on a boundary, returns `pos` unchanged.
/// If `pos` is beyond text length, returns `text.len()`.
fn snap_to_char_boundary(text: &str, pos: usize) -> usize {
    if pos >= text.len() {
        return text.len();
    }
    // Walk backwards until we hit a char boundary
    let mut p = pos;
    while p > 0 && !text.is_char_boundary(p) {
        p -= 1;
    }
    p
}

impl Default for TextChunker {
    fn default() -> Self {
        Self::new(1750, 200, 100)
    }
}
