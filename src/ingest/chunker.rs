//! Boundary-aware text chunker.
//!
//! Greedy windowing with overlap. When a window would split mid-sentence the
//! cut moves back to the nearest sentence ending, else the nearest newline,
//! else the nearest space, all within the current window. Offsets are in
//! characters, not bytes, so multi-byte text slices safely.

/// Characters treated as sentence endings for boundary search.
const SENTENCE_ENDINGS: [char; 8] = ['.', '!', '?', ';', '。', '！', '？', '；'];

/// Splits `text` into overlapping chunks of at most `chunk_size` characters.
/// Chunks are trimmed and fragments shorter than `min_len` are dropped,
/// except when the whole text fits in a single chunk.
pub fn split(text: &str, chunk_size: usize, overlap: usize, min_len: usize) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() || chunk_size == 0 {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();

    if total <= chunk_size {
        return vec![trimmed.to_string()];
    }

    let mut chunks = Vec::new();
    let mut first_piece: Option<String> = None;
    let mut start = 0;

    while start < total {
        let window_end = (start + chunk_size).min(total);
        let cut = if window_end < total {
            find_cut(&chars, start, window_end)
        } else {
            window_end
        };

        let piece: String = chars[start..cut].iter().collect();
        let piece = piece.trim();
        if !piece.is_empty() {
            if first_piece.is_none() {
                first_piece = Some(piece.to_string());
            }
            if piece.chars().count() >= min_len {
                chunks.push(piece.to_string());
            }
        }

        if cut >= total {
            break;
        }

        // Overlap the next window, but always move forward at least one
        // character so overlap >= window can never loop.
        start = cut.saturating_sub(overlap).max(start + 1);
    }

    if chunks.is_empty() {
        if let Some(piece) = first_piece {
            chunks.push(piece);
        }
    }

    chunks
}

/// Finds the cut position for the window `[start, window_end)`, preferring a
/// sentence ending, then a newline, then a space. The cut lands just after
/// the boundary character. Falls back to the raw window end.
fn find_cut(chars: &[char], start: usize, window_end: usize) -> usize {
    let floor = start + 1;

    for idx in (floor..window_end).rev() {
        if SENTENCE_ENDINGS.contains(&chars[idx]) {
            return idx + 1;
        }
    }
    for idx in (floor..window_end).rev() {
        if chars[idx] == '\n' {
            return idx + 1;
        }
    }
    for idx in (floor..window_end).rev() {
        if chars[idx] == ' ' {
            return idx + 1;
        }
    }

    window_end
}
