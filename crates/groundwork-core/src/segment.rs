//! Sentence-boundary segment splitter.
//!
//! Splits a document body into [`Segment`]s no longer than `max_chars`
//! characters. Splitting occurs only between sentences so that every
//! segment is a citable run of whole sentences.
//!
//! # Algorithm
//!
//! 1. Trim the body and split it into sentences at any whitespace run that
//!    follows `.`, `!` or `?`.
//! 2. Greedily pack sentences into a buffer, joined by a single space,
//!    until adding the next sentence would exceed `max_chars`.
//! 3. Flush the buffer as a segment and start a new one with that sentence.
//! 4. A sentence longer than `max_chars` on its own becomes its own
//!    segment; it is never cut mid-sentence.
//!
//! A blank body produces no segments.
//!
//! # Example
//!
//! ```rust
//! use groundwork_core::segment::split_segments;
//!
//! let segments = split_segments("doc-1", "A. B. C.", 500);
//! assert_eq!(segments.len(), 1);
//! assert_eq!(segments[0].content, "A. B. C.");
//! ```

use uuid::Uuid;

use crate::models::Segment;

/// Default maximum segment length, in characters.
pub const DEFAULT_MAX_CHARS: usize = 500;

/// Split `body` into segments with contiguous indices starting at 0.
pub fn split_segments(document_id: &str, body: &str, max_chars: usize) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for sentence in split_sentences(body) {
        let sentence_len = sentence.chars().count();
        if !current.is_empty() && current_len + 1 + sentence_len > max_chars {
            segments.push(make_segment(document_id, segments.len(), &current));
            current.clear();
            current_len = 0;
        }
        if !current.is_empty() {
            current.push(' ');
            current_len += 1;
        }
        current.push_str(sentence);
        current_len += sentence_len;
    }

    if !current.is_empty() {
        segments.push(make_segment(document_id, segments.len(), &current));
    }

    segments
}

/// Split text into sentences at whitespace that follows terminal punctuation.
///
/// Whitespace inside a sentence is preserved; the separating whitespace
/// runs are dropped.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let text = text.trim();
    let mut sentences = Vec::new();
    if text.is_empty() {
        return sentences;
    }

    let mut start = 0usize;
    let mut prev: Option<char> = None;
    let mut iter = text.char_indices().peekable();

    while let Some((idx, ch)) = iter.next() {
        if ch.is_whitespace() && matches!(prev, Some('.' | '!' | '?')) {
            sentences.push(&text[start..idx]);
            // Skip the rest of the whitespace run.
            let mut next_start = idx + ch.len_utf8();
            while let Some(&(j, c)) = iter.peek() {
                if !c.is_whitespace() {
                    break;
                }
                next_start = j + c.len_utf8();
                iter.next();
            }
            start = next_start;
            prev = None;
            continue;
        }
        prev = Some(ch);
    }

    if start < text.len() {
        sentences.push(&text[start..]);
    }

    sentences
}

fn make_segment(document_id: &str, index: usize, content: &str) -> Segment {
    Segment {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index as i64,
        content: content.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize(text: &str) -> String {
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn test_three_sentences_fit_one_segment() {
        let segments = split_segments("doc1", "A. B. C.", 500);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].chunk_index, 0);
        assert_eq!(segments[0].content, "A. B. C.");
        assert_eq!(segments[0].document_id, "doc1");
    }

    #[test]
    fn test_blank_body_has_no_segments() {
        assert!(split_segments("doc1", "", 500).is_empty());
        assert!(split_segments("doc1", "   \n\t ", 500).is_empty());
    }

    #[test]
    fn test_packs_sentences_up_to_limit() {
        let text = "First sentence here. Second sentence here. Third sentence here.";
        let segments = split_segments("doc1", text, 45);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].content, "First sentence here. Second sentence here.");
        assert_eq!(segments[1].content, "Third sentence here.");
    }

    #[test]
    fn test_oversized_sentence_stands_alone() {
        let long = "This sentence is far longer than the configured maximum segment size.";
        let text = format!("Short. {} Tail.", long);
        let segments = split_segments("doc1", &text, 20);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].content, "Short.");
        assert_eq!(segments[1].content, long);
        assert_eq!(segments[2].content, "Tail.");
    }

    #[test]
    fn test_indices_contiguous() {
        let text = (0..40)
            .map(|i| format!("Sentence number {} ends here.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let segments = split_segments("doc1", &text, 64);
        assert!(segments.len() > 1);
        for (i, s) in segments.iter().enumerate() {
            assert_eq!(s.chunk_index, i as i64, "Index mismatch at position {}", i);
        }
    }

    #[test]
    fn test_reconstructs_body_modulo_whitespace() {
        let body = "Insulin lowers glucose.  It is given by injection!\n\nDoses vary?   Yes.\tAlways consult labeling.";
        for max in [5, 20, 40, 500] {
            let segments = split_segments("doc1", body, max);
            let joined = segments
                .iter()
                .map(|s| s.content.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            assert_eq!(normalize(&joined), normalize(body), "max_chars={}", max);
        }
    }

    #[test]
    fn test_no_segment_exceeds_limit_unless_single_sentence() {
        let body = "One two three. Four five six seven. Eight. Nine ten eleven twelve thirteen.";
        let segments = split_segments("doc1", body, 20);
        for s in &segments {
            if s.content.chars().count() > 20 {
                assert_eq!(split_sentences(&s.content).len(), 1);
            }
        }
    }

    #[test]
    fn test_sentence_split_keeps_abbreviation_without_space() {
        let sentences = split_sentences("Dose was 2.5mg daily. Then stopped.");
        assert_eq!(sentences, vec!["Dose was 2.5mg daily.", "Then stopped."]);
    }
}
