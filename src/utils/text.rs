//! Text preparation for synthesis requests.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::{TtsError, TtsResult};

/// Longest text (in characters, across all segments) accepted for one request.
pub const MAX_TEXT_CHARS: usize = 20_000;

static SSML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid SSML regex"));

/// A fragment ending in one of these characters closes a sentence.
static SENTENCE_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[-.!?;:…]$").expect("valid sentence regex"));

/// Text for one request: a single string or an ordered list of segments.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TextInput(Vec<String>);

impl TextInput {
    pub fn into_segments(self) -> Vec<String> {
        self.0
    }
}

impl From<&str> for TextInput {
    fn from(text: &str) -> Self {
        Self(vec![text.to_string()])
    }
}

impl From<String> for TextInput {
    fn from(text: String) -> Self {
        Self(vec![text])
    }
}

impl From<Vec<String>> for TextInput {
    fn from(segments: Vec<String>) -> Self {
        Self(segments)
    }
}

impl From<Vec<&str>> for TextInput {
    fn from(segments: Vec<&str>) -> Self {
        Self(segments.into_iter().map(str::to_string).collect())
    }
}

impl From<&[&str]> for TextInput {
    fn from(segments: &[&str]) -> Self {
        Self(segments.iter().map(|s| s.to_string()).collect())
    }
}

/// Removes `<...>` markup.
pub fn strip_ssml(text: &str) -> String {
    SSML_TAG.replace_all(text, "").into_owned()
}

/// Whether `fragment` (already trimmed) closes a sentence.
#[inline]
pub fn ends_sentence(fragment: &str) -> bool {
    SENTENCE_END.is_match(fragment)
}

/// Normalizes request text and enforces the length limits.
///
/// Empty input or input longer than [`MAX_TEXT_CHARS`] is a validation error.
pub fn prepare_text(input: TextInput, remove_ssml_tags: bool) -> TtsResult<Vec<String>> {
    let segments: Vec<String> = if remove_ssml_tags {
        input.0.iter().map(|s| strip_ssml(s)).collect()
    } else {
        input.0
    };

    if segments.iter().all(|s| s.trim().is_empty()) {
        return Err(TtsError::Validation("text must not be empty".to_string()));
    }
    let chars: usize = segments.iter().map(|s| s.chars().count()).sum();
    if chars > MAX_TEXT_CHARS {
        return Err(TtsError::Validation(format!(
            "text is {chars} characters long; the limit is {MAX_TEXT_CHARS}"
        )));
    }
    Ok(segments)
}

/// Accumulates streamed fragments into whole sentences.
///
/// Fragments are trimmed and joined with a single space. A sentence is released as
/// soon as a fragment ends with sentence punctuation; whatever is left is released by
/// [`finish`](Self::finish).
#[derive(Debug, Default)]
pub struct SentenceBatcher {
    buffer: String,
}

impl SentenceBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: &str) -> Option<String> {
        let trimmed = fragment.trim();
        if trimmed.is_empty() {
            return None;
        }
        if !self.buffer.is_empty() {
            self.buffer.push(' ');
        }
        self.buffer.push_str(trimmed);
        ends_sentence(trimmed).then(|| std::mem::take(&mut self.buffer))
    }

    pub fn finish(&mut self) -> Option<String> {
        (!self.buffer.is_empty()).then(|| std::mem::take(&mut self.buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_text_strips_markup_when_asked() {
        let text = prepare_text("<speak>Hello <b>there</b></speak>".into(), true).unwrap();
        assert_eq!(text, vec!["Hello there".to_string()]);

        let text = prepare_text("<b>kept</b>".into(), false).unwrap();
        assert_eq!(text, vec!["<b>kept</b>".to_string()]);
    }

    #[test]
    fn test_prepare_text_limits() {
        assert!(matches!(
            prepare_text("   ".into(), false),
            Err(TtsError::Validation(_))
        ));
        assert!(matches!(
            prepare_text(TextInput::default(), false),
            Err(TtsError::Validation(_))
        ));
        let long = "a".repeat(MAX_TEXT_CHARS + 1);
        assert!(matches!(
            prepare_text(long.into(), false),
            Err(TtsError::Validation(_))
        ));
        let exact = "a".repeat(MAX_TEXT_CHARS);
        assert!(prepare_text(exact.into(), false).is_ok());
    }

    #[test]
    fn test_sentence_end() {
        assert!(ends_sentence("Hello."));
        assert!(ends_sentence("Wait…"));
        assert!(ends_sentence("really?"));
        assert!(!ends_sentence("Hello"));
        assert!(!ends_sentence("Hello. world"));
    }

    #[test]
    fn test_sentence_batcher() {
        let mut batcher = SentenceBatcher::new();
        assert_eq!(batcher.push("  Hello "), None);
        assert_eq!(batcher.push("world."), Some("Hello world.".to_string()));
        assert_eq!(batcher.push(""), None);
        assert_eq!(batcher.push("How are"), None);
        assert_eq!(batcher.push("you"), None);
        assert_eq!(batcher.finish(), Some("How are you".to_string()));
        assert_eq!(batcher.finish(), None);
    }
}
