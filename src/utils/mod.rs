pub mod text;

pub use text::{MAX_TEXT_CHARS, SentenceBatcher, TextInput, prepare_text, strip_ssml};
