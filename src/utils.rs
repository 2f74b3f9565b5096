use chrono::Utc;
use rand::Rng;

/// Builds an identifier of the form `<prefix>-<unix millis>-<random hex>`.
pub fn generate_id(prefix: &str) -> String {
    let millis = Utc::now().timestamp_millis();
    let suffix: u32 = rand::thread_rng().gen();
    format!("{}-{}-{:08x}", prefix, millis, suffix)
}

/// Truncates to at most `max_chars` characters, never splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Character count of the trimmed text. Section length thresholds are expressed in
/// characters so that CJK and latin text are measured alike.
pub fn trimmed_char_len(text: &str) -> usize {
    text.trim().chars().count()
}
