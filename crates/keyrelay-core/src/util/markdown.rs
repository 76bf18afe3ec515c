use once_cell::sync::Lazy;
use regex::Regex;

static FENCED_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_+#.-]*[ \t]*\r?\n(.*?)\r?\n?```").expect("valid fence regex")
});

/// Pull the body of the first fenced code block out of a markdown answer.
/// Returns the trimmed input unchanged when there is no fence.
pub fn extract_code_block(content: &str) -> String {
    match FENCED_BLOCK.captures(content).and_then(|c| c.get(1)) {
        Some(body) => body.as_str().trim_end().to_string(),
        None => content.trim().to_string(),
    }
}
