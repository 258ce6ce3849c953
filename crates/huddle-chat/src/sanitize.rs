use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

/// Turns untrusted message text into something safe to store and render.
pub trait Sanitizer: Send + Sync {
    fn sanitize(&self, input: &str) -> String;
}

/// Tags whose content is dropped along with the tag itself.
static DANGEROUS_BLOCKS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?is)<\s*(script|style|iframe|object|embed|applet)\b[^>]*>",
        r".*?<\s*/\s*(script|style|iframe|object|embed|applet)\s*>",
    ))
    .expect("static regex")
});

static DANGEROUS_OPEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<\s*/?\s*(script|style|iframe|object|embed|applet)\b[^>]*>")
        .expect("static regex")
});

static ANY_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<\s*(/?)\s*([a-zA-Z][a-zA-Z0-9]*)\b[^>]*>").expect("static regex"));

const ALLOWED_TAGS: &[&str] = &[
    "b", "i", "u", "strong", "em", "code", "pre", "br", "p", "span", "div", "blockquote", "ul",
    "ol", "li", "h1", "h2", "h3", "h4", "h5", "h6",
];

/// Default sanitizer: removes script-like blocks with their content, keeps a
/// small set of formatting tags with every attribute stripped, drops all
/// other tags, and trims surrounding whitespace.
#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlSanitizer;

impl Sanitizer for HtmlSanitizer {
    fn sanitize(&self, input: &str) -> String {
        if input.is_empty() {
            return String::new();
        }

        let without_blocks = DANGEROUS_BLOCKS.replace_all(input, "");
        let without_open = DANGEROUS_OPEN.replace_all(&without_blocks, "");
        let cleaned = ANY_TAG.replace_all(&without_open, |caps: &regex::Captures<'_>| {
            let name = caps[2].to_ascii_lowercase();
            if ALLOWED_TAGS.contains(&name.as_str()) {
                format!("<{}{}>", &caps[1], name)
            } else {
                String::new()
            }
        });
        let cleaned = cleaned.trim().to_string();

        let removed = input.len().saturating_sub(cleaned.len());
        if removed * 10 > input.len() * 3 {
            warn!(
                "Sanitizer removed {} of {} bytes from message content",
                removed,
                input.len()
            );
        }
        cleaned
    }
}

/// Makes an uploaded file name safe to store and echo back: path components,
/// control characters and shell/markup metacharacters are dropped, and the
/// result is capped at 255 bytes with the extension preserved.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    const MAX_LEN: usize = 255;

    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, '<' | '>' | ':' | '"' | '|' | '?' | '*'))
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        return None;
    }
    if cleaned.len() <= MAX_LEN {
        return Some(cleaned);
    }

    let (stem, ext) = match cleaned.rfind('.') {
        Some(dot) if cleaned.len() - dot <= 16 => cleaned.split_at(dot),
        _ => (cleaned.as_str(), ""),
    };
    let mut end = MAX_LEN - ext.len();
    while !stem.is_char_boundary(end) {
        end -= 1;
    }
    Some(format!("{}{}", &stem[..end], ext))
}
