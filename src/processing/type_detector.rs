use std::sync::OnceLock;

use regex::Regex;

/// Document genre, used to parametrize chunker sizing (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentGenre {
    Text,
    Code,
    Markdown,
    Html,
    Pdf,
    Structured,
    LongForm,
    Unknown,
}

fn code_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?m)^\s*(fn|def|func|class|struct|impl|import|package)\b",
            r"[{};]\s*$",
            r"(?m)^\s*//|^\s*#\[",
            r"=>|->|::",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

fn markdown_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [r"(?m)^#{1,6}\s", r"(?m)^\s*[-*+]\s", r"\[.+?\]\(.+?\)", r"```"]
            .iter()
            .map(|p| Regex::new(p).unwrap())
            .collect()
    })
}

fn html_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [r"(?i)<html", r"(?i)<div", r"(?i)<p>", r"(?i)</\w+>"]
            .iter()
            .map(|p| Regex::new(p).unwrap())
            .collect()
    })
}

fn structured_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [r"^\s*[\{\[]", r#""[\w-]+"\s*:"#, r"(?m)^\s*<\?xml", r"(?m)^[\w-]+:\s"]
            .iter()
            .map(|p| Regex::new(p).unwrap())
            .collect()
    })
}

fn longform_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [r"(?mi)^\s*chapter\s+\w+", r"(?mi)^\s*part\s+\w+", r"[.!?]\s+[A-Z]", r"\"[^\"]{20,}\""]
            .iter()
            .map(|p| Regex::new(p).unwrap())
            .collect()
    })
}

fn count_matches(patterns: &[Regex], content: &str) -> usize {
    patterns.iter().filter(|re| re.is_match(content)).count()
}

const GENRE_MATCH_THRESHOLD: usize = 2;

/// Classifies a document into one of the genres above. Dispatch is first by
/// file extension, then by regex pattern counts over content; a genre is
/// assigned iff at least `GENRE_MATCH_THRESHOLD` of its patterns match.
pub struct TypeDetector;

impl TypeDetector {
    pub fn detect(extension: Option<&str>, content: &str) -> DocumentGenre {
        if let Some(ext) = extension {
            if let Some(genre) = Self::from_extension(ext) {
                return genre;
            }
        }

        let scored = [
            (DocumentGenre::Html, count_matches(html_patterns(), content)),
            (DocumentGenre::Structured, count_matches(structured_patterns(), content)),
            (DocumentGenre::Code, count_matches(code_patterns(), content)),
            (DocumentGenre::Markdown, count_matches(markdown_patterns(), content)),
            (DocumentGenre::LongForm, count_matches(longform_patterns(), content)),
        ];

        scored
            .into_iter()
            .filter(|(_, score)| *score >= GENRE_MATCH_THRESHOLD)
            .max_by_key(|(_, score)| *score)
            .map(|(genre, _)| genre)
            .unwrap_or(DocumentGenre::Unknown)
    }

    fn from_extension(ext: &str) -> Option<DocumentGenre> {
        match ext.to_lowercase().as_str() {
            "md" | "markdown" => Some(DocumentGenre::Markdown),
            "html" | "htm" => Some(DocumentGenre::Html),
            "pdf" => Some(DocumentGenre::Pdf),
            "json" | "xml" | "yaml" | "yml" => Some(DocumentGenre::Structured),
            "rs" | "py" | "js" | "ts" | "go" | "java" | "c" | "cpp" | "rb" => Some(DocumentGenre::Code),
            "txt" => Some(DocumentGenre::Text),
            _ => None,
        }
    }
}
