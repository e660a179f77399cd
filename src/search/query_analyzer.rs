use std::sync::OnceLock;

use regex::Regex;

/// Query genre, used to tune vector/lexical fusion weights (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryClass {
    Question,
    Keyword,
    Phrase,
    Code,
    Exact,
    LongForm,
    Unknown,
}

fn interrogative_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(what|who|when|where|why|how|which|is|are|can|could|does|do|did|should|will)\b").unwrap()
    })
}

fn quoted_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("\"[^\"]+\"").unwrap())
}

fn code_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(::|->|=>|\bfn\b|\bdef\b|\bclass\b|\{|\}|\(\)|;|==|!=)").unwrap())
}

/// Classifies a raw query string into a `QueryClass` by regex family
/// (leading interrogatives, quoted spans, code tokens/punctuation, length).
pub struct QueryAnalyzer;

impl QueryAnalyzer {
    pub fn classify(query: &str) -> QueryClass {
        let trimmed = query.trim();
        if trimmed.is_empty() {
            return QueryClass::Unknown;
        }

        if quoted_re().is_match(trimmed) {
            return QueryClass::Exact;
        }
        if code_token_re().is_match(trimmed) {
            return QueryClass::Code;
        }
        if interrogative_re().is_match(trimmed) || trimmed.ends_with('?') {
            return QueryClass::Question;
        }

        let word_count = trimmed.split_whitespace().count();
        if word_count == 0 {
            return QueryClass::Unknown;
        }
        if word_count == 1 {
            return QueryClass::Keyword;
        }
        if trimmed.len() > 200 {
            return QueryClass::LongForm;
        }
        if word_count <= 4 {
            return QueryClass::Phrase;
        }

        QueryClass::Unknown
    }
}

/// Given base weights `(w_v, w_f)` (normally 0.6/0.4, summing to 1), returns
/// genre-tuned weights per the §4.7 table. The result always sums to 1.
pub struct WeightAdjuster;

impl WeightAdjuster {
    pub fn adjust(class: QueryClass, w_v: f32, w_f: f32) -> (f32, f32) {
        match class {
            QueryClass::Question => {
                let v = (w_v + 0.2).min(0.8);
                (v, 1.0 - v)
            }
            QueryClass::Keyword => {
                let f = (w_f + 0.2).min(0.8);
                (1.0 - f, f)
            }
            QueryClass::Phrase => {
                let v = (w_v + 0.1).min(0.7);
                (v, 1.0 - v)
            }
            QueryClass::Code => {
                let f = (w_f + 0.3).min(0.9);
                (1.0 - f, f)
            }
            QueryClass::Exact => (0.1, 0.9),
            QueryClass::LongForm => {
                let v = (w_v + 0.3).min(0.8);
                (v, 1.0 - v)
            }
            QueryClass::Unknown => (w_v, w_f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_question() {
        assert_eq!(QueryAnalyzer::classify("What is the capital of France?"), QueryClass::Question);
    }

    #[test]
    fn classifies_quoted_phrase_as_exact() {
        assert_eq!(QueryAnalyzer::classify("\"rate limit exceeded\""), QueryClass::Exact);
    }

    #[test]
    fn classifies_code_tokens() {
        assert_eq!(QueryAnalyzer::classify("fn main() -> Result<()>"), QueryClass::Code);
    }

    #[test]
    fn classifies_single_word_as_keyword() {
        assert_eq!(QueryAnalyzer::classify("authentication"), QueryClass::Keyword);
    }

    #[test]
    fn classifies_long_text_as_longform() {
        let long_query = "lorem ipsum ".repeat(30);
        assert_eq!(QueryAnalyzer::classify(&long_query), QueryClass::LongForm);
    }

    #[test]
    fn empty_query_is_unknown() {
        assert_eq!(QueryAnalyzer::classify("   "), QueryClass::Unknown);
    }

    #[test]
    fn adjusted_weights_always_sum_to_one() {
        for class in [
            QueryClass::Question,
            QueryClass::Keyword,
            QueryClass::Phrase,
            QueryClass::Code,
            QueryClass::Exact,
            QueryClass::LongForm,
            QueryClass::Unknown,
        ] {
            let (v, f) = WeightAdjuster::adjust(class, 0.6, 0.4);
            assert!((v + f - 1.0).abs() < 1e-6, "{class:?} weights did not sum to 1: {v} {f}");
        }
    }

    #[test]
    fn exact_class_heavily_favors_lexical() {
        let (v, f) = WeightAdjuster::adjust(QueryClass::Exact, 0.6, 0.4);
        assert_eq!(v, 0.1);
        assert_eq!(f, 0.9);
    }

    #[test]
    fn question_class_caps_vector_weight_at_point_eight() {
        let (v, _) = WeightAdjuster::adjust(QueryClass::Question, 0.7, 0.3);
        assert_eq!(v, 0.8);
    }
}
