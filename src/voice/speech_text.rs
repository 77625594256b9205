//! Turning a display reply into text worth speaking.
//!
//! Replies are written for a screen: markdown emphasis, code, links and lists
//! read badly out loud, and long answers take minutes to speak. The display
//! text and the stored text are never touched; only the synthesizer input is.

use regex::Regex;
use std::sync::OnceLock;

/// Shortest sentence-cut result that is kept before falling back to a
/// word-boundary cut.
const MIN_SENTENCE_CUT: usize = 100;

struct MarkdownRules {
    rules: Vec<(Regex, &'static str)>,
    blank_lines: Regex,
    sentence_end: Regex,
}

fn rules() -> &'static MarkdownRules {
    static RULES: OnceLock<MarkdownRules> = OnceLock::new();
    RULES.get_or_init(|| {
        // Order matters: bold before italic, fenced code before inline code,
        // images before links.
        let table: [(&str, &'static str); 11] = [
            (r"\*\*([^*]+)\*\*", "$1"),
            (r"\*([^*]+)\*", "$1"),
            (r"__([^_]+)__", "$1"),
            (r"_([^_]+)_", "$1"),
            (r"```[\s\S]*?```", ""),
            (r"`([^`]+)`", "$1"),
            (r"!\[([^\]]*)\]\([^)]+\)", "$1"),
            (r"\[([^\]]+)\]\([^)]+\)", "$1"),
            (r"(?m)^#{1,6}\s+", ""),
            (r"(?m)^[ \t]*[-*+]\s+", ""),
            (r"(?m)^\d+\.\s+", ""),
        ];
        MarkdownRules {
            rules: table
                .iter()
                .map(|(pattern, replacement)| (compile(pattern), *replacement))
                .collect(),
            blank_lines: compile(r"\n{3,}"),
            sentence_end: compile(r"[.!?]+\s+"),
        }
    })
}

fn compile(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(err) => panic!("built-in speech pattern {pattern:?} is invalid: {err}"),
    }
}

/// Strip markdown formatting, keeping the visible words.
pub fn clean_for_speech(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let rules = rules();
    let mut cleaned = text.to_string();
    for (regex, replacement) in &rules.rules {
        cleaned = regex.replace_all(&cleaned, *replacement).into_owned();
    }
    cleaned = rules.blank_lines.replace_all(&cleaned, "\n\n").into_owned();
    cleaned.trim().to_string()
}

/// Clean `text` and fit it into the speech budget.
///
/// Whole sentences are kept (at most `max_sentences`, at most `max_chars`
/// characters). When that yields nothing useful, the text is cut at the last
/// word boundary inside the budget instead and marked with `...`.
pub fn prepare_for_speech(text: &str, max_chars: usize, max_sentences: usize) -> String {
    let cleaned = clean_for_speech(text);
    if cleaned.chars().count() <= max_chars {
        return cleaned;
    }

    let mut result = String::new();
    let mut start = 0;
    for boundary in rules().sentence_end.find_iter(&cleaned).take(max_sentences) {
        let sentence = &cleaned[start..boundary.end()];
        if result.chars().count() + sentence.chars().count() > max_chars {
            break;
        }
        result.push_str(sentence);
        start = boundary.end();
    }

    if result.is_empty() || result.chars().count() < MIN_SENTENCE_CUT {
        return cut_at_word(&cleaned, max_chars);
    }
    result.trim_end().to_string()
}

fn cut_at_word(text: &str, max_chars: usize) -> String {
    let truncated: String = text.chars().take(max_chars).collect();
    // Only back off to a space when that keeps at least 80% of the budget.
    let keep_at_least = max_chars * 4 / 5;
    match truncated.rfind(' ') {
        Some(space) if truncated[..space].chars().count() > keep_at_least => {
            format!("{}...", &truncated[..space])
        }
        _ => format!("{truncated}..."),
    }
}
