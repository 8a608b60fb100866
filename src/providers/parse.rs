// Deterministic parsing of labelled metadata completions
//
// Providers are instructed to answer with labelled lines:
//
//   Title: ...
//   Description: ...
//   Keywords: a, b, c, ...
//
// Parsing is strict about outcome, lenient about formatting (markdown bold,
// list bullets, varying case). A response below the quality bar is an error,
// never degraded output: the retry loop decides what happens next.

use crate::core::errors::{ProviderError, ProviderResult};
use crate::core::types::{PromptSettings, StockMetadata};

/// Strip list bullets, markdown emphasis and stray whitespace from a line.
fn clean_line(line: &str) -> String {
    line.trim()
        .trim_start_matches(['-', '*', '#'])
        .trim()
        .replace("**", "")
}

/// Case-insensitive label match; returns the remainder after the label.
fn strip_label<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    let lower = line.to_lowercase();
    let prefix = format!("{label}:");
    if lower.starts_with(&prefix) {
        Some(line[prefix.len()..].trim_start())
    } else {
        None
    }
}

fn split_keywords(raw: &str, cap: usize) -> Vec<String> {
    let mut seen = Vec::new();
    let mut keywords = Vec::new();
    for part in raw.split(',') {
        let keyword = part.trim().trim_end_matches('.').trim().to_string();
        if keyword.is_empty() {
            continue;
        }
        let folded = keyword.to_lowercase();
        if seen.contains(&folded) {
            continue;
        }
        seen.push(folded);
        keywords.push(keyword);
        if keywords.len() == cap {
            break;
        }
    }
    keywords
}

/// A title the model left as a template slot rather than filling in.
fn looks_like_placeholder(title: &str) -> bool {
    let lower = title.to_lowercase();
    (title.contains('[') && title.contains(']'))
        || lower == "untitled"
        || lower == "title"
        || lower.starts_with("insert ")
        || lower.contains("your title")
}

/// Parse a single labelled response into metadata, enforcing the
/// minimum-quality bar from the prompt settings.
pub fn parse_metadata(text: &str, settings: &PromptSettings) -> ProviderResult<StockMetadata> {
    let mut title = String::new();
    let mut description = String::new();
    let mut keywords_raw = String::new();
    let mut in_keywords = false;
    let mut any_label = false;

    for raw_line in text.lines() {
        let line = clean_line(raw_line);
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = strip_label(&line, "title") {
            title = rest.to_string();
            in_keywords = false;
            any_label = true;
        } else if let Some(rest) = strip_label(&line, "description") {
            description = rest.to_string();
            in_keywords = false;
            any_label = true;
        } else if let Some(rest) = strip_label(&line, "keywords") {
            keywords_raw = rest.to_string();
            in_keywords = true;
            any_label = true;
        } else if in_keywords {
            // Keyword lists sometimes wrap across lines.
            keywords_raw.push(',');
            keywords_raw.push_str(&line);
        }
    }

    if !any_label {
        return Err(ProviderError::EmptyResponse(
            "no Title/Description/Keywords labels found".to_string(),
        ));
    }

    let keywords = split_keywords(&keywords_raw, settings.max_keywords);

    if title.is_empty() {
        return Err(ProviderError::QualityBelowBar("empty title".to_string()));
    }
    if looks_like_placeholder(&title) {
        return Err(ProviderError::QualityBelowBar(format!(
            "placeholder title: {title:?}"
        )));
    }
    if description.is_empty() {
        return Err(ProviderError::QualityBelowBar("empty description".to_string()));
    }
    if keywords.len() < settings.min_keywords {
        return Err(ProviderError::QualityBelowBar(format!(
            "{} keywords, need at least {}",
            keywords.len(),
            settings.min_keywords
        )));
    }

    Ok(StockMetadata {
        title,
        description,
        keywords,
    })
}

/// Parse a multi-image completion: one labelled block per image, separated by
/// `---` lines. The block count must match the image count exactly so results
/// can be bound back to their slots.
pub fn parse_metadata_blocks(
    text: &str,
    expected: usize,
    settings: &PromptSettings,
) -> ProviderResult<Vec<StockMetadata>> {
    let blocks: Vec<&str> = text
        .split("\n---")
        .map(|b| b.trim_start_matches(['-', '\n', ' ']))
        .filter(|b| !b.trim().is_empty())
        .collect();

    if blocks.len() != expected {
        return Err(ProviderError::EmptyResponse(format!(
            "expected {expected} metadata blocks, found {}",
            blocks.len()
        )));
    }

    blocks
        .into_iter()
        .map(|block| parse_metadata(block, settings))
        .collect()
}
