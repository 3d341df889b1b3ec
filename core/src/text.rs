//! Chat message → speakable text.
//!
//! Order matters: custom emoji markup is removed first, then URLs are
//! replaced, then the guild dictionary is applied in a single pass (longer
//! words win over their prefixes), and finally the result is capped.

use crate::config::TextConfig;
use crate::{Result, VcReadError};
use regex::Regex;
use std::collections::BTreeMap;

pub struct TextPipeline {
    cfg: TextConfig,
    custom_emoji: Regex,
    url: Regex,
}

impl TextPipeline {
    pub fn new(cfg: TextConfig) -> Result<Self> {
        let custom_emoji = Regex::new(r"<a?:[^:\s>]+:\d+>")
            .map_err(|e| VcReadError::ConfigError(format!("emoji pattern: {e}")))?;
        let url = Regex::new(r"(?i)https?://\S+")
            .map_err(|e| VcReadError::ConfigError(format!("url pattern: {e}")))?;
        Ok(Self {
            cfg,
            custom_emoji,
            url,
        })
    }

    /// Text to read for a message, or `None` when there is nothing to say
    pub fn prepare(
        &self,
        content: &str,
        has_image: bool,
        dictionary: &BTreeMap<String, String>,
    ) -> Option<String> {
        if has_image {
            return Some(self.cfg.image_placeholder.clone());
        }

        let text = self.custom_emoji.replace_all(content, "");
        let text = self
            .url
            .replace_all(&text, regex::NoExpand(&self.cfg.url_replacement));
        let text = apply_dictionary(&text, dictionary);

        if text.trim().is_empty() {
            return None;
        }
        Some(self.truncate(text))
    }

    fn truncate(&self, text: String) -> String {
        let max = self.cfg.max_read_length;
        match text.char_indices().nth(max) {
            Some((cut, _)) if max > 0 => format!("{}{}", &text[..cut], self.cfg.truncation_suffix),
            _ => text,
        }
    }
}

/// Replace dictionary words with their readings in one left-to-right pass
pub fn apply_dictionary(text: &str, dictionary: &BTreeMap<String, String>) -> String {
    let mut words: Vec<&String> = dictionary.keys().filter(|w| !w.is_empty()).collect();
    if words.is_empty() {
        return text.to_string();
    }
    words.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()));

    let pattern = words
        .iter()
        .map(|w| regex::escape(w))
        .collect::<Vec<_>>()
        .join("|");
    let Ok(re) = Regex::new(&pattern) else {
        return text.to_string();
    };
    re.replace_all(text, |caps: &regex::Captures| {
        dictionary
            .get(&caps[0])
            .cloned()
            .unwrap_or_else(|| caps[0].to_string())
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(max: usize) -> TextPipeline {
        TextPipeline::new(TextConfig {
            max_read_length: max,
            url_replacement: "URL".into(),
            image_placeholder: "image".into(),
            truncation_suffix: " (omitted)".into(),
        })
        .unwrap()
    }

    fn dict(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_strips_custom_emoji_and_replaces_urls() {
        let p = pipeline(100);
        let out = p
            .prepare("hi <:wave:12345> see https://example.com/a?b=1 now <a:spin:9>", false, &BTreeMap::new())
            .unwrap();
        assert_eq!(out, "hi  see URL now ");
    }

    #[test]
    fn test_image_is_read_as_placeholder() {
        assert_eq!(pipeline(100).prepare("", true, &BTreeMap::new()).unwrap(), "image");
    }

    #[test]
    fn test_empty_after_cleanup_is_skipped() {
        assert!(pipeline(100).prepare(" <:x:1> ", false, &BTreeMap::new()).is_none());
    }

    #[test]
    fn test_truncates_by_characters() {
        let out = pipeline(3).prepare("あいうえお", false, &BTreeMap::new()).unwrap();
        assert_eq!(out, "あいう (omitted)");
        assert_eq!(pipeline(5).prepare("あいうえお", false, &BTreeMap::new()).unwrap(), "あいうえお");
    }

    #[test]
    fn test_dictionary_prefers_longer_words_in_one_pass() {
        let d = dict(&[("rs", "rust"), ("rsx", "react"), ("rust", "crab")]);
        // replacements are not fed back into the dictionary
        assert_eq!(apply_dictionary("rsx rs", &d), "react rust");
    }

    #[test]
    fn test_dictionary_escapes_metacharacters() {
        let d = dict(&[("c++", "see plus plus")]);
        assert_eq!(apply_dictionary("I like c++", &d), "I like see plus plus");
    }
}
