//! Text-trigger matching for response bodies

/// A trigger phrase found in scanned text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerMatch {
    pub category: u32,
    pub trigger: String,
}

/// Case-insensitive phrase matcher
#[derive(Debug, Clone, Default)]
pub struct TriggerMatcher {
    // (lowercased phrase, category, original phrase)
    phrases: Vec<(String, u32, String)>,
}

impl TriggerMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, phrase: &str, category: u32) {
        let trimmed = phrase.trim();
        if trimmed.is_empty() {
            return;
        }
        self.phrases
            .push((trimmed.to_lowercase(), category, trimmed.to_string()));
    }

    pub fn len(&self) -> usize {
        self.phrases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }

    /// Find the first trigger in the leading `max_bytes` of `text`, skipping
    /// categories rejected by `active`
    pub fn find(
        &self,
        text: &str,
        max_bytes: usize,
        active: impl Fn(u32) -> bool,
    ) -> Option<TriggerMatch> {
        if self.phrases.is_empty() {
            return None;
        }

        let haystack = truncate_at_char_boundary(text, max_bytes).to_lowercase();
        self.phrases
            .iter()
            .filter(|(_, category, _)| active(*category))
            .find(|(needle, _, _)| haystack.contains(needle.as_str()))
            .map(|(_, category, original)| TriggerMatch {
                category: *category,
                trigger: original.clone(),
            })
    }
}

fn truncate_at_char_boundary(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
