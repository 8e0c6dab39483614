use std::collections::HashSet;

/// English stop words dropped before scoring.
const STOP_WORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "am", "an", "and", "any", "are",
    "as", "at", "be", "because", "been", "before", "being", "below", "between", "both", "but",
    "by", "can", "did", "do", "does", "doing", "down", "during", "each", "few", "for", "from",
    "further", "had", "has", "have", "having", "he", "her", "here", "hers", "herself", "him",
    "himself", "his", "how", "i", "if", "in", "into", "is", "it", "its", "itself", "just", "me",
    "more", "most", "my", "myself", "no", "nor", "not", "now", "of", "off", "on", "once", "only",
    "or", "other", "our", "ours", "ourselves", "out", "over", "own", "same", "she", "should",
    "so", "some", "such", "than", "that", "the", "their", "theirs", "them", "themselves", "then",
    "there", "these", "they", "this", "those", "through", "to", "too", "under", "until", "up",
    "very", "was", "we", "were", "what", "when", "where", "which", "while", "who", "whom", "why",
    "will", "with", "you", "your", "yours", "yourself", "yourselves",
];

/// Normalises raw text into the tokens the classifier was trained on.
///
/// Lowercases, splits on anything that is not alphanumeric and drops stop
/// words.
#[derive(Debug, Clone)]
pub struct TextPreprocessor {
    stop_words: HashSet<&'static str>,
}

impl Default for TextPreprocessor {
    fn default() -> Self {
        Self {
            stop_words: STOP_WORDS.iter().copied().collect(),
        }
    }
}

impl TextPreprocessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tokens(&self, text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty() && !self.stop_words.contains(t))
            .map(str::to_string)
            .collect()
    }

    pub fn preprocess(&self, text: &str) -> String {
        self.tokens(text).join(" ")
    }
}
