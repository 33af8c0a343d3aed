use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Dimension of the hashed bag-of-words vector.
const FEATURE_DIMENSION: usize = 256;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "do", "for", "from", "give", "how",
    "in", "is", "it", "me", "of", "on", "or", "please", "show", "tell", "that", "the", "to",
    "us", "what", "which", "with",
];

/// Lowercase, collapse whitespace and trim trailing punctuation.
///
/// Two requests that normalize to the same string share an exact-tier key.
pub fn normalize(text: &str) -> String {
    let collapsed = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .trim_end()
        .to_string()
}

/// Lowercase alphanumeric tokens, single characters dropped.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() > 1)
        .collect()
}

/// Tokens with stop words removed.
pub fn keywords(text: &str) -> BTreeSet<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

/// Relative contribution of each signal to the similarity score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityWeights {
    /// Weight of the hashed bag-of-words cosine.
    #[serde(default = "default_cosine_weight")]
    pub cosine: f32,
    /// Weight of keyword-set overlap.
    #[serde(default = "default_jaccard_weight")]
    pub jaccard: f32,
    /// Weight of the token-count ratio.
    #[serde(default = "default_length_weight")]
    pub length: f32,
}

fn default_cosine_weight() -> f32 {
    0.6
}
fn default_jaccard_weight() -> f32 {
    0.3
}
fn default_length_weight() -> f32 {
    0.1
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            cosine: default_cosine_weight(),
            jaccard: default_jaccard_weight(),
            length: default_length_weight(),
        }
    }
}

/// Everything the similarity tier needs to compare two request texts.
#[derive(Debug, Clone, PartialEq)]
pub struct Features {
    vector: Vec<f32>,
    keywords: BTreeSet<String>,
    token_count: usize,
}

impl Features {
    /// Tokenize `text` and build its vector and keyword set.
    pub fn extract(text: &str) -> Self {
        let tokens = tokenize(text);
        let keywords: BTreeSet<String> = tokens
            .iter()
            .filter(|t| !STOP_WORDS.contains(&t.as_str()))
            .cloned()
            .collect();
        Self {
            vector: hashed_vector(&tokens),
            keywords,
            token_count: tokens.len(),
        }
    }

    /// Tokens left after stop-word removal.
    pub fn keywords(&self) -> &BTreeSet<String> {
        &self.keywords
    }

    /// Weighted score in `[0, 1]`.
    pub fn similarity(&self, other: &Features, weights: &SimilarityWeights) -> f32 {
        let total = weights.cosine + weights.jaccard + weights.length;
        if total <= 0.0 {
            return 0.0;
        }
        let score = weights.cosine * cosine_similarity(&self.vector, &other.vector)
            + weights.jaccard * jaccard(&self.keywords, &other.keywords)
            + weights.length * length_proximity(self.token_count, other.token_count);
        (score / total).clamp(0.0, 1.0)
    }
}

/// TF-weighted keywords hashed into three positions each, L2 normalized.
fn hashed_vector(tokens: &[String]) -> Vec<f32> {
    let mut vector = vec![0.0f32; FEATURE_DIMENSION];

    let mut freq: HashMap<&str, f32> = HashMap::new();
    for token in tokens {
        if !STOP_WORDS.contains(&token.as_str()) {
            *freq.entry(token.as_str()).or_insert(0.0) += 1.0;
        }
    }
    let total: f32 = freq.values().sum();
    if total == 0.0 {
        return vector;
    }

    for (word, count) in &freq {
        let tf = count / total;
        let bytes = word.as_bytes();
        vector[fnv1a(bytes, 0) as usize % FEATURE_DIMENSION] += tf;
        vector[fnv1a(bytes, 1) as usize % FEATURE_DIMENSION] += tf * 0.7;
        vector[fnv1a(bytes, 2) as usize % FEATURE_DIMENSION] += tf * 0.5;
    }

    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

/// FNV-1a over `data` followed by a salt byte (none for salt 0).
fn fnv1a(data: &[u8], salt: u8) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    let salt_bytes: &[u8] = if salt == 0 { &[] } else { std::slice::from_ref(&salt) };
    for &byte in data.iter().chain(salt_bytes) {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

/// Cosine of two equal-length vectors; 0 when either is all zeros.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Intersection over union; 1 for two empty sets.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f32;
    let union = a.union(b).count() as f32;
    intersection / union
}

/// `min/max` of the two token counts.
pub fn length_proximity(a: usize, b: usize) -> f32 {
    match a.max(b) {
        0 => 1.0,
        max => a.min(b) as f32 / max as f32,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(
            normalize("  Show   Total Sales\tby Region?! "),
            "show total sales by region"
        );
        assert_eq!(normalize("sales."), "sales");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn test_keywords_drop_stop_words() {
        let kw = keywords("Show me the total sales by region");
        assert_eq!(
            kw.into_iter().collect::<Vec<_>>(),
            ["region", "sales", "total"]
        );
    }

    #[test]
    fn test_vector_is_normalized_and_deterministic() {
        let a = Features::extract("quarterly revenue by product line");
        let b = Features::extract("quarterly revenue by product line");
        assert_eq!(a, b);
        let norm: f32 = a.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_similar_phrasing_scores_high() {
        let w = SimilarityWeights::default();
        let a = Features::extract("show total sales by region for 2023");
        let b = Features::extract("show the total sales by region for 2023");
        let c = Features::extract("weather forecast for tomorrow");
        let ab = a.similarity(&b, &w);
        let ac = a.similarity(&c, &w);
        assert!(ab > 0.9, "ab = {ab}");
        assert!(ac < 0.3, "ac = {ac}");
    }

    #[test]
    fn test_jaccard_and_length() {
        let a: BTreeSet<String> = ["sales", "region"].iter().map(|s| s.to_string()).collect();
        let b: BTreeSet<String> = ["sales", "country"].iter().map(|s| s.to_string()).collect();
        assert!((jaccard(&a, &b) - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(jaccard(&BTreeSet::new(), &BTreeSet::new()), 1.0);
        assert_eq!(length_proximity(4, 8), 0.5);
        assert_eq!(length_proximity(0, 0), 1.0);
    }

    #[test]
    fn test_empty_text_has_zero_vector() {
        let f = Features::extract("the of");
        assert!(f.keywords().is_empty());
        assert_eq!(cosine_similarity(&f.vector, &f.vector), 0.0);
    }
}
