//! BM25 lexical model backing sparse vectors.
//!
//! The model is fit once over the plain-text corpus (term vocabulary,
//! document frequencies, average length) and then encodes arbitrary text
//! into a term-index → weight sparse vector. Term indices are assigned in
//! first-seen corpus order, so a given corpus always produces the same
//! vocabulary.
//!
//! Before `fit` has run, `encode` returns the sentinel vector rather than
//! an error: dense-only retrieval keeps working, the lexical boost simply
//! contributes nothing.

use std::collections::HashMap;

use crate::models::SparseVector;

const K1: f64 = 1.5;
const B: f64 = 0.75;

/// Okapi BM25 statistics over a fitted corpus.
#[derive(Debug, Default)]
pub struct LexicalModel {
    vocab: HashMap<String, u32>,
    doc_freq: Vec<u32>,
    doc_count: usize,
    avg_len: f64,
}

impl LexicalModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fit(&self) -> bool {
        self.doc_count > 0
    }

    /// Number of distinct terms in the fitted vocabulary.
    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    /// Fit the model over a corpus of plain-text documents. Replaces any
    /// previous fit. Documents that tokenize to nothing are ignored.
    pub fn fit<S: AsRef<str>>(&mut self, corpus: &[S]) {
        self.vocab.clear();
        self.doc_freq.clear();
        self.doc_count = 0;
        self.avg_len = 0.0;

        let mut total_len = 0usize;

        for doc in corpus {
            let tokens = tokenize(doc.as_ref());
            if tokens.is_empty() {
                continue;
            }
            self.doc_count += 1;
            total_len += tokens.len();

            let mut seen: HashMap<&str, ()> = HashMap::new();
            for token in &tokens {
                if seen.insert(token.as_str(), ()).is_none() {
                    let next_index = self.vocab.len() as u32;
                    let index = *self.vocab.entry(token.clone()).or_insert(next_index);
                    let index = index as usize;
                    if index >= self.doc_freq.len() {
                        self.doc_freq.resize(index + 1, 0);
                    }
                    self.doc_freq[index] += 1;
                }
            }
        }

        if self.doc_count > 0 {
            self.avg_len = total_len as f64 / self.doc_count as f64;
        }
    }

    /// Encode text into a sparse vector of BM25 weights over the fitted
    /// vocabulary. Unknown terms are dropped; indices are ascending.
    pub fn encode(&self, text: &str) -> SparseVector {
        if !self.is_fit() {
            return SparseVector::sentinel();
        }

        let tokens = tokenize(text);
        if tokens.is_empty() {
            return SparseVector::sentinel();
        }

        let len = tokens.len() as f64;
        let mut term_freq: HashMap<u32, u32> = HashMap::new();
        for token in &tokens {
            if let Some(&index) = self.vocab.get(token.as_str()) {
                *term_freq.entry(index).or_insert(0) += 1;
            }
        }
        if term_freq.is_empty() {
            return SparseVector::sentinel();
        }

        let mut pairs: Vec<(u32, f32)> = term_freq
            .into_iter()
            .map(|(index, tf)| {
                let df = f64::from(self.doc_freq[index as usize]);
                let n = self.doc_count as f64;
                let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                let tf = f64::from(tf);
                let norm = K1 * (1.0 - B + B * len / self.avg_len);
                let weight = idf * (tf * (K1 + 1.0)) / (tf + norm);
                (index, weight as f32)
            })
            .filter(|(_, w)| *w > 0.0)
            .collect();

        if pairs.is_empty() {
            return SparseVector::sentinel();
        }
        pairs.sort_by_key(|(index, _)| *index);

        SparseVector {
            indices: pairs.iter().map(|(i, _)| *i).collect(),
            values: pairs.iter().map(|(_, w)| *w).collect(),
        }
    }
}

/// Lowercased alphanumeric runs of length >= 2.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(|t| t.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_filters_short_tokens() {
        assert_eq!(
            tokenize("A deployment, of k8s!"),
            vec!["deployment", "k8s"]
        );
    }

    #[test]
    fn test_unfit_model_returns_sentinel() {
        let model = LexicalModel::new();
        assert!(model.encode("anything at all").is_sentinel());
    }

    #[test]
    fn test_fit_then_encode() {
        let mut model = LexicalModel::new();
        model.fit(&[
            "the deployment pipeline builds containers",
            "the payroll system exports reports",
        ]);
        assert!(model.is_fit());

        let vec = model.encode("deployment pipeline");
        assert!(!vec.is_sentinel());
        assert_eq!(vec.indices.len(), 2);
        assert!(vec.values.iter().all(|v| *v > 0.0));
    }

    #[test]
    fn test_rare_term_weighs_more() {
        let mut model = LexicalModel::new();
        // "system" appears in every document, "kubernetes" in one.
        model.fit(&[
            "kubernetes system notes",
            "billing system notes",
            "payroll system notes",
        ]);
        let rare = model.encode("kubernetes");
        let common = model.encode("system");
        assert!(rare.values[0] > common.values[0]);
    }

    #[test]
    fn test_unknown_terms_dropped() {
        let mut model = LexicalModel::new();
        model.fit(&["alpha beta gamma"]);
        assert!(model.encode("zeppelin quartz").is_sentinel());
    }

    #[test]
    fn test_encode_deterministic_and_sorted() {
        let mut model = LexicalModel::new();
        model.fit(&["one two three four five", "three four five six"]);
        let a = model.encode("five three one");
        let b = model.encode("five three one");
        assert_eq!(a, b);
        assert!(a.indices.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_refit_replaces_vocabulary() {
        let mut model = LexicalModel::new();
        model.fit(&["alpha beta"]);
        assert_eq!(model.vocab_size(), 2);
        model.fit(&["gamma delta epsilon"]);
        assert_eq!(model.vocab_size(), 3);
        assert!(model.encode("alpha").is_sentinel());
    }
}
