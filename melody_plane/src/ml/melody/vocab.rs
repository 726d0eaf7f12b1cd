use std::{collections::HashMap, sync::Arc};

use anyhow::{Context, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::MelodyError;

/// Closed alphabet of melody symbols. Indices follow sorted symbol order, so the same
/// corpus always yields the same mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "Symbols", into = "Symbols")]
pub struct Vocab {
    symbols: Vec<char>,
    encoder: Arc<HashMap<char, usize>>,
}

#[derive(Serialize, Deserialize)]
struct Symbols {
    symbols: String,
}

impl From<Symbols> for Vocab {
    fn from(value: Symbols) -> Self {
        Self::from_symbols(value.symbols.chars().collect())
    }
}

impl From<Vocab> for Symbols {
    fn from(value: Vocab) -> Self {
        Self {
            symbols: value.symbols.iter().collect(),
        }
    }
}

impl PartialEq for Vocab {
    fn eq(&self, other: &Self) -> bool {
        self.symbols == other.symbols
    }
}

impl Vocab {
    pub fn from_corpus<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let symbols = lines
            .into_iter()
            .flat_map(|line| line.as_ref().chars().collect_vec())
            .sorted()
            .dedup()
            .collect();

        Self::from_symbols(symbols)
    }

    fn from_symbols(symbols: Vec<char>) -> Self {
        let encoder = symbols
            .iter()
            .enumerate()
            .map(|(idx, symbol)| (*symbol, idx))
            .collect();

        Self {
            symbols,
            encoder: Arc::new(encoder),
        }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn symbols(&self) -> &[char] {
        &self.symbols
    }

    pub fn encode(&self, input: &str) -> Result<Vec<usize>> {
        input.chars().map(|c| self.token_encode(c)).collect()
    }

    pub fn decode(&self, input: &[usize]) -> Result<String> {
        input
            .iter()
            .map(|&idx| {
                self.token_decode(idx)
                    .with_context(|| format!("token index {idx} not in vocab of {}", self.len()))
            })
            .collect()
    }

    pub fn token_encode(&self, symbol: char) -> Result<usize> {
        Ok(self
            .encoder
            .get(&symbol)
            .copied()
            .ok_or(MelodyError::UnknownSymbol(symbol))?)
    }

    pub fn token_decode(&self, encoded: usize) -> Option<char> {
        self.symbols.get(encoded).copied()
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn vocab_is_sorted_and_deduplicated() {
        let vocab = Vocab::from_corpus(["GGR", "AABR"]);
        assert_eq!(&['A', 'B', 'G', 'R'], vocab.symbols());
        assert_eq!(4, vocab.len());
    }

    #[test]
    fn vocab_is_deterministic() {
        let corpus = ["C#DE", "RRC", "ED#"];
        let first = Vocab::from_corpus(corpus);
        let second = Vocab::from_corpus(corpus.iter().rev());
        assert_eq!(first, second);
    }

    #[test]
    fn vocab_round_trips_corpus_lines() {
        let corpus = ["AABR", "GGR", "", "RBGA"];
        let vocab = Vocab::from_corpus(corpus);

        for line in corpus {
            let encoded = vocab.encode(line).unwrap();
            assert_eq!(line, vocab.decode(&encoded).unwrap());
        }
    }

    #[test]
    fn vocab_rejects_unknown_symbols() {
        let vocab = Vocab::from_corpus(["AB"]);
        let err = vocab.encode("AXB").unwrap_err();

        assert_eq!(
            Some(&MelodyError::UnknownSymbol('X')),
            err.downcast_ref::<MelodyError>()
        );
        assert!(vocab.decode(&[2]).is_err());
    }

    #[test]
    fn vocab_round_trips_through_json() {
        let vocab = Vocab::from_corpus(["GAR#"]);
        let json = serde_json::to_string(&vocab).unwrap();
        assert_eq!(r##"{"symbols":"#AGR"}"##, json);

        let restored: Vocab = serde_json::from_str(&json).unwrap();
        assert_eq!(vocab, restored);
        assert_eq!(vec![1, 3], restored.encode("AR").unwrap());
    }
}
