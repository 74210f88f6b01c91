use std::collections::{BTreeSet, HashMap};

use anyhow::Result;

/// Character-level tokenizer. The vocabulary is every distinct character of
/// the corpus in sorted order, and a character's id is its index in that order.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    itos: Vec<char>,
    stoi: HashMap<char, i64>,
}

impl Tokenizer {
    pub fn from_corpus(corpus: &str) -> Self {
        let itos: Vec<char> = corpus.chars().collect::<BTreeSet<_>>().into_iter().collect();
        let stoi = itos
            .iter()
            .enumerate()
            .map(|(i, &c)| (c, i as i64))
            .collect();
        Tokenizer { itos, stoi }
    }

    pub fn vocab(&self) -> &[char] {
        &self.itos
    }

    pub fn vocab_size(&self) -> usize {
        self.itos.len()
    }

    pub fn encode(&self, text: &str) -> Result<Vec<i64>> {
        let mut tokens = Vec::with_capacity(text.len());
        for c in text.chars() {
            match self.stoi.get(&c) {
                Some(&id) => tokens.push(id),
                None => return Err(anyhow::anyhow!("Character not in vocabulary: {:?}", c)),
            }
        }
        Ok(tokens)
    }

    pub fn decode(&self, tokens: &[i64]) -> Result<String> {
        let mut text = String::with_capacity(tokens.len());
        for &token in tokens {
            let c = usize::try_from(token)
                .ok()
                .and_then(|i| self.itos.get(i))
                .ok_or_else(|| anyhow::anyhow!("Invalid token found: {}", token))?;
            text.push(*c);
        }
        Ok(text)
    }
}
