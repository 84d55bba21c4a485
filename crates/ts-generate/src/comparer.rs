//! Token sequence equality that ignores special tokens

use std::collections::HashSet;

/// Compares the leading `length` non-special tokens of two sequences
#[derive(Debug, Clone, Default)]
pub struct SequenceComparer {
    special_tokens: HashSet<i64>,
    length: usize,
}

impl SequenceComparer {
    pub fn new(special_tokens: impl IntoIterator<Item = i64>, length: usize) -> Self {
        Self {
            special_tokens: special_tokens.into_iter().collect(),
            length,
        }
    }

    fn content<'a>(&'a self, tokens: &'a [i64]) -> impl Iterator<Item = i64> + 'a {
        tokens
            .iter()
            .copied()
            .filter(|token| !self.special_tokens.contains(token))
            .take(self.length)
    }

    /// Always false when `length` is 0
    pub fn equals(&self, a: &[i64], b: &[i64]) -> bool {
        self.length > 0 && self.content(a).eq(self.content(b))
    }
}
