//! Compiled grammar and the per-generation cursor that walks it.

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use kindle_core::{KindleError, Result, TokenId, Vocabulary};

use super::fsm::{FsmConstraint, TokenFsmIndex, TokenVocab};
use super::gbnf::gbnf_to_regex;
use super::regex::build_regex_fsm;
use crate::candidates::CandidateSet;

/// A grammar indexed against one vocabulary. Immutable, shared via `Arc`.
pub struct Grammar {
    index: TokenFsmIndex,
    pattern: String,
}

impl Grammar {
    pub fn from_regex(pattern: &str, vocab: &dyn Vocabulary) -> Result<Self> {
        let token_vocab = TokenVocab::from_vocabulary(vocab);
        let index = build_regex_fsm(pattern, &token_vocab)?;
        debug!(
            states = index.n_states(),
            n_vocab = token_vocab.vocab_size(),
            "compiled grammar"
        );
        Ok(Self {
            index,
            pattern: pattern.to_string(),
        })
    }

    pub fn from_gbnf(src: &str, vocab: &dyn Vocabulary) -> Result<Self> {
        let pattern = gbnf_to_regex(src)?;
        Self::from_regex(&pattern, vocab)
    }

    /// Read and compile a GBNF file.
    pub fn load(path: impl AsRef<Path>, vocab: &dyn Vocabulary) -> Result<Self> {
        let path = path.as_ref();
        let src = std::fs::read_to_string(path).map_err(|e| {
            KindleError::GrammarParse(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_gbnf(&src, vocab)
    }

    /// The regular expression the grammar was compiled from.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn constraint(&self) -> &dyn FsmConstraint {
        &self.index
    }
}

/// Cursor into a [`Grammar`], advanced once per accepted token.
#[derive(Clone)]
pub struct GrammarState {
    grammar: Arc<Grammar>,
    state: u32,
}

impl GrammarState {
    pub fn new(grammar: Arc<Grammar>) -> Self {
        let state = grammar.constraint().initial_state();
        Self { grammar, state }
    }

    pub fn load(path: impl AsRef<Path>, vocab: &dyn Vocabulary) -> Result<Self> {
        Ok(Self::new(Arc::new(Grammar::load(path, vocab)?)))
    }

    pub fn from_gbnf(src: &str, vocab: &dyn Vocabulary) -> Result<Self> {
        Ok(Self::new(Arc::new(Grammar::from_gbnf(src, vocab)?)))
    }

    pub fn from_regex(pattern: &str, vocab: &dyn Vocabulary) -> Result<Self> {
        Ok(Self::new(Arc::new(Grammar::from_regex(pattern, vocab)?)))
    }

    pub fn grammar(&self) -> &Arc<Grammar> {
        &self.grammar
    }

    pub fn state(&self) -> u32 {
        self.state
    }

    pub fn allowed_tokens(&self) -> &[TokenId] {
        self.grammar
            .constraint()
            .allowed_tokens(self.state)
            .unwrap_or(&[])
    }

    pub fn is_allowed(&self, token_id: TokenId) -> bool {
        self.grammar.constraint().is_allowed(self.state, token_id)
    }

    /// Mask every candidate the grammar rejects. Fails with
    /// `GrammarExhausted` when nothing survives.
    pub fn apply(&self, candidates: &mut CandidateSet) -> Result<usize> {
        let constraint = self.grammar.constraint();
        let state = self.state;
        let survivors = candidates.mask(|id| constraint.is_allowed(state, id));
        if survivors == 0 {
            return Err(KindleError::GrammarExhausted);
        }
        Ok(survivors)
    }

    /// Advance by one chosen token.
    pub fn accept(&mut self, token_id: TokenId) -> Result<()> {
        let next = self
            .grammar
            .constraint()
            .next_state(self.state, token_id)
            .ok_or(KindleError::GrammarRejected { token: token_id })?;
        self.state = next;
        Ok(())
    }

    /// Whether the text accepted so far is a complete sentence.
    pub fn is_accepting(&self) -> bool {
        self.grammar.constraint().is_final_state(self.state)
    }

    pub fn reset(&mut self) {
        self.state = self.grammar.constraint().initial_state();
    }
}

impl std::fmt::Debug for GrammarState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrammarState")
            .field("pattern", &self.grammar.pattern)
            .field("state", &self.state)
            .finish()
    }
}
