//! Token-level automaton built over a byte-level DFA.

use std::collections::{HashMap, HashSet};

use kindle_core::{Result, TokenId, Vocabulary};

/// Token texts snapshotted from a vocabulary, built once per grammar.
pub struct TokenVocab {
    /// token_id -> token text
    pub id_to_token: Vec<String>,
    pub eos: TokenId,
}

impl TokenVocab {
    pub fn from_vocabulary(vocab: &dyn Vocabulary) -> Self {
        let id_to_token = (0..vocab.n_vocab() as TokenId)
            .map(|id| vocab.token_to_str(id).map(str::to_owned).unwrap_or_default())
            .collect();
        Self {
            id_to_token,
            eos: vocab.eos(),
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.id_to_token.len()
    }
}

/// A token-level generation constraint: a set of allowed tokens per state
/// and a successor state per allowed token.
pub trait FsmConstraint: Send + Sync {
    fn initial_state(&self) -> u32;

    /// Allowed tokens in `state`, `None` for an unknown state.
    fn allowed_tokens(&self, state: u32) -> Option<&[TokenId]>;

    /// Successor of `state` after `token_id`, `None` if the token is not allowed.
    fn next_state(&self, state: u32, token_id: TokenId) -> Option<u32>;

    fn is_final_state(&self, state: u32) -> bool;

    fn is_allowed(&self, state: u32, token_id: TokenId) -> bool {
        self.next_state(state, token_id).is_some()
    }
}

/// Pre-computed token index: for each DFA state, the vocabulary tokens that
/// keep the automaton inside the language, and where each one leads.
pub struct TokenFsmIndex {
    state_to_allowed: HashMap<u32, Vec<TokenId>>,
    transitions: HashMap<(u32, TokenId), u32>,
    final_states: HashSet<u32>,
    initial_state: u32,
}

impl TokenFsmIndex {
    pub fn new(
        state_to_allowed: HashMap<u32, Vec<TokenId>>,
        transitions: HashMap<(u32, TokenId), u32>,
        final_states: Vec<u32>,
        initial_state: u32,
    ) -> Self {
        Self {
            state_to_allowed,
            transitions,
            final_states: final_states.into_iter().collect(),
            initial_state,
        }
    }

    pub fn n_states(&self) -> usize {
        self.state_to_allowed.len()
    }
}

impl FsmConstraint for TokenFsmIndex {
    fn initial_state(&self) -> u32 {
        self.initial_state
    }

    fn allowed_tokens(&self, state: u32) -> Option<&[TokenId]> {
        self.state_to_allowed.get(&state).map(|v| v.as_slice())
    }

    fn next_state(&self, state: u32, token_id: TokenId) -> Option<u32> {
        self.transitions.get(&(state, token_id)).copied()
    }

    fn is_final_state(&self, state: u32) -> bool {
        self.final_states.contains(&state)
    }
}

/// Byte-level DFA as seen by the token index builder.
pub trait ByteDfa {
    fn initial_state(&self) -> u32;

    /// `None` when `byte` leads out of the language.
    fn next_state(&self, state: u32, byte: u8) -> Option<u32>;

    fn is_final_state(&self, state: u32) -> bool;

    fn all_states(&self) -> Vec<u32>;

    fn final_states(&self) -> Vec<u32> {
        self.all_states()
            .into_iter()
            .filter(|&s| self.is_final_state(s))
            .collect()
    }
}

/// Walk every vocabulary token through `dfa` from every state.
///
/// A token is allowed from a state when each of its bytes has a transition;
/// the state after its last byte is the successor. The end-of-sequence token
/// is allowed, as a self-loop, exactly in final states. Tokens with empty
/// text are never allowed.
pub fn build_token_index(dfa: &dyn ByteDfa, vocab: &TokenVocab) -> Result<TokenFsmIndex> {
    let all_states = dfa.all_states();
    let final_states = dfa.final_states();

    let mut state_to_allowed: HashMap<u32, Vec<TokenId>> = HashMap::new();
    let mut transitions: HashMap<(u32, TokenId), u32> = HashMap::new();

    for &state in &all_states {
        let mut allowed = Vec::new();
        let is_final = dfa.is_final_state(state);

        for (id, text) in vocab.id_to_token.iter().enumerate() {
            let token_id = id as TokenId;
            if token_id == vocab.eos {
                if is_final {
                    allowed.push(token_id);
                    transitions.insert((state, token_id), state);
                }
                continue;
            }
            if text.is_empty() {
                continue;
            }

            let mut current = state;
            let mut valid = true;
            for byte in text.bytes() {
                match dfa.next_state(current, byte) {
                    Some(next) => current = next,
                    None => {
                        valid = false;
                        break;
                    }
                }
            }

            if valid {
                allowed.push(token_id);
                transitions.insert((state, token_id), current);
            }
        }

        state_to_allowed.insert(state, allowed);
    }

    Ok(TokenFsmIndex::new(
        state_to_allowed,
        transitions,
        final_states,
        dfa.initial_state(),
    ))
}
