//! Byte-level DFA compiled from a regular expression with `regex-automata`.

use std::collections::{HashMap, HashSet, VecDeque};

use regex_automata::dfa::{dense, Automaton, StartKind};
use regex_automata::util::primitives::StateID;
use regex_automata::util::start;
use regex_automata::{Anchored, MatchKind};

use kindle_core::{KindleError, Result};

use super::fsm::{build_token_index, ByteDfa, TokenFsmIndex, TokenVocab};

const MAX_PATTERN_LEN: usize = 64 * 1024;
/// Maximum DFA size in bytes (10 MB).
const MAX_DFA_SIZE: usize = 10 * 1024 * 1024;

/// Whole-input matcher over the live states of a dense DFA.
///
/// Only states from which some continuation still matches are kept, so a
/// byte with no live successor is rejected immediately.
pub struct RegexDfa {
    dfa: dense::DFA<Vec<u32>>,
    state_map: Vec<StateID>,
    state_id_to_u32: HashMap<StateID, u32>,
    final_states: HashSet<u32>,
    initial: u32,
}

impl RegexDfa {
    pub fn new(pattern: &str) -> Result<Self> {
        if pattern.len() > MAX_PATTERN_LEN {
            return Err(KindleError::GrammarParse(format!(
                "pattern too long ({} bytes, max {MAX_PATTERN_LEN})",
                pattern.len()
            )));
        }

        // All-match semantics: acceptance means some match ends at end of input.
        let dfa = dense::Builder::new()
            .configure(
                dense::DFA::config()
                    .start_kind(StartKind::Anchored)
                    .match_kind(MatchKind::All)
                    .dfa_size_limit(Some(MAX_DFA_SIZE)),
            )
            .build(pattern)
            .map_err(|e| KindleError::GrammarParse(format!("regex compilation failed: {e}")))?;

        let start_id = dfa
            .start_state(&start::Config::new().anchored(Anchored::Yes))
            .map_err(|e| KindleError::GrammarParse(format!("no start state: {e}")))?;

        // Forward pass: every state reachable through non-dead transitions.
        let mut reachable = vec![start_id];
        let mut seen = HashSet::from([start_id]);
        let mut edges: Vec<(StateID, StateID)> = Vec::new();
        let mut i = 0;
        while i < reachable.len() {
            let sid = reachable[i];
            i += 1;
            for byte in 0..=255u8 {
                let next = dfa.next_state(sid, byte);
                if dfa.is_dead_state(next) || dfa.is_quit_state(next) {
                    continue;
                }
                edges.push((sid, next));
                if seen.insert(next) {
                    reachable.push(next);
                }
            }
        }

        // Backward pass: keep states that can still reach acceptance.
        let accepting: Vec<StateID> = reachable
            .iter()
            .copied()
            .filter(|&sid| dfa.is_match_state(dfa.next_eoi_state(sid)))
            .collect();
        let mut predecessors: HashMap<StateID, Vec<StateID>> = HashMap::new();
        for &(from, to) in &edges {
            predecessors.entry(to).or_default().push(from);
        }
        let mut live: HashSet<StateID> = accepting.iter().copied().collect();
        let mut queue: VecDeque<StateID> = accepting.iter().copied().collect();
        while let Some(sid) = queue.pop_front() {
            for &prev in predecessors.get(&sid).into_iter().flatten() {
                if live.insert(prev) {
                    queue.push_back(prev);
                }
            }
        }

        if !live.contains(&start_id) {
            return Err(KindleError::GrammarParse(
                "pattern matches no input".to_string(),
            ));
        }

        let state_map: Vec<StateID> = reachable.into_iter().filter(|s| live.contains(s)).collect();
        let state_id_to_u32: HashMap<StateID, u32> = state_map
            .iter()
            .enumerate()
            .map(|(i, &sid)| (sid, i as u32))
            .collect();
        let final_states = accepting
            .iter()
            .filter_map(|sid| state_id_to_u32.get(sid).copied())
            .collect();
        let initial = state_id_to_u32[&start_id];

        Ok(Self {
            dfa,
            state_map,
            state_id_to_u32,
            final_states,
            initial,
        })
    }

    pub fn n_states(&self) -> usize {
        self.state_map.len()
    }

    /// Whether the whole of `input` is in the language.
    pub fn is_match(&self, input: &[u8]) -> bool {
        let mut state = self.initial;
        for &byte in input {
            match self.next_state(state, byte) {
                Some(next) => state = next,
                None => return false,
            }
        }
        self.is_final_state(state)
    }
}

impl ByteDfa for RegexDfa {
    fn initial_state(&self) -> u32 {
        self.initial
    }

    fn next_state(&self, state: u32, byte: u8) -> Option<u32> {
        let sid = self.state_map.get(state as usize).copied()?;
        let next = self.dfa.next_state(sid, byte);
        self.state_id_to_u32.get(&next).copied()
    }

    fn is_final_state(&self, state: u32) -> bool {
        self.final_states.contains(&state)
    }

    fn all_states(&self) -> Vec<u32> {
        (0..self.state_map.len() as u32).collect()
    }
}

/// Compile `pattern` and index it against `vocab`.
pub fn build_regex_fsm(pattern: &str, vocab: &TokenVocab) -> Result<TokenFsmIndex> {
    let dfa = RegexDfa::new(pattern)?;
    build_token_index(&dfa, vocab)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_input_match() {
        let dfa = RegexDfa::new("ab|a").unwrap();
        assert!(dfa.is_match(b"a"));
        assert!(dfa.is_match(b"ab"));
        assert!(!dfa.is_match(b"abc"));
        assert!(!dfa.is_match(b""));
        assert!(!dfa.is_match(b"b"));
    }

    #[test]
    fn test_dead_end_bytes_rejected_early() {
        let dfa = RegexDfa::new("[0-9]+").unwrap();
        let start = dfa.initial_state();
        assert!(dfa.next_state(start, b'x').is_none());
        let one = dfa.next_state(start, b'1').unwrap();
        assert!(dfa.is_final_state(one));
        assert!(!dfa.is_final_state(start));
    }

    #[test]
    fn test_invalid_pattern() {
        let err = RegexDfa::new("(unclosed").err().unwrap();
        assert!(matches!(err, KindleError::GrammarParse(_)));
    }
}
