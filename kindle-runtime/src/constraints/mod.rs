//! Grammar-constrained sampling.
//!
//! A GBNF grammar is inlined into a regular expression, compiled to a
//! byte-level DFA, and indexed against the vocabulary so that each DFA state
//! knows which tokens it allows and where each leads.

pub mod fsm;
pub mod gbnf;
pub mod grammar;
pub mod regex;

pub use fsm::{FsmConstraint, TokenVocab};
pub use grammar::{Grammar, GrammarState};
