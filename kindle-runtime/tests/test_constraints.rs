mod common;

use std::io::Write;
use std::sync::Arc;

use kindle_core::{ErrorClass, KindleError, Vocabulary};
use kindle_runtime::{Grammar, GrammarState, KindleTokenizer};

/// ids: 0 <s>, 1 </s>, 2 yes, 3 no, 4 y, 5 es, 6 " ", 7 unassigned, 8 n
fn answer_vocab() -> KindleTokenizer {
    common::bpe_tokenizer(&["<s>", "</s>", "yes", "no", "y", "es", " ", "", "n"], &[])
}

const ANSWER: &str = r#"
# a yes/no answer, optionally repeated
root   ::= answer (" " answer)?
answer ::= "yes" | "no"
"#;

#[test]
fn test_allowed_tokens_at_start() {
    let vocab = answer_vocab();
    let state = GrammarState::from_gbnf(ANSWER, &vocab).unwrap();
    assert_eq!(state.allowed_tokens(), &[2, 3, 4, 8]);
    assert!(!state.is_accepting());
    assert!(!state.is_allowed(1));
    // ids without text never advance the automaton
    assert!(!state.is_allowed(7));
}

#[test]
fn test_accept_sequence_until_complete() {
    let vocab = answer_vocab();
    let mut state = GrammarState::from_gbnf(ANSWER, &vocab).unwrap();

    state.accept(4).unwrap(); // "y"
    assert!(!state.is_accepting());
    assert_eq!(state.allowed_tokens(), &[5]);
    state.accept(5).unwrap(); // "es"
    assert!(state.is_accepting());
    assert!(state.is_allowed(1));
    assert!(state.is_allowed(6));

    state.accept(6).unwrap();
    assert!(!state.is_accepting());
    assert!(!state.is_allowed(1));
    state.accept(3).unwrap();
    assert!(state.is_accepting());
    // nothing may follow a complete second answer except the end
    assert_eq!(state.allowed_tokens(), &[1]);
    state.accept(1).unwrap();
    assert!(state.is_accepting());
}

#[test]
fn test_rejected_token_keeps_state() {
    let vocab = answer_vocab();
    let mut state = GrammarState::from_gbnf(ANSWER, &vocab).unwrap();
    state.accept(3).unwrap();
    let before = state.state();
    let err = state.accept(2).unwrap_err();
    assert!(matches!(err, KindleError::GrammarRejected { token: 2 }));
    assert_eq!(err.class(), ErrorClass::GrammarExhausted);
    assert_eq!(state.state(), before);
}

#[test]
fn test_reset_and_shared_grammar() {
    let vocab = answer_vocab();
    let grammar = Arc::new(Grammar::from_gbnf(ANSWER, &vocab).unwrap());
    let mut first = GrammarState::new(Arc::clone(&grammar));
    let second = GrammarState::new(grammar);

    first.accept(2).unwrap();
    assert!(first.is_accepting());
    assert!(!second.is_accepting());

    first.reset();
    assert_eq!(first.state(), second.state());
    assert!(Arc::ptr_eq(first.grammar(), second.grammar()));
}

#[test]
fn test_regex_grammar() {
    let vocab = common::vocab();
    let mut state = GrammarState::from_regex("(ab|c)+", vocab.as_ref()).unwrap();
    // "a" followed by "b" also spells "ab"
    assert_eq!(state.allowed_tokens(), &[2, 4, 7]);
    state.accept(2).unwrap();
    assert_eq!(state.allowed_tokens(), &[3]);
    state.accept(3).unwrap();
    assert!(state.is_accepting());
    assert!(state.is_allowed(vocab.eos()));
}

#[test]
fn test_load_from_file() {
    let vocab = answer_vocab();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(ANSWER.as_bytes()).unwrap();

    let state = GrammarState::load(file.path(), &vocab).unwrap();
    assert_eq!(state.allowed_tokens(), &[2, 3, 4, 8]);
    assert!(state.grammar().pattern().starts_with("(?:"));
}

#[test]
fn test_load_errors() {
    let vocab = answer_vocab();
    let dir = tempfile::tempdir().unwrap();

    let err = GrammarState::load(dir.path().join("missing.gbnf"), &vocab).unwrap_err();
    assert!(matches!(err, KindleError::GrammarParse(_)));
    assert_eq!(err.class(), ErrorClass::Load);

    let err = GrammarState::from_gbnf("root ::= \"[\" root \"]\" | \"x\"", &vocab).unwrap_err();
    assert!(matches!(err, KindleError::GrammarParse(_)));

    let err = GrammarState::from_gbnf("root ::= \"unterminated", &vocab).unwrap_err();
    assert!(matches!(err, KindleError::GrammarParse(_)));

    let err = GrammarState::from_gbnf("root ::= \"a\"\nroot ::= \"b\"", &vocab).unwrap_err();
    assert!(err.to_string().contains("duplicate"));
}
