mod common;

use common::{context, params};
use kindle_core::{ContextParams, KindleError, SamplingParams, Strategy, TokenId};
use kindle_runtime::{ContextState, InferenceContext, SamplingContext};

fn sampling() -> SamplingParams {
    SamplingParams {
        temperature: 0.9,
        strategy: Strategy::TopK { k: 5 },
        ..SamplingParams::default()
    }
}

fn generate(ctx: &mut InferenceContext, n: usize) -> Vec<TokenId> {
    let params = sampling();
    let mut out = Vec::new();
    for _ in 0..n {
        let history = ctx.tokens().to_vec();
        let mut sctx = SamplingContext {
            last_tokens: &history,
            ..Default::default()
        };
        let token = ctx.sample(&params, &mut sctx).unwrap().token_id;
        ctx.eval(&[token]).unwrap();
        out.push(token);
    }
    out
}

#[test]
fn test_saved_state_reproduces_generation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ctx.kndl");

    let mut first = context(params(32));
    first.eval(&[0, 2, 3]).unwrap();
    generate(&mut first, 4);
    first.save_state(&path).unwrap();
    let continued = generate(&mut first, 8);

    // a fresh context with a different seed resumes the saved stream
    let mut restored = context(ContextParams {
        seed: 7,
        ..params(32)
    });
    restored.load_state(&path).unwrap();
    assert_eq!(restored.n_past(), 7);
    let replayed = generate(&mut restored, 8);
    assert_eq!(replayed, continued);

    // and so does the first context after rewinding
    first.load_state(&path).unwrap();
    assert_eq!(generate(&mut first, 8), continued);
}

#[test]
fn test_state_restores_buffers_and_counters() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ctx.kndl");

    let mut ctx = context(params(16));
    ctx.eval(&[2, 3]).unwrap();
    ctx.save_state(&path).unwrap();
    let logits = ctx.logits().to_vec();
    let tokens = ctx.tokens().to_vec();

    let mut other = context(params(16));
    other.load_state(&path).unwrap();
    assert_eq!(other.logits(), logits.as_slice());
    assert_eq!(other.tokens(), tokens.as_slice());
    assert_eq!(other.timings().n_p_eval, 2);
    assert_eq!(
        other.kv_cache().snapshot(),
        ctx.kv_cache().snapshot()
    );
}

#[test]
fn test_incompatible_state_leaves_context_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ctx.kndl");

    let mut source = context(params(16));
    source.eval(&[2, 3]).unwrap();
    source.save_state(&path).unwrap();

    let mut target = context(params(32));
    target.eval(&[4]).unwrap();
    let err = target.load_state(&path).unwrap_err();
    assert!(matches!(err, KindleError::StateLoad(_)));
    assert_eq!(target.tokens(), &[4]);

    let mut half = context(ContextParams {
        f16_kv: false,
        ..params(16)
    });
    assert!(half.load_state(&path).is_err());
    assert_eq!(half.n_past(), 0);
}

#[test]
fn test_corrupt_state_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ctx.kndl");

    let mut ctx = context(params(16));
    ctx.eval(&[2]).unwrap();
    ctx.save_state(&path).unwrap();

    let mut bytes = std::fs::read(&path).unwrap();
    bytes.truncate(bytes.len() - 3);
    std::fs::write(&path, &bytes).unwrap();

    let mut target = context(params(16));
    assert!(matches!(
        target.load_state(&path),
        Err(KindleError::StateLoad(_))
    ));
    assert_eq!(target.n_past(), 0);

    let missing = dir.path().join("missing.kndl");
    assert!(target.load_state(&missing).is_err());
}

#[test]
fn test_state_file_summary() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ctx.kndl");

    let mut ctx = context(params(16));
    ctx.eval(&[2, 3, 4]).unwrap();
    ctx.save_state(&path).unwrap();

    let state = ContextState::read_from(&path).unwrap();
    assert_eq!(state.n_vocab, 8);
    assert_eq!(state.tokens, vec![2, 3, 4]);
    assert_eq!(state.kv.n, 3);
    assert_eq!(state.kv.shape.capacity, 16);
}
