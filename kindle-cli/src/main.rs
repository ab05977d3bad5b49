//! Kindle command-line tools: inspect saved contexts, check grammars
//! against a vocabulary, and exercise the sampler on fixed logits.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use kindle_core::{MirostatState, SamplingParams, Strategy, Vocabulary};
use kindle_runtime::{
    ContextRng, ContextState, CpuSampler, GrammarState, KindleTokenizer, SamplingContext,
};

#[derive(Parser)]
#[command(name = "kindle", about = "Kindle inference runtime tools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the header and sizes of a saved context state
    InspectState {
        /// Path to a state file written by `save_state`
        file: PathBuf,
    },

    /// Tokenize text and walk it through a GBNF grammar
    CheckGrammar {
        /// GBNF grammar file
        #[arg(long)]
        grammar: PathBuf,

        /// HuggingFace tokenizer.json (bos/eos read from a sibling tokenizer_config.json)
        #[arg(long)]
        vocab: PathBuf,

        /// Text to check
        #[arg(long)]
        text: String,
    },

    /// Sample repeatedly from one row of logits and print the frequencies
    Sample {
        /// Comma-separated logits, one per token id
        #[arg(long, allow_hyphen_values = true)]
        logits: String,

        /// Sampling parameters as JSON (defaults when omitted)
        #[arg(long)]
        params: Option<PathBuf>,

        /// RNG seed, 0 for a random one
        #[arg(long, default_value = "42")]
        seed: u32,

        /// Number of independent draws
        #[arg(long, default_value = "1000")]
        draws: usize,

        /// GBNF grammar file, required by the grammar strategy
        #[arg(long, requires = "vocab")]
        grammar: Option<PathBuf>,

        /// tokenizer.json the grammar is indexed against
        #[arg(long)]
        vocab: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Command::InspectState { file } => inspect_state(file),
        Command::CheckGrammar {
            grammar,
            vocab,
            text,
        } => check_grammar(grammar, vocab, &text),
        Command::Sample {
            logits,
            params,
            seed,
            draws,
            grammar,
            vocab,
        } => sample(&logits, params, seed, draws, grammar.zip(vocab)),
    }
}

fn inspect_state(file: PathBuf) -> anyhow::Result<()> {
    let state = ContextState::read_from(&file)
        .with_context(|| format!("Failed to read state {}", file.display()))?;
    let kv = &state.kv;
    println!("n_vocab:   {}", state.n_vocab);
    println!("n_embd:    {}", state.n_embd);
    println!("n_past:    {}", state.tokens.len());
    println!("logits:    {} rows", state.logits.len() / state.n_vocab.max(1) as usize);
    println!("embedding: {} values", state.embedding.len());
    println!(
        "kv cache:  {}/{} positions, {} layers x {} heads x {}, {:?}",
        kv.n, kv.shape.capacity, kv.shape.n_layer, kv.shape.n_head, kv.shape.head_dim, kv.dtype
    );
    println!(
        "timings:   {} evals, {} prompt tokens, {} samples",
        state.counters.n_eval, state.counters.n_p_eval, state.counters.n_sample
    );
    println!("rng:       stream {} word {}", state.rng.stream, state.rng.word_pos);
    Ok(())
}

fn check_grammar(grammar: PathBuf, vocab: PathBuf, text: &str) -> anyhow::Result<()> {
    let vocab = KindleTokenizer::from_file(&vocab)
        .with_context(|| format!("Failed to load tokenizer {}", vocab.display()))?;
    let mut state = GrammarState::load(&grammar, &vocab)?;
    info!(pattern = state.grammar().pattern(), "compiled grammar");

    let tokens = vocab.tokenize(text, false)?;
    for (i, &token) in tokens.iter().enumerate() {
        if state.accept(token).is_err() {
            let piece = vocab.token_to_str(token)?;
            bail!("token {i} ({token}, {piece:?}) is rejected by the grammar");
        }
    }
    if state.is_accepting() {
        println!("accepted: {} tokens form a complete sentence", tokens.len());
    } else {
        println!(
            "incomplete: {} tokens accepted, {} tokens may follow",
            tokens.len(),
            state.allowed_tokens().len()
        );
    }
    Ok(())
}

fn sample(
    logits: &str,
    params: Option<PathBuf>,
    seed: u32,
    draws: usize,
    grammar: Option<(PathBuf, PathBuf)>,
) -> anyhow::Result<()> {
    let logits = logits
        .split(',')
        .map(|v| v.trim().parse::<f32>())
        .collect::<Result<Vec<_>, _>>()
        .context("logits must be comma-separated numbers")?;
    let params = match params {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            SamplingParams::from_json_str(&text)?
        }
        None => SamplingParams::default(),
    };

    let grammar = match grammar {
        Some((grammar, vocab)) => {
            let vocab = KindleTokenizer::from_file(&vocab)
                .with_context(|| format!("Failed to load tokenizer {}", vocab.display()))?;
            if vocab.n_vocab() != logits.len() {
                bail!(
                    "{} logits for a vocabulary of {} tokens",
                    logits.len(),
                    vocab.n_vocab()
                );
            }
            Some(GrammarState::load(&grammar, &vocab)?)
        }
        None => None,
    };

    let mut mirostat = match params.strategy {
        Strategy::Mirostat { tau, .. } | Strategy::MirostatV2 { tau, .. } => {
            Some(MirostatState::new(tau))
        }
        _ => None,
    };

    let mut rng = ContextRng::new(seed);
    let mut counts = vec![0usize; logits.len()];
    for _ in 0..draws {
        // each draw starts from the grammar's initial state
        let mut cursor = grammar.clone();
        let mut sctx = SamplingContext {
            mirostat: mirostat.as_mut(),
            grammar: cursor.as_mut(),
            ..Default::default()
        };
        let result = CpuSampler.sample(&logits, &params, &mut sctx, &mut rng)?;
        counts[result.token_id as usize] += 1;
    }

    for (token, &count) in counts.iter().enumerate().filter(|&(_, &c)| c > 0) {
        println!(
            "{token:>6} {count:>8} {:.4}",
            count as f64 / draws.max(1) as f64
        );
    }
    if let Some(state) = mirostat {
        println!("final mu: {:.4}", state.mu);
    }
    Ok(())
}
