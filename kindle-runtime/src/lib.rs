//! Kindle runtime: sampling engine, grammar constraints, and the inference
//! context that ties them to a model and its KV cache.

pub mod candidates;
pub mod constraints;
pub mod context;
pub mod mirostat;
pub mod rng;
pub mod sampling;
pub mod state;
pub mod timings;
pub mod tokenizer;

pub use candidates::{Candidate, CandidateSet};
pub use constraints::{Grammar, GrammarState};
pub use context::InferenceContext;
pub use rng::{ContextRng, RngPosition};
pub use sampling::{CpuSampler, LogitProcessorPipeline, SamplingContext};
pub use state::ContextState;
pub use timings::Timings;
pub use tokenizer::KindleTokenizer;
