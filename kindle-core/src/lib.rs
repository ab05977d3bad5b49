//! Kindle core types, traits, and error definitions.

pub mod error;
pub mod kvcache;
pub mod model;
pub mod sampling;
pub mod types;
pub mod vocab;

pub use error::{ErrorClass, KindleError, Result};
pub use kvcache::{CacheUsage, KvCache, KvCacheShape, KvSnapshot};
pub use model::{LoadRequest, Model, ModelInput, ModelOutput, ModelSource};
pub use sampling::{MirostatState, SampleResult, SamplingParams, Strategy};
pub use types::*;
pub use vocab::Vocabulary;
