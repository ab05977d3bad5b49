use crate::types::TokenId;
use crate::Result;

/// Token id <-> text mapping owned by the model, consumed read-only.
pub trait Vocabulary: Send + Sync {
    fn n_vocab(&self) -> usize;

    /// Text of a token. Fails with `TokenNotFound` for ids the vocabulary
    /// does not assign.
    fn token_to_str(&self, id: TokenId) -> Result<&str>;

    /// Id of a token whose text is exactly `text`.
    fn str_to_token(&self, text: &str) -> Result<TokenId>;

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>>;

    fn bos(&self) -> TokenId;

    fn eos(&self) -> TokenId;
}
