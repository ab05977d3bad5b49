//! Vocabulary backed by a HuggingFace `tokenizer.json`.

use std::path::Path;

use kindle_core::{KindleError, Result, TokenId, Vocabulary};
use tokenizers::Tokenizer as HfTokenizer;
use tracing::debug;

const BOS_CANDIDATES: [&str; 4] = ["<s>", "<|startoftext|>", "<bos>", "<|begin_of_text|>"];
const EOS_CANDIDATES: [&str; 5] = ["</s>", "<|endoftext|>", "<|im_end|>", "<|eot_id|>", "<eos>"];

#[derive(Debug)]
pub struct KindleTokenizer {
    inner: HfTokenizer,
    /// Dense id -> text table including added tokens. Ids the tokenizer
    /// never assigns stay `None`.
    id_to_token: Vec<Option<String>>,
    bos: TokenId,
    eos: TokenId,
}

#[derive(Default)]
struct SpecialTokens {
    bos: Option<TokenId>,
    eos: Option<TokenId>,
}

impl KindleTokenizer {
    /// Load `tokenizer.json`, taking bos/eos from a sibling
    /// `tokenizer_config.json` when there is one.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let inner = HfTokenizer::from_file(path).map_err(|e| KindleError::Tokenizer(e.to_string()))?;
        let special = path
            .parent()
            .and_then(|dir| read_special_tokens(&dir.join("tokenizer_config.json"), &inner))
            .unwrap_or_default();
        Self::with_special_tokens(inner, special)
    }

    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Result<Self> {
        let inner =
            HfTokenizer::from_bytes(bytes).map_err(|e| KindleError::Tokenizer(e.to_string()))?;
        Self::with_special_tokens(inner, SpecialTokens::default())
    }

    fn with_special_tokens(inner: HfTokenizer, special: SpecialTokens) -> Result<Self> {
        let vocab = inner.get_vocab(true);
        let n_vocab = vocab.values().max().map_or(0, |&id| id as usize + 1);
        let mut id_to_token = vec![None; n_vocab];
        for (text, id) in vocab {
            id_to_token[id as usize] = Some(text);
        }

        // Fall back to common token strings, then to the llama ids
        let bos = special
            .bos
            .or_else(|| first_known(&inner, &BOS_CANDIDATES))
            .unwrap_or(1);
        let eos = special
            .eos
            .or_else(|| first_known(&inner, &EOS_CANDIDATES))
            .unwrap_or(2);
        for (name, id) in [("bos", bos), ("eos", eos)] {
            if id as usize >= n_vocab {
                return Err(KindleError::Tokenizer(format!(
                    "{name} token {id} outside vocabulary of {n_vocab}"
                )));
            }
        }

        debug!(n_vocab, bos, eos, "loaded tokenizer");
        Ok(Self {
            inner,
            id_to_token,
            bos,
            eos,
        })
    }
}

fn first_known(inner: &HfTokenizer, candidates: &[&str]) -> Option<TokenId> {
    candidates.iter().find_map(|text| inner.token_to_id(text))
}

fn read_special_tokens(path: &Path, inner: &HfTokenizer) -> Option<SpecialTokens> {
    let text = std::fs::read_to_string(path).ok()?;
    let config: serde_json::Value = serde_json::from_str(&text).ok()?;
    Some(SpecialTokens {
        bos: special_token_id(&config, "bos", inner),
        eos: special_token_id(&config, "eos", inner),
    })
}

/// Numeric `<kind>_token_id` first, then `<kind>_token` as a string or a
/// `{"content": ...}` object.
fn special_token_id(config: &serde_json::Value, kind: &str, inner: &HfTokenizer) -> Option<TokenId> {
    if let Some(id) = config.get(format!("{kind}_token_id")).and_then(|v| v.as_u64()) {
        return Some(id as TokenId);
    }
    let token = config.get(format!("{kind}_token"))?;
    let text = token
        .as_str()
        .or_else(|| token.get("content").and_then(|c| c.as_str()))?;
    inner.token_to_id(text)
}

impl Vocabulary for KindleTokenizer {
    fn n_vocab(&self) -> usize {
        self.id_to_token.len()
    }

    fn token_to_str(&self, id: TokenId) -> Result<&str> {
        self.id_to_token
            .get(id as usize)
            .and_then(|t| t.as_deref())
            .ok_or_else(|| KindleError::TokenNotFound(format!("id {id}")))
    }

    fn str_to_token(&self, text: &str) -> Result<TokenId> {
        self.inner
            .token_to_id(text)
            .ok_or_else(|| KindleError::TokenNotFound(format!("{text:?}")))
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| KindleError::Tokenizer(e.to_string()))?;
        let mut ids = Vec::with_capacity(encoding.len() + 1);
        if add_bos {
            ids.push(self.bos);
        }
        ids.extend_from_slice(encoding.get_ids());
        Ok(ids)
    }

    fn bos(&self) -> TokenId {
        self.bos
    }

    fn eos(&self) -> TokenId {
        self.eos
    }
}
