use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Hyperparameters for the encoder-decoder Transformer.
///
/// Only the vocabulary sizes and maximum sequence lengths are required;
/// everything else defaults to the base model of Vaswani et al. (2017).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub src_vocab_size: i64,
    pub tgt_vocab_size: i64,
    /// Longest source sequence the positional table covers.
    pub src_seq_len: i64,
    /// Longest target sequence the positional table covers.
    pub tgt_seq_len: i64,
    #[serde(default = "default_d_model")]
    pub d_model: i64,
    #[serde(default = "default_num_layers")]
    pub num_layers: i64,
    #[serde(default = "default_num_heads")]
    pub num_heads: i64,
    #[serde(default = "default_dropout")]
    pub dropout: f64,
    #[serde(default = "default_d_ff")]
    pub d_ff: i64,
    /// Added to the standard deviation in every normalization layer.
    #[serde(default = "default_eps")]
    pub eps: f64,
    /// Seeds libtorch's generator before parameters are created.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_d_model() -> i64 {
    512
}
fn default_num_layers() -> i64 {
    6
}
fn default_num_heads() -> i64 {
    8
}
fn default_dropout() -> f64 {
    0.1
}
fn default_d_ff() -> i64 {
    2048
}
fn default_eps() -> f64 {
    1e-6
}

impl ModelConfig {
    pub fn new(src_vocab_size: i64, tgt_vocab_size: i64, src_seq_len: i64, tgt_seq_len: i64) -> Self {
        Self {
            src_vocab_size,
            tgt_vocab_size,
            src_seq_len,
            tgt_seq_len,
            d_model: default_d_model(),
            num_layers: default_num_layers(),
            num_heads: default_num_heads(),
            dropout: default_dropout(),
            d_ff: default_d_ff(),
            eps: default_eps(),
            seed: None,
        }
    }

    pub fn with_d_model(mut self, d_model: i64) -> Self {
        self.d_model = d_model;
        self
    }

    pub fn with_num_layers(mut self, num_layers: i64) -> Self {
        self.num_layers = num_layers;
        self
    }

    pub fn with_num_heads(mut self, num_heads: i64) -> Self {
        self.num_heads = num_heads;
        self
    }

    pub fn with_dropout(mut self, dropout: f64) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_d_ff(mut self, d_ff: i64) -> Self {
        self.d_ff = d_ff;
        self
    }

    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Per-head dimension.
    pub fn d_k(&self) -> i64 {
        self.d_model / self.num_heads
    }

    /// Checks every invariant the layers rely on.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("src_vocab_size", self.src_vocab_size),
            ("tgt_vocab_size", self.tgt_vocab_size),
            ("src_seq_len", self.src_seq_len),
            ("tgt_seq_len", self.tgt_seq_len),
            ("d_model", self.d_model),
            ("num_layers", self.num_layers),
            ("num_heads", self.num_heads),
            ("d_ff", self.d_ff),
        ];
        for (name, value) in sizes {
            if value <= 0 {
                return Err(Error::config(format!("{name} must be positive, got {value}")));
            }
        }
        check_heads(self.d_model, self.num_heads)?;
        check_dropout(self.dropout)?;
        if !(self.eps > 0.0) {
            return Err(Error::config(format!("eps must be positive, got {}", self.eps)));
        }
        Ok(())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

pub(crate) fn check_heads(d_model: i64, num_heads: i64) -> Result<()> {
    if num_heads <= 0 || d_model % num_heads != 0 {
        return Err(Error::config(format!(
            "d_model ({d_model}) must be divisible by num_heads ({num_heads})"
        )));
    }
    Ok(())
}

pub(crate) fn check_dropout(p: f64) -> Result<()> {
    if !(0.0..1.0).contains(&p) {
        return Err(Error::config(format!("dropout must be in [0, 1), got {p}")));
    }
    Ok(())
}
