use std::borrow::Borrow;

use tch::{nn, Device, Kind, Tensor};

use crate::config::{check_dropout, check_heads};
use crate::error::{Error, Result};

/// Score written into masked attention positions before the softmax.
pub const MASK_FILL: f64 = -1e9;

/// Default epsilon for [`LayerNormalization`].
pub const NORM_EPS: f64 = 1e-6;

pub(crate) fn expect_rank(xs: &Tensor, rank: usize, expected: &str) -> Result<()> {
    if xs.dim() != rank {
        return Err(Error::ShapeMismatch { expected: expected.to_string(), got: xs.size() });
    }
    Ok(())
}

pub(crate) fn expect_last_dim(xs: &Tensor, d_model: i64) -> Result<()> {
    if xs.size().last() != Some(&d_model) {
        return Err(Error::ShapeMismatch { expected: format!("[.., {d_model}]"), got: xs.size() });
    }
    Ok(())
}

/// Token embedding scaled by `sqrt(d_model)`.
#[derive(Debug)]
pub struct InputEmbeddings {
    embedding: nn::Embedding,
    vocab_size: i64,
    d_model: i64,
    scale: f64,
}

impl InputEmbeddings {
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(vs: P, vocab_size: i64, d_model: i64) -> Self {
        let vs = vs.borrow();
        let embedding = nn::embedding(vs / "embedding", vocab_size, d_model, Default::default());
        Self { embedding, vocab_size, d_model, scale: (d_model as f64).sqrt() }
    }

    pub fn vocab_size(&self) -> i64 {
        self.vocab_size
    }

    pub fn d_model(&self) -> i64 {
        self.d_model
    }

    /// Looks up `ids` of shape `[batch, seq_len]`, returning `[batch, seq_len, d_model]`.
    ///
    /// Ids outside `[0, vocab_size)` are rejected rather than wrapped.
    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        expect_rank(ids, 2, "[batch, seq_len]")?;
        // libtorch only indexes with Long/Int tensors.
        if !matches!(ids.kind(), Kind::Int64 | Kind::Int) {
            return Err(Error::ShapeMismatch {
                expected: format!("integer token ids, got {:?}", ids.kind()),
                got: ids.size(),
            });
        }
        if ids.numel() > 0 {
            let min = ids.min().f_int64_value(&[])?;
            let max = ids.max().f_int64_value(&[])?;
            for id in [min, max] {
                if id < 0 || id >= self.vocab_size {
                    return Err(Error::TokenOutOfRange { id, vocab_size: self.vocab_size });
                }
            }
        }
        // [batch, seq_len] -> [batch, seq_len, d_model]
        Ok(ids.apply(&self.embedding) * self.scale)
    }
}

#[derive(Debug)]
pub struct PositionalEncoding {
    pe: Tensor,
    max_len: i64,
    dropout: f64,
}

impl PositionalEncoding {
    /// Creates a new PositionalEncoding layer.
    ///
    /// Args:
    ///   d_model: The dimensionality of the input embeddings.
    ///   max_len: The maximum sequence length.
    ///   dropout: Dropout probability applied after the signal is added.
    ///   device: Where the fixed table lives.
    pub fn new(d_model: i64, max_len: i64, dropout: f64, device: Device) -> Self {
        let pe = Tensor::zeros([max_len, d_model], (Kind::Float, device));

        // Shape: [max_len, 1]
        let position = Tensor::arange(max_len, (Kind::Float, device)).unsqueeze(-1);

        // 1 / 10000^(2i / d_model), shape [ceil(d_model / 2)].
        let div_term = (Tensor::arange_start_step(0, d_model, 2, (Kind::Float, device))
            * (-(10000f64.ln()) / d_model as f64))
            .exp();

        // Sine on even feature indices, cosine on odd ones. With an odd
        // d_model there is one fewer odd column than frequencies.
        pe.slice(1, 0, d_model, 2).copy_(&(&position * &div_term).sin());
        pe.slice(1, 1, d_model, 2)
            .copy_(&(&position * div_term.narrow(0, 0, d_model / 2)).cos());

        Self { pe: pe.unsqueeze(0), max_len, dropout }
    }

    /// The fixed table, shape `[1, max_len, d_model]`.
    pub fn table(&self) -> &Tensor {
        &self.pe
    }

    pub fn max_len(&self) -> i64 {
        self.max_len
    }

    /// Adds the first `seq_len` rows of the table to `xs` (`[batch, seq_len, d_model]`).
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        expect_rank(xs, 3, "[batch, seq_len, d_model]")?;
        let seq_len = xs.size()[1];
        if seq_len > self.max_len {
            return Err(Error::SequenceTooLong { len: seq_len, max: self.max_len });
        }
        let signal = self.pe.narrow(1, 0, seq_len).detach();
        Ok((xs + signal).dropout(self.dropout, train))
    }
}

/// Layer normalization over the last axis with a learnable scale and bias.
///
/// Uses the population standard deviation and adds `eps` to it (not to the
/// variance), so constant rows map to `bias`.
#[derive(Debug)]
pub struct LayerNormalization {
    alpha: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNormalization {
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(vs: P, d_model: i64, eps: f64) -> Self {
        let vs = vs.borrow();
        let alpha = vs.ones("alpha", &[d_model]);
        let bias = vs.zeros("bias", &[d_model]);
        Self { alpha, bias, eps }
    }
}

impl nn::Module for LayerNormalization {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let dims = [-1i64];
        let mean = xs.mean_dim(dims.as_slice(), true, Kind::Float);
        let centered = xs - mean;
        let std = centered.square().mean_dim(dims.as_slice(), true, Kind::Float).sqrt();
        &self.alpha * centered / (std + self.eps) + &self.bias
    }
}

/// Position-wise `linear2(dropout(relu(linear1(x))))`.
#[derive(Debug)]
pub struct FeedForward {
    linear1: nn::Linear,
    linear2: nn::Linear,
    dropout: f64,
}

impl FeedForward {
    /// Creates a new FeedForward layer.
    ///
    /// Args:
    ///   vs: The `nn::Path` for `VarStore` ownership.
    ///   d_model: The dimensionality of the input and output.
    ///   d_ff: The dimensionality of the inner feed-forward layer.
    ///   dropout: Dropout probability between the two projections.
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(vs: P, d_model: i64, d_ff: i64, dropout: f64) -> Self {
        let vs = vs.borrow();
        let linear1 = nn::linear(vs / "linear1", d_model, d_ff, Default::default());
        let linear2 = nn::linear(vs / "linear2", d_ff, d_model, Default::default());
        Self { linear1, linear2, dropout }
    }
}

impl nn::ModuleT for FeedForward {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        xs.apply(&self.linear1)
            .relu()
            .dropout(self.dropout, train)
            .apply(&self.linear2)
    }
}

fn check_mask(mask: &Tensor, scores: &[i64]) -> Result<()> {
    let dims = mask.size();
    let broadcastable = dims.len() <= scores.len()
        && dims.iter().rev().zip(scores.iter().rev()).all(|(&m, &s)| m == 1 || m == s);
    if !broadcastable {
        return Err(Error::MaskShapeMismatch { mask: dims, scores: scores.to_vec() });
    }
    Ok(())
}

/// Scaled dot-product attention.
///
/// `query` is `[.., q_len, d_k]`, `key` and `value` are `[.., k_len, d_k]`.
/// Wherever `mask == 0` the score is replaced by [`MASK_FILL`] before the
/// softmax. Returns the attended values (`[.., q_len, d_k]`) together with
/// the probability matrix (`[.., q_len, k_len]`, taken before dropout).
pub fn scaled_dot_product_attention(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    mask: Option<&Tensor>,
    dropout: f64,
    train: bool,
) -> Result<(Tensor, Tensor)> {
    let d_k = query.size().last().copied().unwrap_or(1);

    // [.., q_len, d_k] @ [.., d_k, k_len] -> [.., q_len, k_len]
    let scores = query.f_matmul(&key.transpose(-2, -1))? / (d_k as f64).sqrt();
    let scores = match mask {
        Some(m) => {
            check_mask(m, &scores.size())?;
            scores.masked_fill(&m.eq(0i64), MASK_FILL)
        }
        None => scores,
    };
    let probs = scores.softmax(-1, Kind::Float);

    // [.., q_len, k_len] @ [.., k_len, d_k] -> [.., q_len, d_k]
    let output = probs.dropout(dropout, train).f_matmul(value)?;
    Ok((output, probs))
}

#[derive(Debug)]
pub struct MultiHeadAttention {
    q_proj: nn::Linear,
    k_proj: nn::Linear,
    v_proj: nn::Linear,
    out_proj: nn::Linear,
    d_model: i64,
    num_heads: i64,
    head_dim: i64,
    dropout: f64,
}

impl MultiHeadAttention {
    /// Creates a new MultiHeadAttention layer.
    ///
    /// Args:
    ///   vs: The `nn::Path` for `VarStore` ownership, used to create trainable layers.
    ///   d_model: The dimensionality of the input and output.
    ///   num_heads: The number of attention heads; must divide `d_model`.
    ///   dropout: Dropout probability on the attention probabilities.
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(
        vs: P,
        d_model: i64,
        num_heads: i64,
        dropout: f64,
    ) -> Result<Self> {
        check_heads(d_model, num_heads)?;
        check_dropout(dropout)?;
        let vs = vs.borrow();

        let q_proj = nn::linear(vs / "q_proj", d_model, d_model, Default::default());
        let k_proj = nn::linear(vs / "k_proj", d_model, d_model, Default::default());
        let v_proj = nn::linear(vs / "v_proj", d_model, d_model, Default::default());
        let out_proj = nn::linear(vs / "out_proj", d_model, d_model, Default::default());

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            d_model,
            num_heads,
            head_dim: d_model / num_heads,
            dropout,
        })
    }

    pub fn num_heads(&self) -> i64 {
        self.num_heads
    }

    pub fn head_dim(&self) -> i64 {
        self.head_dim
    }

    /// [batch, seq_len, d_model] -> [batch, num_heads, seq_len, head_dim]
    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, _) = xs.size3()?;
        Ok(xs.view([batch_size, seq_len, self.num_heads, self.head_dim]).transpose(1, 2))
    }

    /// Attention output `[batch, q_len, d_model]` plus the per-head
    /// probabilities `[batch, num_heads, q_len, k_len]`.
    ///
    /// `mask` must broadcast to `[batch, num_heads, q_len, k_len]`.
    pub fn forward_with_weights(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        for xs in [query, key, value] {
            expect_rank(xs, 3, "[batch, seq_len, d_model]")?;
            expect_last_dim(xs, self.d_model)?;
        }
        if query.size()[0] != key.size()[0] {
            return Err(Error::ShapeMismatch {
                expected: format!("key batch matching query batch {}", query.size()[0]),
                got: key.size(),
            });
        }
        if key.size()[..2] != value.size()[..2] {
            return Err(Error::ShapeMismatch {
                expected: format!("value matching key shape {:?}", key.size()),
                got: value.size(),
            });
        }
        let (batch_size, q_len, d_model) = query.size3()?;

        // 1. Project and split into heads.
        // q: [batch_size, num_heads, q_len, head_dim]
        // k, v: [batch_size, num_heads, k_len, head_dim]
        let q = self.split_heads(&query.apply(&self.q_proj))?;
        let k = self.split_heads(&key.apply(&self.k_proj))?;
        let v = self.split_heads(&value.apply(&self.v_proj))?;

        // 2. Attention per head.
        // attn_output: [batch_size, num_heads, q_len, head_dim]
        // probs: [batch_size, num_heads, q_len, k_len]
        let (attn_output, probs) =
            scaled_dot_product_attention(&q, &k, &v, mask, self.dropout, train)?;

        // 3. Concatenate heads back along the feature axis.
        // Shape: [batch_size, q_len, d_model]
        let attn_output = attn_output
            .transpose(1, 2)
            .contiguous()
            .view([batch_size, q_len, d_model]);

        // 4. Output projection, shape unchanged.
        Ok((attn_output.apply(&self.out_proj), probs))
    }

    pub fn forward_t(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        self.forward_with_weights(query, key, value, mask, train).map(|(out, _)| out)
    }
}

/// A transform that a [`ResidualConnection`] can wrap.
pub trait Sublayer {
    fn forward_sublayer(&self, xs: &Tensor, train: bool) -> Result<Tensor>;
}

impl Sublayer for FeedForward {
    fn forward_sublayer(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        Ok(nn::ModuleT::forward_t(self, xs, train))
    }
}

/// Pre-norm residual: `x + dropout(sublayer(norm(x)))`.
#[derive(Debug)]
pub struct ResidualConnection {
    norm: LayerNormalization,
    dropout: f64,
}

impl ResidualConnection {
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(vs: P, d_model: i64, dropout: f64, eps: f64) -> Self {
        let vs = vs.borrow();
        Self { norm: LayerNormalization::new(vs / "norm", d_model, eps), dropout }
    }

    pub fn forward_t<S: Sublayer + ?Sized>(&self, xs: &Tensor, sublayer: &S, train: bool) -> Result<Tensor> {
        let out = sublayer.forward_sublayer(&xs.apply(&self.norm), train)?;
        Ok(xs + out.dropout(self.dropout, train))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rand3(b: i64, s: i64, d: i64) -> Tensor {
        Tensor::randn([b, s, d], (Kind::Float, Device::Cpu))
    }

    #[test]
    fn embedding_scales_by_sqrt_d_model() {
        let vs = nn::VarStore::new(Device::Cpu);
        let emb = InputEmbeddings::new(&vs.root(), 10, 16);
        let ids = Tensor::from_slice(&[1i64, 2, 3, 9]).view([2, 2]);
        let out = emb.forward(&ids).unwrap();
        assert_eq!(out.size(), [2, 2, emb.d_model()]);
        let raw = ids.apply(&emb.embedding);
        assert!(out.allclose(&(raw * 4.0), 1e-6, 1e-6, false));
    }

    #[test]
    fn embedding_rejects_out_of_range_ids() {
        let vs = nn::VarStore::new(Device::Cpu);
        let emb = InputEmbeddings::new(&vs.root(), 10, 8);
        let too_big = Tensor::from_slice(&[0i64, 10]).view([1, 2]);
        match emb.forward(&too_big) {
            Err(Error::TokenOutOfRange { id, vocab_size }) => assert_eq!((id, vocab_size), (10, 10)),
            other => panic!("unexpected: {other:?}"),
        }
        let negative = Tensor::from_slice(&[-1i64, 3]).view([1, 2]);
        assert!(emb.forward(&negative).unwrap_err().is_index_out_of_range());
        let flat = Tensor::from_slice(&[1i64, 2]);
        assert!(emb.forward(&flat).unwrap_err().is_shape_mismatch());
    }

    #[test]
    fn embedding_rejects_float_ids() {
        let vs = nn::VarStore::new(Device::Cpu);
        let emb = InputEmbeddings::new(&vs.root(), 10, 8);
        assert_eq!(emb.vocab_size(), 10);
        let ids = Tensor::from_slice(&[1.0f32, 2.5]).view([1, 2]);
        assert!(emb.forward(&ids).unwrap_err().is_shape_mismatch());
        let int32 = Tensor::from_slice(&[1i32, 2]).view([1, 2]);
        assert_eq!(emb.forward(&int32).unwrap().size(), [1, 2, 8]);
    }

    #[test]
    fn positional_table_is_deterministic() {
        let a = PositionalEncoding::new(16, 20, 0.1, Device::Cpu);
        let b = PositionalEncoding::new(16, 20, 0.1, Device::Cpu);
        assert_eq!(a.table().size(), [1, 20, 16]);
        assert!(a.table().equal(b.table()));
    }

    #[test]
    fn positional_table_follows_sinusoid() {
        let pe = PositionalEncoding::new(6, 5, 0.0, Device::Cpu);
        let table = pe.table();
        // Position 0: sin(0) = 0 on even columns, cos(0) = 1 on odd ones.
        assert_eq!(table.double_value(&[0, 0, 0]), 0.0);
        assert_eq!(table.double_value(&[0, 0, 1]), 1.0);
        let pos = 3.0f64;
        let freq = (-(10000f64.ln()) * 2.0 / 6.0).exp();
        assert!((table.double_value(&[0, 3, 2]) - (pos * freq).sin()).abs() < 1e-5);
        assert!((table.double_value(&[0, 3, 3]) - (pos * freq).cos()).abs() < 1e-5);
    }

    #[test]
    fn positional_encoding_handles_odd_d_model() {
        let pe = PositionalEncoding::new(5, 4, 0.0, Device::Cpu);
        assert_eq!(pe.table().size(), [1, 4, 5]);
        assert_eq!(pe.table().double_value(&[0, 0, 4]), 0.0);
    }

    #[test]
    fn positional_encoding_adds_prefix_and_checks_length() {
        let pe = PositionalEncoding::new(8, 6, 0.0, Device::Cpu);
        let xs = Tensor::zeros([2, 4, 8], (Kind::Float, Device::Cpu));
        let out = pe.forward_t(&xs, false).unwrap();
        assert!(out.get(1).equal(&pe.table().narrow(1, 0, 4).squeeze_dim(0)));

        let long = Tensor::zeros([1, pe.max_len() + 1, 8], (Kind::Float, Device::Cpu));
        match pe.forward_t(&long, false) {
            Err(Error::SequenceTooLong { len, max }) => assert_eq!((len, max), (7, 6)),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn layer_norm_gives_zero_mean_unit_std() {
        let vs = nn::VarStore::new(Device::Cpu);
        let norm = LayerNormalization::new(&vs.root(), 32, NORM_EPS);
        let xs = rand3(3, 5, 32) * 7.0 + 3.0;
        let out = xs.apply(&norm);
        let dims = [-1i64];
        let mean = out.mean_dim(dims.as_slice(), false, Kind::Float);
        let std = (&out - out.mean_dim(dims.as_slice(), true, Kind::Float))
            .square()
            .mean_dim(dims.as_slice(), false, Kind::Float)
            .sqrt();
        assert!(mean.abs().max().double_value(&[]) < 1e-5);
        assert!((std - 1.0).abs().max().double_value(&[]) < 1e-4);
    }

    #[test]
    fn layer_norm_defined_for_constant_rows() {
        let vs = nn::VarStore::new(Device::Cpu);
        let norm = LayerNormalization::new(&vs.root(), 4, NORM_EPS);
        let xs = Tensor::ones([1, 2, 4], (Kind::Float, Device::Cpu)) * 5.0;
        let out = xs.apply(&norm);
        assert_eq!(out.isfinite().all().int64_value(&[]), 1);
        assert_eq!(out.abs().max().double_value(&[]), 0.0);
    }

    #[test]
    fn feed_forward_preserves_shape_and_is_position_wise() {
        let vs = nn::VarStore::new(Device::Cpu);
        let ff = FeedForward::new(&vs.root(), 8, 32, 0.1);
        let xs = rand3(2, 5, 8);
        let out = xs.apply_t(&ff, false);
        assert_eq!(out.size(), [2, 5, 8]);
        let single = xs.narrow(1, 2, 1).apply_t(&ff, false);
        assert!(single.allclose(&out.narrow(1, 2, 1), 1e-5, 1e-6, false));
    }

    #[test]
    fn attention_rejects_indivisible_heads() {
        let vs = nn::VarStore::new(Device::Cpu);
        let err = MultiHeadAttention::new(&vs.root(), 30, 4, 0.0).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        let mha = MultiHeadAttention::new(&vs.root() / "ok", 32, 4, 0.0).unwrap();
        assert_eq!(mha.num_heads(), 4);
        assert_eq!(mha.head_dim(), 8);
    }

    #[test]
    fn attention_probabilities_sum_to_one() {
        let q = Tensor::randn([2, 4, 5, 8], (Kind::Float, Device::Cpu));
        let k = Tensor::randn([2, 4, 7, 8], (Kind::Float, Device::Cpu));
        let v = Tensor::randn([2, 4, 7, 8], (Kind::Float, Device::Cpu));
        let mask = Tensor::from_slice(&[1i64, 1, 1, 0, 1, 0, 0]).view([1, 1, 1, 7]);
        let (out, probs) = scaled_dot_product_attention(&q, &k, &v, Some(&mask), 0.0, false).unwrap();
        assert_eq!(out.size(), q.size());
        assert_eq!(probs.size(), [2, 4, 5, 7]);
        let sums = probs.sum_dim_intlist([-1i64].as_slice(), false, Kind::Float);
        assert!((sums - 1.0).abs().max().double_value(&[]) < 1e-5);
        for masked in [3, 5, 6] {
            assert!(probs.select(-1, masked).max().double_value(&[]) < 1e-6);
        }
    }

    #[test]
    fn fully_masked_row_still_sums_to_one() {
        // A padded first target token blocks every key for query 0.
        let q = Tensor::randn([1, 2, 3, 4], (Kind::Float, Device::Cpu));
        let k = Tensor::randn([1, 2, 3, 4], (Kind::Float, Device::Cpu));
        let v = Tensor::randn([1, 2, 3, 4], (Kind::Float, Device::Cpu));
        let mask = Tensor::from_slice(&[0i64, 0, 0, 1, 1, 0, 1, 1, 1]).view([1, 1, 3, 3]);
        let (out, probs) = scaled_dot_product_attention(&q, &k, &v, Some(&mask), 0.0, false).unwrap();
        assert_eq!(out.isfinite().all().int64_value(&[]), 1);
        let sums = probs.sum_dim_intlist([-1i64].as_slice(), false, Kind::Float);
        assert!((sums - 1.0).abs().max().double_value(&[]) < 1e-5);
        assert!(probs.select(2, 1).select(-1, 2).max().double_value(&[]) < 1e-6);
    }

    #[test]
    fn mismatched_head_width_is_an_error() {
        let q = Tensor::randn([1, 2, 3, 4], (Kind::Float, Device::Cpu));
        let k = Tensor::randn([1, 2, 3, 5], (Kind::Float, Device::Cpu));
        let err = scaled_dot_product_attention(&q, &k, &k, None, 0.0, false).unwrap_err();
        assert!(matches!(err, Error::Torch(_)));
    }

    #[test]
    fn masked_positions_ignore_large_scores() {
        // Huge keys at the masked position would dominate without the mask.
        let q = Tensor::ones([1, 1, 1, 4], (Kind::Float, Device::Cpu));
        let k = Tensor::from_slice(&[0.0f32, 0.0, 0.0, 0.0, 1e3, 1e3, 1e3, 1e3]).view([1, 1, 2, 4]);
        let v = Tensor::from_slice(&[1.0f32, 2.0]).view([1, 1, 2, 1]);
        let mask = Tensor::from_slice(&[1i64, 0]).view([1, 1, 1, 2]);
        let (out, probs) = scaled_dot_product_attention(&q, &k, &v, Some(&mask), 0.0, false).unwrap();
        assert!(probs.double_value(&[0, 0, 0, 1]) < 1e-6);
        assert!((out.double_value(&[0, 0, 0, 0]) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn all_ones_mask_matches_no_mask() {
        let vs = nn::VarStore::new(Device::Cpu);
        let mha = MultiHeadAttention::new(&vs.root(), 16, 4, 0.1).unwrap();
        let xs = rand3(2, 6, 16);
        let ones = Tensor::ones([2, 1, 1, 6], (Kind::Int64, Device::Cpu));
        let masked = mha.forward_t(&xs, &xs, &xs, Some(&ones), false).unwrap();
        let plain = mha.forward_t(&xs, &xs, &xs, None, false).unwrap();
        assert!(masked.allclose(&plain, 1e-5, 1e-6, false));
    }

    #[test]
    fn cross_attention_keeps_query_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let mha = MultiHeadAttention::new(&vs.root(), 16, 2, 0.0).unwrap();
        let query = rand3(3, 4, 16);
        let memory = rand3(3, 9, 16);
        let (out, probs) = mha.forward_with_weights(&query, &memory, &memory, None, false).unwrap();
        assert_eq!(out.size(), [3, 4, 16]);
        assert_eq!(probs.size(), [3, 2, 4, 9]);
    }

    #[test]
    fn incompatible_mask_is_a_shape_mismatch() {
        let vs = nn::VarStore::new(Device::Cpu);
        let mha = MultiHeadAttention::new(&vs.root(), 8, 2, 0.0).unwrap();
        let xs = rand3(2, 5, 8);
        let bad = Tensor::ones([2, 1, 1, 4], (Kind::Int64, Device::Cpu));
        let err = mha.forward_t(&xs, &xs, &xs, Some(&bad), false).unwrap_err();
        assert!(matches!(err, Error::MaskShapeMismatch { .. }));
        let other_batch = rand3(3, 5, 8);
        assert!(mha.forward_t(&other_batch, &xs, &xs, None, false).unwrap_err().is_shape_mismatch());
        let wrong_width = rand3(2, 5, 6);
        assert!(mha.forward_t(&wrong_width, &xs, &xs, None, false).unwrap_err().is_shape_mismatch());
    }

    #[test]
    fn residual_adds_sublayer_output_to_input() {
        struct Zero;
        impl Sublayer for Zero {
            fn forward_sublayer(&self, xs: &Tensor, _train: bool) -> Result<Tensor> {
                Ok(xs.zeros_like())
            }
        }
        let vs = nn::VarStore::new(Device::Cpu);
        let residual = ResidualConnection::new(&vs.root(), 8, 0.5, NORM_EPS);
        let xs = rand3(2, 3, 8);
        assert!(residual.forward_t(&xs, &Zero, true).unwrap().equal(&xs));
    }
}
