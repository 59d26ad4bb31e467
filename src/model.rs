use std::borrow::Borrow;

use tch::{nn, Kind, Tensor};
use tracing::debug;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::init::xavier_uniform_;
use crate::layers::{
    expect_last_dim, FeedForward, InputEmbeddings, LayerNormalization, MultiHeadAttention,
    PositionalEncoding, ResidualConnection, Sublayer,
};

/// Attention where query, key and value are all the sublayer input.
struct SelfAttention<'a> {
    attn: &'a MultiHeadAttention,
    mask: Option<&'a Tensor>,
}

impl Sublayer for SelfAttention<'_> {
    fn forward_sublayer(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        self.attn.forward_t(xs, xs, xs, self.mask, train)
    }
}

/// Attention from the sublayer input onto the encoder output.
struct CrossAttention<'a> {
    attn: &'a MultiHeadAttention,
    memory: &'a Tensor,
    mask: Option<&'a Tensor>,
}

impl Sublayer for CrossAttention<'_> {
    fn forward_sublayer(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        self.attn.forward_t(xs, self.memory, self.memory, self.mask, train)
    }
}

#[derive(Debug)]
pub struct EncoderBlock {
    self_attn: MultiHeadAttention,
    feed_forward: FeedForward,
    residuals: [ResidualConnection; 2],
}

impl EncoderBlock {
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(vs: P, cfg: &ModelConfig) -> Result<Self> {
        let vs = vs.borrow();
        let self_attn = MultiHeadAttention::new(vs / "self_attn", cfg.d_model, cfg.num_heads, cfg.dropout)?;
        let feed_forward = FeedForward::new(vs / "feed_forward", cfg.d_model, cfg.d_ff, cfg.dropout);
        let residuals = [
            ResidualConnection::new(vs / "residual0", cfg.d_model, cfg.dropout, cfg.eps),
            ResidualConnection::new(vs / "residual1", cfg.d_model, cfg.dropout, cfg.eps),
        ];
        Ok(Self { self_attn, feed_forward, residuals })
    }

    /// Self-attention then feed-forward, each behind a pre-norm residual.
    pub fn forward_t(&self, xs: &Tensor, src_mask: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let attn = SelfAttention { attn: &self.self_attn, mask: src_mask };
        let xs = self.residuals[0].forward_t(xs, &attn, train)?;
        self.residuals[1].forward_t(&xs, &self.feed_forward, train)
    }
}

#[derive(Debug)]
pub struct Encoder {
    layers: Vec<EncoderBlock>,
    norm: LayerNormalization,
}

impl Encoder {
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(vs: P, cfg: &ModelConfig) -> Result<Self> {
        let vs = vs.borrow();
        let layers = (0..cfg.num_layers)
            .map(|i| EncoderBlock::new(vs / format!("layer{i}"), cfg))
            .collect::<Result<Vec<_>>>()?;
        let norm = LayerNormalization::new(vs / "norm", cfg.d_model, cfg.eps);
        Ok(Self { layers, norm })
    }

    pub fn layers(&self) -> &[EncoderBlock] {
        &self.layers
    }

    pub fn forward_t(&self, xs: &Tensor, src_mask: Option<&Tensor>, train: bool) -> Result<Tensor> {
        // Every block keeps `xs` at [batch_size, src_len, d_model].
        let mut xs = xs.shallow_clone();
        for layer in &self.layers {
            xs = layer.forward_t(&xs, src_mask, train)?;
        }

        // Blocks are pre-norm, so the stack output still needs normalizing.
        Ok(xs.apply(&self.norm))
    }
}

#[derive(Debug)]
pub struct DecoderBlock {
    self_attn: MultiHeadAttention,
    cross_attn: MultiHeadAttention,
    feed_forward: FeedForward,
    residuals: [ResidualConnection; 3],
}

impl DecoderBlock {
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(vs: P, cfg: &ModelConfig) -> Result<Self> {
        let vs = vs.borrow();
        let self_attn = MultiHeadAttention::new(vs / "self_attn", cfg.d_model, cfg.num_heads, cfg.dropout)?;
        let cross_attn = MultiHeadAttention::new(vs / "cross_attn", cfg.d_model, cfg.num_heads, cfg.dropout)?;
        let feed_forward = FeedForward::new(vs / "feed_forward", cfg.d_model, cfg.d_ff, cfg.dropout);
        let residuals = [
            ResidualConnection::new(vs / "residual0", cfg.d_model, cfg.dropout, cfg.eps),
            ResidualConnection::new(vs / "residual1", cfg.d_model, cfg.dropout, cfg.eps),
            ResidualConnection::new(vs / "residual2", cfg.d_model, cfg.dropout, cfg.eps),
        ];
        Ok(Self { self_attn, cross_attn, feed_forward, residuals })
    }

    /// Masked self-attention, cross-attention onto `memory`, then feed-forward.
    ///
    /// `tgt_mask` gates the self-attention and `src_mask` the cross-attention.
    pub fn forward_t(
        &self,
        xs: &Tensor,
        memory: &Tensor,
        src_mask: Option<&Tensor>,
        tgt_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let self_attn = SelfAttention { attn: &self.self_attn, mask: tgt_mask };
        let xs = self.residuals[0].forward_t(xs, &self_attn, train)?;
        let cross_attn = CrossAttention { attn: &self.cross_attn, memory, mask: src_mask };
        let xs = self.residuals[1].forward_t(&xs, &cross_attn, train)?;
        self.residuals[2].forward_t(&xs, &self.feed_forward, train)
    }
}

#[derive(Debug)]
pub struct Decoder {
    layers: Vec<DecoderBlock>,
    norm: LayerNormalization,
}

impl Decoder {
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(vs: P, cfg: &ModelConfig) -> Result<Self> {
        let vs = vs.borrow();
        let layers = (0..cfg.num_layers)
            .map(|i| DecoderBlock::new(vs / format!("layer{i}"), cfg))
            .collect::<Result<Vec<_>>>()?;
        let norm = LayerNormalization::new(vs / "norm", cfg.d_model, cfg.eps);
        Ok(Self { layers, norm })
    }

    pub fn layers(&self) -> &[DecoderBlock] {
        &self.layers
    }

    pub fn forward_t(
        &self,
        xs: &Tensor,
        memory: &Tensor,
        src_mask: Option<&Tensor>,
        tgt_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        // `xs` stays [batch_size, tgt_len, d_model]; `memory` is [batch_size, src_len, d_model].
        let mut xs = xs.shallow_clone();
        for layer in &self.layers {
            xs = layer.forward_t(&xs, memory, src_mask, tgt_mask, train)?;
        }
        Ok(xs.apply(&self.norm))
    }
}

/// Linear map to the target vocabulary followed by log-softmax over it.
#[derive(Debug)]
pub struct ProjectionLayer {
    proj: nn::Linear,
}

impl ProjectionLayer {
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(vs: P, d_model: i64, vocab_size: i64) -> Self {
        let proj = nn::linear(vs.borrow() / "proj", d_model, vocab_size, Default::default());
        Self { proj }
    }
}

impl nn::Module for ProjectionLayer {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.proj).log_softmax(-1, Kind::Float)
    }
}

#[derive(Debug)]
pub struct Transformer {
    encoder: Encoder,
    decoder: Decoder,
    src_embed: InputEmbeddings,
    tgt_embed: InputEmbeddings,
    src_pos: PositionalEncoding,
    tgt_pos: PositionalEncoding,
    projection: ProjectionLayer,
    config: ModelConfig,
}

impl Transformer {
    /// Creates the encoder-decoder Transformer.
    ///
    /// Parameters keep their per-layer default initialisation; use
    /// [`build_transformer`] for the Xavier-initialised model.
    ///
    /// Args:
    ///   vs: The `nn::Path` for `VarStore` ownership.
    ///   cfg: Hyperparameters, validated before anything is allocated.
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(vs: P, cfg: &ModelConfig) -> Result<Self> {
        cfg.validate()?;
        let vs = vs.borrow();
        let device = vs.device();

        let src_embed = InputEmbeddings::new(vs / "src_embed", cfg.src_vocab_size, cfg.d_model);
        let tgt_embed = InputEmbeddings::new(vs / "tgt_embed", cfg.tgt_vocab_size, cfg.d_model);

        // Fixed tables, kept out of the VarStore.
        let src_pos = PositionalEncoding::new(cfg.d_model, cfg.src_seq_len, cfg.dropout, device);
        let tgt_pos = PositionalEncoding::new(cfg.d_model, cfg.tgt_seq_len, cfg.dropout, device);

        let encoder = Encoder::new(vs / "encoder", cfg)?;
        let decoder = Decoder::new(vs / "decoder", cfg)?;
        let projection = ProjectionLayer::new(vs / "projection", cfg.d_model, cfg.tgt_vocab_size);

        Ok(Self {
            encoder,
            decoder,
            src_embed,
            tgt_embed,
            src_pos,
            tgt_pos,
            projection,
            config: cfg.clone(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    /// `[batch, src_len]` ids -> `[batch, src_len, d_model]`.
    pub fn encode(&self, src: &Tensor, src_mask: Option<&Tensor>, train: bool) -> Result<Tensor> {
        // 1. Token embeddings.
        // Input `src` shape: [batch_size, src_len]
        // Output `xs` shape: [batch_size, src_len, d_model]
        let xs = self.src_embed.forward(src)?;

        // 2. Add positional encoding, shape unchanged.
        let xs = self.src_pos.forward_t(&xs, train)?;

        // 3. Encoder stack with its trailing normalization.
        self.encoder.forward_t(&xs, src_mask, train)
    }

    /// `[batch, tgt_len]` ids attending to `memory` -> `[batch, tgt_len, d_model]`.
    pub fn decode(
        &self,
        memory: &Tensor,
        src_mask: Option<&Tensor>,
        tgt: &Tensor,
        tgt_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        // [batch_size, tgt_len] -> [batch_size, tgt_len, d_model]
        let xs = self.tgt_embed.forward(tgt)?;
        let xs = self.tgt_pos.forward_t(&xs, train)?;
        self.decoder.forward_t(&xs, memory, src_mask, tgt_mask, train)
    }

    /// Log-probabilities over the target vocabulary, `[.., tgt_vocab_size]`.
    pub fn project(&self, xs: &Tensor) -> Result<Tensor> {
        expect_last_dim(xs, self.config.d_model)?;
        Ok(xs.apply(&self.projection))
    }

    /// encode, decode and project in one call.
    pub fn forward_t(
        &self,
        src: &Tensor,
        tgt: &Tensor,
        src_mask: Option<&Tensor>,
        tgt_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let memory = self.encode(src, src_mask, train)?;
        let xs = self.decode(&memory, src_mask, tgt, tgt_mask, train)?;
        self.project(&xs)
    }
}

/// Builds the model into `vs` and Xavier-initialises every weight matrix.
///
/// When `cfg.seed` is set, libtorch's global generator is seeded first, so
/// the same config always yields the same parameters.
pub fn build_transformer(vs: &nn::VarStore, cfg: &ModelConfig) -> Result<Transformer> {
    cfg.validate()?;
    if let Some(seed) = cfg.seed {
        tch::manual_seed(seed as i64);
    }
    let model = Transformer::new(&vs.root(), cfg)?;
    let initialised = xavier_uniform_(vs);
    let num_params: i64 = vs.trainable_variables().iter().map(|t| t.numel() as i64).sum();
    debug!(
        d_model = cfg.d_model,
        layers = cfg.num_layers,
        heads = cfg.num_heads,
        initialised,
        num_params,
        "built transformer"
    );
    Ok(model)
}
