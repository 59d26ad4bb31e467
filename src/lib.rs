pub mod config;
pub mod error;
pub mod init;
pub mod layers;
pub mod masks;
pub mod model;

pub use config::ModelConfig;
pub use error::{Error, Result};
pub use layers::{
    scaled_dot_product_attention, FeedForward, InputEmbeddings, LayerNormalization,
    MultiHeadAttention, PositionalEncoding, ResidualConnection, Sublayer,
};
pub use masks::{causal_mask, decoder_mask, padding_mask};
pub use model::{build_transformer, Decoder, DecoderBlock, Encoder, EncoderBlock, ProjectionLayer, Transformer};
