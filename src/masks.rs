//! Attention masks in the 0/1 convention: nonzero means "may attend".

use tch::{Device, Kind, Tensor};

use crate::error::Result;
use crate::layers::expect_rank;

/// Lower-triangular mask of shape `[1, 1, len, len]`: position `i` may
/// attend to positions `0..=i` only.
pub fn causal_mask(len: i64, device: Device) -> Tensor {
    Tensor::ones([len, len], (Kind::Int64, device))
        .tril(0)
        .view([1, 1, len, len])
}

/// Key-padding mask of shape `[batch, 1, 1, len]` for ids `[batch, len]`.
pub fn padding_mask(ids: &Tensor, pad_id: i64) -> Result<Tensor> {
    expect_rank(ids, 2, "[batch, seq_len]")?;
    let (batch_size, len) = ids.size2()?;
    Ok(ids.ne(pad_id).to_kind(Kind::Int64).view([batch_size, 1, 1, len]))
}

/// Padding and causal masks combined, shape `[batch, 1, len, len]`.
pub fn decoder_mask(ids: &Tensor, pad_id: i64) -> Result<Tensor> {
    let padding = padding_mask(ids, pad_id)?.to_kind(Kind::Bool);
    let len = ids.size()[1];
    let causal = causal_mask(len, ids.device()).to_kind(Kind::Bool);
    Ok(padding.logical_and(&causal).to_kind(Kind::Int64))
}
