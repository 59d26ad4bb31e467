//! Parameter initialisation over a whole `VarStore`.

use tch::{nn, Tensor};
use tracing::trace;

/// (fan_in, fan_out) for a weight of shape `[out, in, ..]`.
fn compute_fans(dims: &[i64]) -> (f64, f64) {
    let receptive_field: i64 = dims[2..].iter().product();
    let fan_in = (dims[1] * receptive_field) as f64;
    let fan_out = (dims[0] * receptive_field) as f64;
    (fan_in, fan_out)
}

/// Re-draws every variable with two or more dimensions from
/// `U(-b, b)`, `b = sqrt(6 / (fan_in + fan_out))`.
///
/// One-dimensional variables (biases, normalization scale and shift) keep
/// whatever they were created with. Variables are visited in name order so
/// that a seeded generator always yields the same weights.
///
/// Returns the number of tensors re-initialised.
pub fn xavier_uniform_(vs: &nn::VarStore) -> usize {
    let mut variables: Vec<(String, Tensor)> = vs.variables().into_iter().collect();
    variables.sort_by(|a, b| a.0.cmp(&b.0));

    tch::no_grad(|| {
        let mut initialised = 0;
        for (name, mut var) in variables {
            if var.dim() < 2 {
                continue;
            }
            let (fan_in, fan_out) = compute_fans(&var.size());
            let bound = (6.0 / (fan_in + fan_out)).sqrt();
            let _ = var.uniform_(-bound, bound);
            trace!(name = %name, shape = ?var.size(), bound, "xavier-uniform");
            initialised += 1;
        }
        initialised
    })
}
