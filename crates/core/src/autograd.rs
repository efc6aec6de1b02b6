//! Autograd helpers for penalties that differentiate through a gradient.
//!
//! candle detaches every gradient it produces unless the
//! `CANDLE_GRAD_DO_NOT_DETACH` switch is set when a thread runs its first
//! backward pass. The gradient penalty and the scaling regulariser need the
//! gradient w.r.t. the input to stay attached to the discriminator
//! parameters, so [`enable_second_order`] must run before any backward pass.

use std::sync::Once;

use anyhow::Context;
use candle_core::{Tensor, Var};

const DO_NOT_DETACH: &str = "CANDLE_GRAD_DO_NOT_DETACH";
const SAFE_NORM_EPS: f64 = 1e-10;

static ENABLE: Once = Once::new();

/// Keep backward results attached to the graph in every thread created from
/// now on (and in threads that have not run a backward pass yet).
pub fn enable_second_order() {
    ENABLE.call_once(|| {
        std::env::set_var(DO_NOT_DETACH, "1");
        tracing::debug!("second-order gradients enabled");
    });
}

pub fn second_order_enabled() -> bool {
    std::env::var(DO_NOT_DETACH).map(|v| v == "1").unwrap_or(false)
}

/// Gradient of the scalar `output` w.r.t. `input`, still attached to every
/// other variable `output` depends on.
pub fn input_gradient(output: &Tensor, input: &Var) -> anyhow::Result<Tensor> {
    let grads = output.backward()?;
    grads
        .get(input.as_tensor())
        .cloned()
        .context("output does not depend on the input variable")
}

/// Row-wise L2 norm of `x` flattened to `(batch, -1)`, with an epsilon under
/// the square root so the gradient stays finite at zero.
pub fn safer_norm(x: &Tensor) -> candle_core::Result<Tensor> {
    x.flatten_from(1)?
        .sqr()?
        .sum(1)?
        .affine(1.0, SAFE_NORM_EPS)?
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn gradient_of_square_is_twice_input() {
        let x = Var::new(&[[1f32, -2.0], [0.5, 3.0]], &Device::Cpu).unwrap();
        let y = x.as_tensor().sqr().unwrap().sum_all().unwrap();
        let g: Vec<Vec<f32>> = input_gradient(&y, &x).unwrap().to_vec2().unwrap();
        assert_eq!(g, vec![vec![2.0, -4.0], vec![1.0, 6.0]]);
    }

    #[test]
    fn safer_norm_is_rowwise() {
        let x = Tensor::new(&[[3f32, 4.0], [0.0, 0.0]], &Device::Cpu).unwrap();
        let n: Vec<f32> = safer_norm(&x).unwrap().to_vec1().unwrap();
        assert!((n[0] - 5.0).abs() < 1e-5);
        assert!(n[1] < 1e-4);
    }

    #[test]
    fn independent_input_is_an_error() {
        let x = Var::new(&[1f32, 2.0], &Device::Cpu).unwrap();
        let other = Var::new(&[1f32, 2.0], &Device::Cpu).unwrap();
        let y = other.as_tensor().sum_all().unwrap();
        assert!(input_gradient(&y, &x).is_err());
    }

    #[test]
    fn enabling_is_idempotent() {
        enable_second_order();
        enable_second_order();
        assert!(second_order_enabled());
    }
}
