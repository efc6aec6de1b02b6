//! Cross-tower gradient and statistic averaging.
//!
//! Every tower reports one `GradStore` per loss. Before a store leaves its
//! tower, the gradients of the group being trained are detached from the
//! graph and, when clipping is on, clipped one tensor at a time. The
//! aggregator then takes the elementwise mean per parameter. Clipping before
//! the mean bounds what any single tower can contribute.

use std::collections::BTreeMap;

use candle_core::{backprop::GradStore, Tensor, Var};

use mmd_common::TrainError;
use mmd_core::StatUpdate;

/// Norm every gradient tensor is clipped to when `clip_grad` is set.
pub const CLIP_NORM: f64 = 1.0;

// ── Gradient utilities ──────────────────────────────────────────────────────

/// Rescale `t` so its L2 norm is at most `max_norm`.
pub fn clip_by_norm(t: &Tensor, max_norm: f64) -> candle_core::Result<Tensor> {
    let norm = t.sqr()?.sum_all()?.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?.sqrt();
    if norm > max_norm {
        t.affine(max_norm / norm, 0.0)
    } else {
        Ok(t.clone())
    }
}

/// Detach (and optionally clip) the gradients of `params` inside a tower's
/// store. A parameter without a gradient is a graph mismatch.
pub fn prepare_tower_gradients(
    grads: &mut GradStore,
    params: &[(String, Var)],
    clip: Option<f64>,
    tower: usize,
) -> anyhow::Result<()> {
    for (name, var) in params {
        let g = grads.remove(var.as_tensor()).ok_or_else(|| TrainError::MissingGradient {
            name: name.clone(),
            tower,
        })?;
        let g = g.detach();
        let g = match clip {
            Some(max_norm) => clip_by_norm(&g, max_norm)?,
            None => g,
        };
        grads.insert(var.as_tensor(), g);
    }
    Ok(())
}

/// Per-parameter mean over towers. A single tower is returned untouched.
pub fn average_gradients(towers: Vec<GradStore>, params: &[(String, Var)]) -> anyhow::Result<GradStore> {
    let n = towers.len();
    let mut towers = towers.into_iter();
    let mut base = towers
        .next()
        .ok_or_else(|| anyhow::anyhow!("no tower gradients to aggregate"))?;
    if n == 1 {
        return Ok(base);
    }
    let rest: Vec<GradStore> = towers.collect();
    for (name, var) in params {
        let missing = |tower| TrainError::MissingGradient {
            name: name.clone(),
            tower,
        };
        let mut sum = base.remove(var.as_tensor()).ok_or_else(|| missing(0))?;
        for (i, store) in rest.iter().enumerate() {
            let g = store.get(var.as_tensor()).ok_or_else(|| missing(i + 1))?;
            sum = (sum + g)?;
        }
        base.insert(var.as_tensor(), sum.affine(1.0 / n as f64, 0.0)?);
    }
    Ok(base)
}

/// Mean of every statistic update reported by the towers, keyed by variable
/// name. Updates reported by only some towers average over those towers.
pub fn average_stat_updates(towers: Vec<Vec<StatUpdate>>) -> anyhow::Result<Vec<StatUpdate>> {
    let mut grouped: BTreeMap<String, (Var, Vec<Tensor>)> = BTreeMap::new();
    for update in towers.into_iter().flatten() {
        grouped
            .entry(update.name)
            .or_insert_with(|| (update.var, Vec::new()))
            .1
            .push(update.value);
    }
    let mut out = Vec::with_capacity(grouped.len());
    for (name, (var, values)) in grouped {
        let value = if values.len() == 1 {
            values[0].clone()
        } else {
            Tensor::stack(&values, 0)?.mean(0)?
        };
        out.push(StatUpdate { name, var, value });
    }
    Ok(out)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn param() -> (String, Var) {
        ("d_w".to_string(), Var::new(&[1f32, 2.0, 3.0], &Device::Cpu).unwrap())
    }

    /// Gradient of `sum(c · w)` is `c` everywhere.
    fn store_with_slope(var: &Var, c: f64) -> GradStore {
        var.as_tensor().affine(c, 0.0).unwrap().sum_all().unwrap().backward().unwrap()
    }

    fn grad_of(store: &GradStore, var: &Var) -> Vec<f32> {
        store.get(var.as_tensor()).unwrap().to_vec1().unwrap()
    }

    #[test]
    fn single_tower_is_identity() {
        let p = param();
        let store = store_with_slope(&p.1, 0.5);
        let before = grad_of(&store, &p.1);
        let out = average_gradients(vec![store], std::slice::from_ref(&p)).unwrap();
        assert_eq!(grad_of(&out, &p.1), before);
    }

    #[test]
    fn uniform_towers_average_to_the_same_gradient() {
        let p = param();
        let stores = (0..4).map(|_| store_with_slope(&p.1, 2.0)).collect();
        let out = average_gradients(stores, std::slice::from_ref(&p)).unwrap();
        assert_eq!(grad_of(&out, &p.1), vec![2.0, 2.0, 2.0]);
    }

    #[test]
    fn towers_are_averaged_elementwise() {
        let p = param();
        let stores = vec![store_with_slope(&p.1, 1.0), store_with_slope(&p.1, 3.0)];
        let out = average_gradients(stores, std::slice::from_ref(&p)).unwrap();
        assert_eq!(grad_of(&out, &p.1), vec![2.0, 2.0, 2.0]);
    }

    #[test]
    fn missing_gradient_names_tower_and_parameter() {
        let p = param();
        let other = Var::new(&[0f32], &Device::Cpu).unwrap();
        let stores = vec![store_with_slope(&p.1, 1.0), store_with_slope(&other, 1.0)];
        let err = average_gradients(stores, std::slice::from_ref(&p)).unwrap_err();
        match err.downcast_ref::<TrainError>() {
            Some(TrainError::MissingGradient { name, tower }) => {
                assert_eq!(name, "d_w");
                assert_eq!(*tower, 1);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn clip_then_average_bounds_each_tower() {
        let p = param();
        let mut big = store_with_slope(&p.1, 100.0);
        let mut small = store_with_slope(&p.1, 0.1);
        prepare_tower_gradients(&mut big, std::slice::from_ref(&p), Some(CLIP_NORM), 0).unwrap();
        prepare_tower_gradients(&mut small, std::slice::from_ref(&p), Some(CLIP_NORM), 1).unwrap();
        let clipped = grad_of(&big, &p.1);
        let norm: f32 = clipped.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        // Small gradients pass through untouched.
        for v in grad_of(&small, &p.1) {
            assert!((v - 0.1).abs() < 1e-6);
        }
        let out = average_gradients(vec![big, small], std::slice::from_ref(&p)).unwrap();
        let expected = (1.0 / 3f32.sqrt() + 0.1) / 2.0;
        for v in grad_of(&out, &p.1) {
            assert!((v - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn stat_updates_are_averaged_by_name() {
        let running = Var::new(&[0f32, 0.0], &Device::Cpu).unwrap();
        let update = |v: f32| StatUpdate {
            name: "g_bn0.running_mean".into(),
            var: running.clone(),
            value: Tensor::new(&[v, 2.0 * v], &Device::Cpu).unwrap(),
        };
        let out = average_stat_updates(vec![vec![update(1.0)], vec![update(3.0)]]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value.to_vec1::<f32>().unwrap(), vec![2.0, 4.0]);
    }
}
