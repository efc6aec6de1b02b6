//! Generator / discriminator parameter partition.

use candle_core::Var;
use candle_nn::VarMap;

use mmd_common::TrainError;

pub const GENERATOR_PREFIX: &str = "g_";
pub const DISCRIMINATOR_PREFIX: &str = "d_";
/// Suffixes of variables the optimiser never touches.
const NON_TRAINABLE_SUFFIXES: [&str; 2] = [".running_mean", ".running_var"];

/// Which side of the adversarial game a parameter (or an update) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    Generator,
    Discriminator,
}

impl Group {
    pub fn of(name: &str) -> Option<Self> {
        if name.starts_with(GENERATOR_PREFIX) {
            Some(Self::Generator)
        } else if name.starts_with(DISCRIMINATOR_PREFIX) {
            Some(Self::Discriminator)
        } else {
            None
        }
    }
}

pub fn is_trainable(name: &str) -> bool {
    !NON_TRAINABLE_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// Disjoint, name-sorted sets of trainable variables.
#[derive(Clone)]
pub struct ParameterGroups {
    generator: Vec<(String, Var)>,
    discriminator: Vec<(String, Var)>,
}

impl ParameterGroups {
    /// Split every trainable variable of `varmap` by name prefix.
    ///
    /// A trainable variable with neither prefix is a configuration error.
    pub fn partition(varmap: &VarMap) -> anyhow::Result<Self> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("varmap lock poisoned"))?;
        let mut generator = Vec::new();
        let mut discriminator = Vec::new();
        for (name, var) in data.iter().filter(|(n, _)| is_trainable(n)) {
            match Group::of(name) {
                Some(Group::Generator) => generator.push((name.clone(), var.clone())),
                Some(Group::Discriminator) => discriminator.push((name.clone(), var.clone())),
                None => {
                    return Err(TrainError::Config(format!(
                        "trainable variable '{name}' has neither '{GENERATOR_PREFIX}' nor '{DISCRIMINATOR_PREFIX}' prefix"
                    ))
                    .into())
                }
            }
        }
        generator.sort_by(|a, b| a.0.cmp(&b.0));
        discriminator.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Self {
            generator,
            discriminator,
        })
    }

    pub fn get(&self, group: Group) -> &[(String, Var)] {
        match group {
            Group::Generator => &self.generator,
            Group::Discriminator => &self.discriminator,
        }
    }

    pub fn vars(&self, group: Group) -> Vec<Var> {
        self.get(group).iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn num_params(&self, group: Group) -> usize {
        self.get(group).iter().map(|(_, v)| v.elem_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::Init;

    fn add(varmap: &VarMap, name: &str) {
        varmap
            .get(2, name, Init::Const(0.0), DType::F32, &Device::Cpu)
            .unwrap();
    }

    #[test]
    fn partition_is_disjoint_and_complete() {
        let varmap = VarMap::new();
        for name in ["g_h0.weight", "g_h0.bias", "d_h0.weight", "d_hF.bias", "g_bn0.running_mean"] {
            add(&varmap, name);
        }
        let groups = ParameterGroups::partition(&varmap).unwrap();
        let g: Vec<_> = groups.get(Group::Generator).iter().map(|(n, _)| n.as_str()).collect();
        let d: Vec<_> = groups.get(Group::Discriminator).iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(g, vec!["g_h0.bias", "g_h0.weight"]);
        assert_eq!(d, vec!["d_h0.weight", "d_hF.bias"]);
        assert_eq!(groups.num_params(Group::Generator), 4);
    }

    #[test]
    fn unprefixed_trainable_is_rejected() {
        let varmap = VarMap::new();
        add(&varmap, "g_h0.weight");
        add(&varmap, "proj.weight");
        assert!(ParameterGroups::partition(&varmap).is_err());
    }
}
