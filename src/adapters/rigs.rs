use crate::config::{RigConfig, Town};

use super::{Rig, RigRegistry};

/// Rigs declared in `town.toml`.
#[derive(Debug, Clone)]
pub struct ConfigRigs {
    town: Town,
}

impl ConfigRigs {
    pub const fn new(town: Town) -> Self {
        Self { town }
    }
}

impl ConfigRigs {
    fn rig(&self, name: &str, cfg: &RigConfig) -> Rig {
        Rig {
            name: name.to_string(),
            path: self.town.resolve(&cfg.path),
            default_branch: cfg.default_branch.clone(),
            prefix: cfg.prefix.clone(),
        }
    }
}

impl RigRegistry for ConfigRigs {
    fn get_rig(&self, name: &str) -> anyhow::Result<Option<Rig>> {
        Ok(self.town.config.rigs.get(name).map(|cfg| self.rig(name, cfg)))
    }

    fn list_rigs(&self) -> anyhow::Result<Vec<Rig>> {
        Ok(self
            .town
            .config
            .rigs
            .iter()
            .map(|(name, cfg)| self.rig(name, cfg))
            .collect())
    }
}
