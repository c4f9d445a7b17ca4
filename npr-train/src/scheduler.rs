//! Reduce-on-plateau learning-rate schedule
//!
//! Tracks the best (lowest) validation loss with a relative threshold. After
//! more than `patience` epochs without improvement the rate is multiplied by
//! `factor`, bounded below by `min_lr`, followed by `cooldown` epochs in which
//! bad epochs are not counted.

use crate::error::{Result, TrainError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Rate changes smaller than this are ignored.
const MIN_DELTA: f64 = 1e-8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlateauConfig {
    pub factor: f64,
    pub patience: usize,
    /// Relative improvement needed to count as better.
    pub threshold: f64,
    pub cooldown: usize,
    pub min_lr: f64,
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            factor: 0.75,
            patience: 10,
            threshold: 1e-4,
            cooldown: 25,
            min_lr: 5e-5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceOnPlateau {
    config: PlateauConfig,
    lr: f64,
    best: Option<f64>,
    bad_epochs: usize,
    cooldown_left: usize,
    last_epoch: usize,
}

impl ReduceOnPlateau {
    pub fn new(config: PlateauConfig, initial_lr: f64) -> Self {
        Self {
            config,
            lr: initial_lr,
            best: None,
            bad_epochs: 0,
            cooldown_left: 0,
            last_epoch: 0,
        }
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    fn is_better(&self, metric: f64) -> bool {
        match self.best {
            None => true,
            Some(best) => metric < best * (1.0 - self.config.threshold),
        }
    }

    /// Records one epoch's metric and returns the learning rate to use next.
    pub fn step(&mut self, metric: f64) -> f64 {
        self.last_epoch += 1;
        if self.is_better(metric) {
            self.best = Some(metric);
            self.bad_epochs = 0;
        } else {
            self.bad_epochs += 1;
        }

        if self.cooldown_left > 0 {
            self.cooldown_left -= 1;
            self.bad_epochs = 0;
        }

        if self.bad_epochs > self.config.patience {
            let reduced = (self.lr * self.config.factor).max(self.config.min_lr);
            if self.lr - reduced > MIN_DELTA {
                tracing::info!(epoch = self.last_epoch, from = self.lr, to = reduced, "reducing learning rate");
                self.lr = reduced;
            }
            self.cooldown_left = self.config.cooldown;
            self.bad_epochs = 0;
        }
        self.lr
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| TrainError::io(path, e))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| TrainError::io(path, e))?;
        Ok(serde_json::from_str(&json)?)
    }
}
