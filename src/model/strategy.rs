//! Multi-task strategies: how tasks share the representation and how per-task
//! losses are combined

use crate::codec::Representation;
use crate::error::{Error, Result};
use std::fmt;

/// Registered architecture names
pub const ARCHITECTURES: &[&str] = &["HPS"];

/// Registered weighting names
pub const WEIGHTINGS: &[&str] = &["EW", "GLS"];

/// Routes the shared representation to a task head
pub trait Architecture: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Representation seen by the head of `task`
    fn prepare_rep<'a>(&self, task: &str, rep: &'a Representation) -> &'a Representation;
}

/// Combines per-task losses into one scalar
pub trait Weighting: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Combine `losses`, given in task order
    fn combine(&self, losses: &[f64]) -> Result<f64>;
}

/// Hard parameter sharing: every task reads the same representation
#[derive(Debug, Clone, Copy, Default)]
pub struct Hps;

impl Architecture for Hps {
    fn name(&self) -> &'static str {
        "HPS"
    }

    fn prepare_rep<'a>(&self, _task: &str, rep: &'a Representation) -> &'a Representation {
        rep
    }
}

/// Equal weighting: plain sum
#[derive(Debug, Clone, Copy, Default)]
pub struct EqualWeighting;

impl Weighting for EqualWeighting {
    fn name(&self) -> &'static str {
        "EW"
    }

    fn combine(&self, losses: &[f64]) -> Result<f64> {
        Ok(losses.iter().sum())
    }
}

/// Geometric loss strategy: geometric mean of the losses
#[derive(Debug, Clone, Copy, Default)]
pub struct GeometricLossStrategy;

impl Weighting for GeometricLossStrategy {
    fn name(&self) -> &'static str {
        "GLS"
    }

    fn combine(&self, losses: &[f64]) -> Result<f64> {
        if losses.is_empty() {
            return Err(Error::invalid_config("GLS needs at least one loss"));
        }
        if let Some(bad) = losses.iter().find(|l| !(**l > 0.0)) {
            return Err(Error::invalid_config(format!(
                "GLS needs positive losses, got {}",
                bad
            )));
        }
        // mean of logs keeps large task counts from overflowing the product
        let log_mean = losses.iter().map(|l| l.ln()).sum::<f64>() / losses.len() as f64;
        Ok(log_mean.exp())
    }
}

/// Create an architecture strategy by name
pub fn create_architecture(name: &str) -> Result<Box<dyn Architecture>> {
    match name {
        "HPS" => Ok(Box::new(Hps)),
        _ => Err(Error::unknown_capability("architecture", name, ARCHITECTURES)),
    }
}

/// Create a weighting strategy by name
pub fn create_weighting(name: &str) -> Result<Box<dyn Weighting>> {
    match name {
        "EW" => Ok(Box::new(EqualWeighting)),
        "GLS" => Ok(Box::new(GeometricLossStrategy)),
        _ => Err(Error::unknown_capability("weighting", name, WEIGHTINGS)),
    }
}
