use crate::error::{Error, Result};

/// How the independent work units of a training step or an inference pass
/// are scheduled.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Parallelism {
    Sequential,
    /// Spread across the rayon global pool.
    #[default]
    Parallel,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrainerConfig {
    pub learning_rate: f64,
    /// Seeds parameter initialisation; `None` draws from the thread RNG.
    pub seed: Option<u64>,
    /// Stop on our own after this many steps.
    pub max_iterations: Option<u64>,
    pub parallelism: Parallelism,
}

impl TrainerConfig {
    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub fn with_parallelism(mut self, parallelism: Parallelism) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "learning rate must be finite and positive, got {}",
                self.learning_rate
            )));
        }
        if self.max_iterations == Some(0) {
            return Err(Error::InvalidConfig(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            seed: None,
            max_iterations: None,
            parallelism: Parallelism::default(),
        }
    }
}
