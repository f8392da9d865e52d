//! Row initializers: how a key's weights are born on first touch.

use embershard_core::config::{config_f64, config_set};
use embershard_core::{PsError, PsResult};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, Uniform};
use serde_yaml::Mapping;

use crate::scalar::Scalar;

pub trait Initializer<T: Scalar>: Send + Sync {
    fn category(&self) -> &'static str;
    fn train_init(&self, weights: &mut [T]);
    fn load_config(&mut self, config: &Mapping) -> PsResult<()>;
    fn dump_config(&self, config: &mut Mapping);
}

pub fn create_initializer<T: Scalar>(category: &str) -> PsResult<Box<dyn Initializer<T>>> {
    Ok(match category {
        "constant" => Box::new(ConstantInitializer::<T>::default()),
        "uniform" => Box::new(UniformInitializer::<T>::new(0.0, 1.0)),
        "normal" => Box::new(NormalInitializer::<T>::new(0.0, 1.0, 0.0)?),
        other => {
            return Err(PsError::InvalidConfig(format!(
                "unknown initializer \"{other}\""
            )))
        }
    })
}

#[derive(Debug)]
pub struct ConstantInitializer<T> {
    pub value: T,
}

impl<T: Scalar> Default for ConstantInitializer<T> {
    fn default() -> Self {
        Self { value: T::zero() }
    }
}

impl<T: Scalar> Initializer<T> for ConstantInitializer<T> {
    fn category(&self) -> &'static str {
        "constant"
    }

    fn train_init(&self, weights: &mut [T]) {
        weights.fill(self.value);
    }

    fn load_config(&mut self, config: &Mapping) -> PsResult<()> {
        if let Some(v) = config_f64(config, "value") {
            self.value = T::from_config(v);
        }
        Ok(())
    }

    fn dump_config(&self, config: &mut Mapping) {
        config_set(config, "value", self.value.to_f64().unwrap_or(0.0));
    }
}

pub struct UniformInitializer<T> {
    minval: f64,
    maxval: f64,
    distribution: Uniform<f64>,
    rng: Mutex<StdRng>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Scalar> UniformInitializer<T> {
    pub fn new(minval: f64, maxval: f64) -> Self {
        Self {
            minval,
            maxval,
            distribution: Uniform::new_inclusive(minval, maxval),
            rng: Mutex::new(StdRng::from_entropy()),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Scalar> Initializer<T> for UniformInitializer<T> {
    fn category(&self) -> &'static str {
        "uniform"
    }

    fn train_init(&self, weights: &mut [T]) {
        let mut rng = self.rng.lock();
        for w in weights {
            *w = T::from_config(self.distribution.sample(&mut *rng));
        }
    }

    fn load_config(&mut self, config: &Mapping) -> PsResult<()> {
        if let Some(v) = config_f64(config, "minval") {
            self.minval = v;
        }
        if let Some(v) = config_f64(config, "maxval") {
            self.maxval = v;
        }
        if self.maxval < self.minval {
            return Err(PsError::InvalidConfig(format!(
                "uniform initializer range [{}, {}] is empty",
                self.minval, self.maxval
            )));
        }
        self.distribution = Uniform::new_inclusive(self.minval, self.maxval);
        Ok(())
    }

    fn dump_config(&self, config: &mut Mapping) {
        config_set(config, "minval", self.minval);
        config_set(config, "maxval", self.maxval);
    }
}

pub struct NormalInitializer<T> {
    mean: f64,
    stddev: f64,
    /// Resampling bound in standard deviations; values at or below 0.1
    /// disable truncation.
    truncated: f64,
    distribution: Normal<f64>,
    rng: Mutex<StdRng>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Scalar> NormalInitializer<T> {
    pub fn new(mean: f64, stddev: f64, truncated: f64) -> PsResult<Self> {
        let distribution = Normal::new(mean, stddev)
            .map_err(|e| PsError::InvalidConfig(format!("bad normal initializer: {e}")))?;
        Ok(Self {
            mean,
            stddev,
            truncated,
            distribution,
            rng: Mutex::new(StdRng::from_entropy()),
            _marker: std::marker::PhantomData,
        })
    }
}

impl<T: Scalar> Initializer<T> for NormalInitializer<T> {
    fn category(&self) -> &'static str {
        "normal"
    }

    fn train_init(&self, weights: &mut [T]) {
        let mut rng = self.rng.lock();
        for w in weights {
            let mut sample = self.distribution.sample(&mut *rng);
            if self.truncated > 0.1 && self.stddev > 0.0 {
                while ((sample - self.mean) / self.stddev).abs() > self.truncated {
                    sample = self.distribution.sample(&mut *rng);
                }
            }
            *w = T::from_config(sample);
        }
    }

    fn load_config(&mut self, config: &Mapping) -> PsResult<()> {
        if let Some(v) = config_f64(config, "mean") {
            self.mean = v;
        }
        if let Some(v) = config_f64(config, "stddev") {
            self.stddev = v;
        }
        if let Some(v) = config_f64(config, "truncated") {
            self.truncated = v;
        }
        self.distribution = Normal::new(self.mean, self.stddev)
            .map_err(|e| PsError::InvalidConfig(format!("bad normal initializer: {e}")))?;
        Ok(())
    }

    fn dump_config(&self, config: &mut Mapping) {
        config_set(config, "mean", self.mean);
        config_set(config, "stddev", self.stddev);
        config_set(config, "truncated", self.truncated);
    }
}

// keep the rng seedable for deterministic tests
impl<T: Scalar> UniformInitializer<T> {
    #[cfg(test)]
    pub fn seeded(minval: f64, maxval: f64, seed: u64) -> Self {
        let mut init = Self::new(minval, maxval);
        init.rng = Mutex::new(StdRng::seed_from_u64(seed));
        init
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_fills_the_row() {
        let init = ConstantInitializer::<f32> { value: 100.0 };
        let mut row = vec![0.0f32; 4];
        init.train_init(&mut row);
        assert_eq!(row, vec![100.0; 4]);
    }

    #[test]
    fn uniform_stays_in_range() {
        let init = UniformInitializer::<f64>::seeded(-2.0, 3.0, 7);
        let mut row = vec![0.0f64; 256];
        init.train_init(&mut row);
        assert!(row.iter().all(|&v| (-2.0..=3.0).contains(&v)));
        // not all equal
        assert!(row.iter().any(|&v| v != row[0]));
    }

    #[test]
    fn truncated_normal_respects_the_bound() {
        let mut init = NormalInitializer::<f64>::new(0.0, 1.0, 0.0).unwrap();
        let mut config = Mapping::new();
        config_set(&mut config, "truncated", 2.0);
        init.load_config(&config).unwrap();

        let mut row = vec![0.0f64; 512];
        init.train_init(&mut row);
        assert!(row.iter().all(|&v| v.abs() <= 2.0));
    }

    #[test]
    fn uniform_rejects_empty_range() {
        let mut init = UniformInitializer::<f32>::new(0.0, 1.0);
        let mut config = Mapping::new();
        config_set(&mut config, "minval", 2.0);
        config_set(&mut config, "maxval", 1.0);
        assert!(init.load_config(&config).is_err());
    }

    #[test]
    fn factory_round_trips_categories() {
        for category in ["constant", "uniform", "normal"] {
            let init = create_initializer::<f32>(category).unwrap();
            assert_eq!(init.category(), category);
        }
        assert!(create_initializer::<f32>("xavier").is_err());
    }
}
