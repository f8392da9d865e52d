//! Per-variable optimizers.
//!
//! Each optimizer is a stateless strategy over `(weights, state)` rows; the
//! state lives co-located with the row in the owning table, laid out as
//! `state_dim(d)` extra elements. `count` is the summed push multiplicity
//! for the key within the reduced batch.

use embershard_core::config::{config_bool, config_f64, config_set};
use embershard_core::{PsError, PsResult};
use serde_yaml::Mapping;

use crate::scalar::Scalar;

pub trait Optimizer<T: Scalar>: Send + Sync {
    fn category(&self) -> &'static str;
    fn state_dim(&self, embedding_dim: usize) -> usize;
    fn train_init(&self, state: &mut [T], embedding_dim: usize);
    fn update(&mut self, weights: &mut [T], state: &mut [T], count: u64, gradients: &[T]);
    fn load_config(&mut self, config: &Mapping);
    fn dump_config(&self, config: &mut Mapping);
}

pub fn create_optimizer<T: Scalar>(category: &str) -> PsResult<Box<dyn Optimizer<T>>> {
    Ok(match category {
        "default" => Box::new(DefaultOptimizer::<T>::default()),
        "sgd" => Box::new(SgdOptimizer::<T>::default()),
        "adagrad" => Box::new(AdagradOptimizer::<T>::default()),
        "adadelta" => Box::new(AdadeltaOptimizer::<T>::default()),
        "rmsprop" => Box::new(RmspropOptimizer::<T>::default()),
        "adam" => Box::new(AdamOptimizer::<T>::default()),
        "adamax" => Box::new(AdamaxOptimizer::<T>::default()),
        "ftrl" => Box::new(FtrlOptimizer::<T>::default()),
        "test" => Box::new(TestOptimizer::<T>::default()),
        other => {
            return Err(PsError::InvalidConfig(format!(
                "unknown optimizer \"{other}\""
            )))
        }
    })
}

fn load_param<T: Scalar>(config: &Mapping, key: &str, target: &mut T) {
    if let Some(v) = config_f64(config, key) {
        *target = T::from_config(v);
    }
}

fn dump_param<T: Scalar>(config: &mut Mapping, key: &str, value: T) {
    config_set(config, key, value.to_f64().unwrap_or(0.0));
}

/// Plain SGD without momentum; the optimizer every variable starts with.
#[derive(Debug)]
pub struct DefaultOptimizer<T> {
    pub learning_rate: T,
}

impl<T: Scalar> Default for DefaultOptimizer<T> {
    fn default() -> Self {
        Self {
            learning_rate: T::zero(),
        }
    }
}

impl<T: Scalar> Optimizer<T> for DefaultOptimizer<T> {
    fn category(&self) -> &'static str {
        "default"
    }

    fn state_dim(&self, _embedding_dim: usize) -> usize {
        0
    }

    fn train_init(&self, _state: &mut [T], _embedding_dim: usize) {}

    fn update(&mut self, weights: &mut [T], _state: &mut [T], _count: u64, gradients: &[T]) {
        if self.learning_rate != T::zero() {
            for (w, &g) in weights.iter_mut().zip(gradients) {
                *w = *w - self.learning_rate * g;
            }
        }
    }

    fn load_config(&mut self, config: &Mapping) {
        load_param(config, "learning_rate", &mut self.learning_rate);
    }

    fn dump_config(&self, config: &mut Mapping) {
        dump_param(config, "learning_rate", self.learning_rate);
    }
}

#[derive(Debug)]
pub struct SgdOptimizer<T> {
    pub learning_rate: T,
    pub momentum: T,
    pub nesterov: bool,
}

impl<T: Scalar> Default for SgdOptimizer<T> {
    fn default() -> Self {
        Self {
            learning_rate: T::from_config(0.01),
            momentum: T::zero(),
            nesterov: false,
        }
    }
}

impl<T: Scalar> Optimizer<T> for SgdOptimizer<T> {
    fn category(&self) -> &'static str {
        "sgd"
    }

    fn state_dim(&self, embedding_dim: usize) -> usize {
        embedding_dim
    }

    fn train_init(&self, state: &mut [T], _embedding_dim: usize) {
        state.fill(T::zero());
    }

    fn update(&mut self, weights: &mut [T], state: &mut [T], _count: u64, gradients: &[T]) {
        for i in 0..weights.len() {
            state[i] = state[i] * self.momentum + self.learning_rate * gradients[i];
            if self.nesterov {
                weights[i] =
                    weights[i] - (state[i] * self.momentum + self.learning_rate * gradients[i]);
            } else {
                weights[i] = weights[i] - state[i];
            }
        }
    }

    fn load_config(&mut self, config: &Mapping) {
        load_param(config, "learning_rate", &mut self.learning_rate);
        load_param(config, "momentum", &mut self.momentum);
        if let Some(v) = config_bool(config, "nesterov") {
            self.nesterov = v;
        }
    }

    fn dump_config(&self, config: &mut Mapping) {
        dump_param(config, "learning_rate", self.learning_rate);
        dump_param(config, "momentum", self.momentum);
        config_set(config, "nesterov", self.nesterov);
    }
}

#[derive(Debug)]
pub struct AdagradOptimizer<T> {
    pub learning_rate: T,
    pub initial_accumulator_value: T,
    pub epsilon: T,
}

impl<T: Scalar> Default for AdagradOptimizer<T> {
    fn default() -> Self {
        Self {
            learning_rate: T::from_config(0.001),
            initial_accumulator_value: T::from_config(0.1),
            epsilon: T::from_config(1e-7),
        }
    }
}

impl<T: Scalar> Optimizer<T> for AdagradOptimizer<T> {
    fn category(&self) -> &'static str {
        "adagrad"
    }

    fn state_dim(&self, embedding_dim: usize) -> usize {
        embedding_dim
    }

    fn train_init(&self, state: &mut [T], _embedding_dim: usize) {
        state.fill(self.initial_accumulator_value);
    }

    fn update(&mut self, weights: &mut [T], state: &mut [T], _count: u64, gradients: &[T]) {
        for i in 0..weights.len() {
            let g = gradients[i];
            state[i] = state[i] + g * g;
            weights[i] = weights[i] - self.learning_rate * g / (state[i].sqrt() + self.epsilon);
        }
    }

    fn load_config(&mut self, config: &Mapping) {
        load_param(config, "learning_rate", &mut self.learning_rate);
        load_param(
            config,
            "initial_accumulator_value",
            &mut self.initial_accumulator_value,
        );
        load_param(config, "epsilon", &mut self.epsilon);
    }

    fn dump_config(&self, config: &mut Mapping) {
        dump_param(config, "learning_rate", self.learning_rate);
        dump_param(
            config,
            "initial_accumulator_value",
            self.initial_accumulator_value,
        );
        dump_param(config, "epsilon", self.epsilon);
    }
}

#[derive(Debug)]
pub struct AdadeltaOptimizer<T> {
    pub learning_rate: T,
    pub rho: T,
    pub epsilon: T,
}

impl<T: Scalar> Default for AdadeltaOptimizer<T> {
    fn default() -> Self {
        Self {
            learning_rate: T::from_config(0.001),
            rho: T::from_config(0.95),
            epsilon: T::from_config(1e-7),
        }
    }
}

impl<T: Scalar> Optimizer<T> for AdadeltaOptimizer<T> {
    fn category(&self) -> &'static str {
        "adadelta"
    }

    fn state_dim(&self, embedding_dim: usize) -> usize {
        embedding_dim * 2
    }

    fn train_init(&self, state: &mut [T], _embedding_dim: usize) {
        state.fill(T::zero());
    }

    fn update(&mut self, weights: &mut [T], state: &mut [T], _count: u64, gradients: &[T]) {
        let dim = weights.len();
        let one = T::one();
        let (accum, accum_update) = state.split_at_mut(dim);
        for i in 0..dim {
            let g = gradients[i];
            accum[i] = accum[i] * self.rho + g * g * (one - self.rho);
            let update = g * (accum_update[i] + self.epsilon).sqrt()
                / (accum[i] + self.epsilon).sqrt();
            accum_update[i] = accum_update[i] * self.rho + update * update * (one - self.rho);
            weights[i] = weights[i] - self.learning_rate * update;
        }
    }

    fn load_config(&mut self, config: &Mapping) {
        load_param(config, "learning_rate", &mut self.learning_rate);
        load_param(config, "rho", &mut self.rho);
        load_param(config, "epsilon", &mut self.epsilon);
    }

    fn dump_config(&self, config: &mut Mapping) {
        dump_param(config, "learning_rate", self.learning_rate);
        dump_param(config, "rho", self.rho);
        dump_param(config, "epsilon", self.epsilon);
    }
}

#[derive(Debug)]
pub struct RmspropOptimizer<T> {
    pub learning_rate: T,
    pub rho: T,
    pub momentum: T,
    pub epsilon: T,
}

impl<T: Scalar> Default for RmspropOptimizer<T> {
    fn default() -> Self {
        Self {
            learning_rate: T::from_config(0.001),
            rho: T::from_config(0.9),
            momentum: T::zero(),
            epsilon: T::from_config(1e-7),
        }
    }
}

impl<T: Scalar> Optimizer<T> for RmspropOptimizer<T> {
    fn category(&self) -> &'static str {
        "rmsprop"
    }

    fn state_dim(&self, embedding_dim: usize) -> usize {
        embedding_dim * 2
    }

    fn train_init(&self, state: &mut [T], _embedding_dim: usize) {
        state.fill(T::zero());
    }

    fn update(&mut self, weights: &mut [T], state: &mut [T], _count: u64, gradients: &[T]) {
        let dim = weights.len();
        let one = T::one();
        let (accum, moment) = state.split_at_mut(dim);
        for i in 0..dim {
            let g = gradients[i];
            accum[i] = accum[i] * self.rho + g * g * (one - self.rho);
            moment[i] = moment[i] * self.momentum
                + self.learning_rate * g / (accum[i] + self.epsilon).sqrt();
            weights[i] = weights[i] - moment[i];
        }
    }

    fn load_config(&mut self, config: &Mapping) {
        load_param(config, "learning_rate", &mut self.learning_rate);
        load_param(config, "rho", &mut self.rho);
        load_param(config, "momentum", &mut self.momentum);
        load_param(config, "epsilon", &mut self.epsilon);
    }

    fn dump_config(&self, config: &mut Mapping) {
        dump_param(config, "learning_rate", self.learning_rate);
        dump_param(config, "rho", self.rho);
        dump_param(config, "momentum", self.momentum);
        dump_param(config, "epsilon", self.epsilon);
    }
}

/// State layout: first moment, second moment, then the two running
/// beta-power accumulators in the two-element tail.
#[derive(Debug)]
pub struct AdamOptimizer<T> {
    pub learning_rate: T,
    pub beta_1: T,
    pub beta_2: T,
    pub epsilon: T,
}

impl<T: Scalar> Default for AdamOptimizer<T> {
    fn default() -> Self {
        Self {
            learning_rate: T::from_config(0.001),
            beta_1: T::from_config(0.9),
            beta_2: T::from_config(0.999),
            epsilon: T::from_config(1e-7),
        }
    }
}

impl<T: Scalar> Optimizer<T> for AdamOptimizer<T> {
    fn category(&self) -> &'static str {
        "adam"
    }

    fn state_dim(&self, embedding_dim: usize) -> usize {
        embedding_dim * 2 + 2
    }

    fn train_init(&self, state: &mut [T], embedding_dim: usize) {
        state.fill(T::zero());
        state[embedding_dim * 2] = T::one();
        state[embedding_dim * 2 + 1] = T::one();
    }

    fn update(&mut self, weights: &mut [T], state: &mut [T], _count: u64, gradients: &[T]) {
        let dim = weights.len();
        let one = T::one();
        let (m_t, rest) = state.split_at_mut(dim);
        let (v_t, tail) = rest.split_at_mut(dim);
        tail[0] = tail[0] * self.beta_1;
        tail[1] = tail[1] * self.beta_2;
        let lr_t = self.learning_rate * (one - tail[1]).sqrt() / (one - tail[0]);
        for i in 0..dim {
            let g = gradients[i];
            m_t[i] = m_t[i] * self.beta_1 + g * (one - self.beta_1);
            v_t[i] = v_t[i] * self.beta_2 + g * g * (one - self.beta_2);
            weights[i] = weights[i] - lr_t * m_t[i] / (v_t[i].sqrt() + self.epsilon);
        }
    }

    fn load_config(&mut self, config: &Mapping) {
        load_param(config, "learning_rate", &mut self.learning_rate);
        load_param(config, "beta_1", &mut self.beta_1);
        load_param(config, "beta_2", &mut self.beta_2);
        load_param(config, "epsilon", &mut self.epsilon);
    }

    fn dump_config(&self, config: &mut Mapping) {
        dump_param(config, "learning_rate", self.learning_rate);
        dump_param(config, "beta_1", self.beta_1);
        dump_param(config, "beta_2", self.beta_2);
        dump_param(config, "epsilon", self.epsilon);
    }
}

/// Adam with an infinity-norm second moment; no bias correction on `v`.
#[derive(Debug)]
pub struct AdamaxOptimizer<T> {
    pub learning_rate: T,
    pub beta_1: T,
    pub beta_2: T,
    pub epsilon: T,
}

impl<T: Scalar> Default for AdamaxOptimizer<T> {
    fn default() -> Self {
        Self {
            learning_rate: T::from_config(0.001),
            beta_1: T::from_config(0.9),
            beta_2: T::from_config(0.999),
            epsilon: T::from_config(1e-7),
        }
    }
}

impl<T: Scalar> Optimizer<T> for AdamaxOptimizer<T> {
    fn category(&self) -> &'static str {
        "adamax"
    }

    fn state_dim(&self, embedding_dim: usize) -> usize {
        embedding_dim * 2 + 1
    }

    fn train_init(&self, state: &mut [T], embedding_dim: usize) {
        state.fill(T::zero());
        state[embedding_dim * 2] = T::one();
    }

    fn update(&mut self, weights: &mut [T], state: &mut [T], _count: u64, gradients: &[T]) {
        let dim = weights.len();
        let one = T::one();
        let (m_t, rest) = state.split_at_mut(dim);
        let (v_t, tail) = rest.split_at_mut(dim);
        tail[0] = tail[0] * self.beta_1;
        let lr_t = self.learning_rate / (one - tail[0]);
        for i in 0..dim {
            let g = gradients[i];
            m_t[i] = m_t[i] * self.beta_1 + g * (one - self.beta_1);
            v_t[i] = g.abs().max(v_t[i] * self.beta_2);
            weights[i] = weights[i] - lr_t * m_t[i] / (v_t[i] + self.epsilon);
        }
    }

    fn load_config(&mut self, config: &Mapping) {
        load_param(config, "learning_rate", &mut self.learning_rate);
        load_param(config, "beta_1", &mut self.beta_1);
        load_param(config, "beta_2", &mut self.beta_2);
        load_param(config, "epsilon", &mut self.epsilon);
    }

    fn dump_config(&self, config: &mut Mapping) {
        dump_param(config, "learning_rate", self.learning_rate);
        dump_param(config, "beta_1", self.beta_1);
        dump_param(config, "beta_2", self.beta_2);
        dump_param(config, "epsilon", self.epsilon);
    }
}

/// Follow-the-regularized-leader. Pay attention to the signs of grad and
/// the linear term.
#[derive(Debug)]
pub struct FtrlOptimizer<T> {
    pub learning_rate: T,
    pub initial_accumulator_value: T,
    pub l1: T,
    pub l2: T,
    pub l2_shrinkage: T,
    pub learning_rate_power: T,
    pub beta: T,
}

impl<T: Scalar> Default for FtrlOptimizer<T> {
    fn default() -> Self {
        Self {
            learning_rate: T::from_config(0.001),
            initial_accumulator_value: T::from_config(0.1),
            l1: T::zero(),
            l2: T::zero(),
            l2_shrinkage: T::zero(),
            learning_rate_power: T::from_config(-0.5),
            beta: T::zero(),
        }
    }
}

impl<T: Scalar> Optimizer<T> for FtrlOptimizer<T> {
    fn category(&self) -> &'static str {
        "ftrl"
    }

    fn state_dim(&self, embedding_dim: usize) -> usize {
        embedding_dim * 2
    }

    fn train_init(&self, state: &mut [T], embedding_dim: usize) {
        let (accum, linear) = state.split_at_mut(embedding_dim);
        accum.fill(self.initial_accumulator_value);
        linear.fill(T::zero());
    }

    fn update(&mut self, weights: &mut [T], state: &mut [T], _count: u64, gradients: &[T]) {
        let dim = weights.len();
        let two = T::from_config(2.0);
        let adjusted_l2 = self.l2 + self.beta / self.learning_rate / two;
        let (accum, linear) = state.split_at_mut(dim);
        let fast_path = self.learning_rate_power == T::from_config(-0.5);
        for i in 0..dim {
            let g = gradients[i];
            let g_shrunk = g + two * self.l2_shrinkage * weights[i];
            let accum_new = accum[i] + g * g;
            let sigma = if fast_path {
                (accum_new.sqrt() - accum[i].sqrt()) / self.learning_rate
            } else {
                let p = -self.learning_rate_power;
                (accum_new.powf(p) - accum[i].powf(p)) / self.learning_rate
            };
            linear[i] = linear[i] + g_shrunk - sigma * weights[i];
            accum[i] = accum_new;

            let quadratic = if fast_path {
                accum[i].sqrt() / self.learning_rate + two * adjusted_l2
            } else {
                let p = -self.learning_rate_power;
                accum[i].powf(p) / self.learning_rate + two * adjusted_l2
            };
            let l1_reg_adjust = linear[i].min(self.l1).max(-self.l1);
            weights[i] = (l1_reg_adjust - linear[i]) / quadratic;
        }
    }

    fn load_config(&mut self, config: &Mapping) {
        load_param(config, "learning_rate", &mut self.learning_rate);
        load_param(
            config,
            "initial_accumulator_value",
            &mut self.initial_accumulator_value,
        );
        load_param(config, "l1", &mut self.l1);
        load_param(config, "l2", &mut self.l2);
        load_param(config, "l2_shrinkage", &mut self.l2_shrinkage);
        load_param(config, "learning_rate_power", &mut self.learning_rate_power);
        load_param(config, "beta", &mut self.beta);
    }

    fn dump_config(&self, config: &mut Mapping) {
        dump_param(config, "learning_rate", self.learning_rate);
        dump_param(
            config,
            "initial_accumulator_value",
            self.initial_accumulator_value,
        );
        dump_param(config, "l1", self.l1);
        dump_param(config, "l2", self.l2);
        dump_param(config, "l2_shrinkage", self.l2_shrinkage);
        dump_param(config, "learning_rate_power", self.learning_rate_power);
        dump_param(config, "beta", self.beta);
    }
}

/// Deterministic optimizer used by tests: a two-element state that flips
/// between `init` and `flip - init` on every update, added to every weight.
#[derive(Debug)]
pub struct TestOptimizer<T> {
    pub learning_rate: T,
    pub flip: T,
    pub init: T,
}

impl<T: Scalar> Default for TestOptimizer<T> {
    fn default() -> Self {
        Self {
            learning_rate: T::from_config(0.1),
            flip: T::from_config(10_000.0),
            init: T::zero(),
        }
    }
}

impl<T: Scalar> Optimizer<T> for TestOptimizer<T> {
    fn category(&self) -> &'static str {
        "test"
    }

    fn state_dim(&self, _embedding_dim: usize) -> usize {
        2
    }

    fn train_init(&self, state: &mut [T], _embedding_dim: usize) {
        state[0] = self.init;
    }

    fn update(&mut self, weights: &mut [T], state: &mut [T], count: u64, gradients: &[T]) {
        state[0] = self.flip - state[0];
        let count = T::from_count(count);
        for i in 0..weights.len() {
            weights[i] = weights[i] + self.learning_rate * gradients[i] / count + state[0];
        }
    }

    fn load_config(&mut self, config: &Mapping) {
        load_param(config, "learning_rate", &mut self.learning_rate);
        load_param(config, "flip", &mut self.flip);
        load_param(config, "init", &mut self.init);
    }

    fn dump_config(&self, config: &mut Mapping) {
        dump_param(config, "learning_rate", self.learning_rate);
        dump_param(config, "flip", self.flip);
        dump_param(config, "init", self.init);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_one<T: Scalar>(
        optimizer: &mut dyn Optimizer<T>,
        dim: usize,
        weights: &mut [T],
        grad: &[T],
        count: u64,
    ) {
        let mut state = vec![T::zero(); optimizer.state_dim(dim)];
        optimizer.train_init(&mut state, dim);
        optimizer.update(weights, &mut state, count, grad);
    }

    #[test]
    fn default_optimizer_is_plain_sgd() {
        let mut optimizer = DefaultOptimizer::<f32> { learning_rate: 1.0 };
        let mut weights = vec![100.0f32];
        run_one(&mut optimizer, 1, &mut weights, &[1.0], 1);
        assert_eq!(weights, vec![99.0]);
    }

    #[test]
    fn default_optimizer_zero_lr_is_a_noop() {
        let mut optimizer = DefaultOptimizer::<f32>::default();
        let mut weights = vec![5.0f32];
        run_one(&mut optimizer, 1, &mut weights, &[3.0], 1);
        assert_eq!(weights, vec![5.0]);
    }

    #[test]
    fn sgd_momentum_accumulates() {
        let mut optimizer = SgdOptimizer::<f64> {
            learning_rate: 0.1,
            momentum: 0.9,
            nesterov: false,
        };
        let mut weights = vec![1.0f64];
        let mut state = vec![0.0f64];
        optimizer.update(&mut weights, &mut state, 1, &[1.0]);
        assert!((state[0] - 0.1).abs() < 1e-12);
        assert!((weights[0] - 0.9).abs() < 1e-12);
        optimizer.update(&mut weights, &mut state, 1, &[1.0]);
        // moment = 0.1*0.9 + 0.1 = 0.19
        assert!((state[0] - 0.19).abs() < 1e-12);
        assert!((weights[0] - 0.71).abs() < 1e-12);
    }

    #[test]
    fn adagrad_matches_the_closed_form() {
        let mut optimizer = AdagradOptimizer::<f64> {
            learning_rate: 0.1,
            initial_accumulator_value: 0.1,
            epsilon: 1e-7,
        };
        let mut weights = vec![1.0f64];
        let mut state = vec![0.0f64];
        optimizer.train_init(&mut state, 1);
        assert_eq!(state[0], 0.1);
        optimizer.update(&mut weights, &mut state, 1, &[2.0]);
        // accum = 0.1 + 4 = 4.1; w -= 0.1 * 2 / (sqrt(4.1) + 1e-7)
        let expected = 1.0 - 0.1 * 2.0 / (4.1f64.sqrt() + 1e-7);
        assert!((weights[0] - expected).abs() < 1e-12);
    }

    #[test]
    fn adam_state_layout_carries_beta_powers() {
        let mut optimizer = AdamOptimizer::<f64>::default();
        let dim = 2;
        let mut weights = vec![0.5f64; dim];
        let mut state = vec![0.0f64; optimizer.state_dim(dim)];
        optimizer.train_init(&mut state, dim);
        assert_eq!(&state[4..], &[1.0, 1.0]);

        optimizer.update(&mut weights, &mut state, 1, &[1.0, -1.0]);
        assert!((state[4] - 0.9).abs() < 1e-12);
        assert!((state[5] - 0.999).abs() < 1e-12);
        // first step of adam moves by ~lr regardless of gradient scale
        assert!(weights[0] < 0.5);
        assert!(weights[1] > 0.5);
        assert!((weights[0] - 0.5).abs() < 2.0 * 0.001);
    }

    #[test]
    fn adamax_uses_infinity_norm() {
        let mut optimizer = AdamaxOptimizer::<f64>::default();
        let dim = 1;
        let mut state = vec![0.0f64; optimizer.state_dim(dim)];
        optimizer.train_init(&mut state, dim);
        let mut weights = vec![0.0f64];
        optimizer.update(&mut weights, &mut state, 1, &[-3.0]);
        assert_eq!(state[1], 3.0); // |g|
    }

    #[test]
    fn ftrl_default_drives_weights_toward_the_regularized_leader() {
        let mut optimizer = FtrlOptimizer::<f64> {
            learning_rate: 0.5,
            ..Default::default()
        };
        let dim = 1;
        let mut state = vec![0.0f64; optimizer.state_dim(dim)];
        optimizer.train_init(&mut state, dim);
        assert_eq!(state[0], 0.1);
        let mut weights = vec![0.0f64];
        optimizer.update(&mut weights, &mut state, 1, &[1.0]);
        // accum = 1.1, linear = 1.0, quadratic = sqrt(1.1)/0.5
        let expected = -1.0 / (1.1f64.sqrt() / 0.5);
        assert!((weights[0] - expected).abs() < 1e-12);
    }

    #[test]
    fn test_optimizer_flips_and_averages() {
        let mut optimizer = TestOptimizer::<f64> {
            learning_rate: 0.1,
            flip: 10_000.0,
            init: 0.0,
        };
        let dim = 1;
        let mut weights = vec![0.0f64];
        let mut state = vec![0.0f64; 2];
        optimizer.train_init(&mut state, dim);
        optimizer.update(&mut weights, &mut state, 4, &[8.0]);
        // 0.1 * 8 / 4 + 10000
        assert!((weights[0] - 10_000.2).abs() < 1e-9);
        optimizer.update(&mut weights, &mut state, 1, &[0.0]);
        assert!((weights[0] - 10_000.2).abs() < 1e-9); // state flipped back to 0
    }

    #[test]
    fn config_round_trip_keeps_parameters() {
        let mut optimizer = AdamOptimizer::<f32>::default();
        let mut config = Mapping::new();
        config_set(&mut config, "learning_rate", 0.5);
        config_set(&mut config, "beta_1", 0.8);
        optimizer.load_config(&config);
        assert_eq!(optimizer.learning_rate, 0.5);
        assert_eq!(optimizer.beta_1, 0.8);

        let mut dumped = Mapping::new();
        optimizer.dump_config(&mut dumped);
        assert_eq!(config_f64(&dumped, "learning_rate"), Some(0.5));
        assert_eq!(config_f64(&dumped, "beta_2"), Some(0.999f32 as f64));
    }

    #[test]
    fn factory_knows_every_category() {
        for category in [
            "default", "sgd", "adagrad", "adadelta", "rmsprop", "adam", "adamax", "ftrl", "test",
        ] {
            let optimizer = create_optimizer::<f32>(category).unwrap();
            assert_eq!(optimizer.category(), category);
        }
        assert!(create_optimizer::<f32>("lion").is_err());
    }
}
