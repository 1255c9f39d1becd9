//! Gradient-based optimizers.
//!
//! An optimizer never touches the parameters itself. It turns gradients into
//! updates and hands back its new state:
//!
//! ```text
//! let state = optimizer.init(&params);
//! let (updates, state) = optimizer.update(&grads, state, &params);
//! let params = apply_updates(params, &updates);
//! ```
//!
//! Identical inputs always give identical outputs, so a run is reproducible
//! from its seed alone.

use crate::network::Params;

pub trait GradientTransformation {
    /// Whatever the optimizer carries between steps.
    type State;

    fn init(&self, params: &Params) -> Self::State;

    /// Turn `grads` into updates that are added to `params` to take one step.
    fn update(
        &self,
        grads: &Params,
        state: Self::State,
        params: &Params,
    ) -> (Params, Self::State);
}

/// `params + updates`, entry by entry.
pub fn apply_updates(params: Params, updates: &Params) -> Params {
    params.zip_map(updates, |p, u| p + u)
}

/// Plain gradient descent: `update = -learning_rate * grad`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sgd {
    pub learning_rate: f32,
}

impl Sgd {
    pub fn new(learning_rate: f32) -> Self {
        Sgd { learning_rate }
    }
}

impl GradientTransformation for Sgd {
    type State = ();

    fn init(&self, _params: &Params) -> Self::State {}

    fn update(&self, grads: &Params, state: (), _params: &Params) -> (Params, ()) {
        let learning_rate = self.learning_rate;
        (grads.map(|g| -learning_rate * g), state)
    }
}

/// Adam (Kingma & Ba, 2014) with bias-corrected moment estimates:
///
/// ```text
/// m_t = β1 * m_{t-1} + (1 - β1) * g
/// v_t = β2 * v_{t-1} + (1 - β2) * g²
/// update = -α * (m_t / (1 - β1^t)) / (sqrt(v_t / (1 - β2^t)) + ε)
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Adam {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

impl Adam {
    /// Adam with the usual `β1 = 0.9`, `β2 = 0.999`, `ε = 1e-8`.
    pub fn new(learning_rate: f32) -> Self {
        Adam {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// First and second moment estimates, shaped exactly like the parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct AdamState {
    pub count: u32,
    pub mu: Params,
    pub nu: Params,
}

impl GradientTransformation for Adam {
    type State = AdamState;

    fn init(&self, params: &Params) -> AdamState {
        AdamState {
            count: 0,
            mu: params.zeros_like(),
            nu: params.zeros_like(),
        }
    }

    fn update(&self, grads: &Params, state: AdamState, _params: &Params) -> (Params, AdamState) {
        let Adam {
            learning_rate,
            beta1,
            beta2,
            epsilon,
        } = *self;

        let count = state.count.saturating_add(1);
        let mu = state.mu.zip_map(grads, |m, g| beta1 * m + (1.0 - beta1) * g);
        let nu = state
            .nu
            .zip_map(grads, |v, g| beta2 * v + (1.0 - beta2) * g * g);

        let step = count.min(i32::MAX as u32) as i32;
        let correction1 = 1.0 - beta1.powi(step);
        let correction2 = 1.0 - beta2.powi(step);
        let updates = mu.zip_map(&nu, |m, v| {
            -learning_rate * (m / correction1) / ((v / correction2).sqrt() + epsilon)
        });

        (updates, AdamState { count, mu, nu })
    }
}
