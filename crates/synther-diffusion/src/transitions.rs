//! Splitting generated samples into RL transitions
//!
//! A sample holds `num_transition` consecutive steps of one trajectory,
//! laid out as
//!
//! ```text
//! s_0 a_0 r_0 s_1 a_1 r_1 ... s_k [terminal]
//! ```
//!
//! so the next observation of step `i` is the observation of step `i + 1`.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{DiffusionError, Result};

fn default_num_transition() -> usize {
    1
}

/// Field layout of one flat sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionLayout {
    pub obs_dim: usize,
    pub action_dim: usize,
    /// Whether the last feature is a terminal flag
    #[serde(default)]
    pub modelled_terminals: bool,
    /// Terminals above this value become 1, the rest 0
    #[serde(default)]
    pub terminal_threshold: Option<f32>,
    #[serde(default = "default_num_transition")]
    pub num_transition: usize,
}

impl TransitionLayout {
    pub fn new(obs_dim: usize, action_dim: usize) -> Self {
        Self {
            obs_dim,
            action_dim,
            modelled_terminals: false,
            terminal_threshold: None,
            num_transition: default_num_transition(),
        }
    }

    /// Treats the last feature as a terminal flag, optionally thresholded
    pub fn with_terminals(mut self, threshold: Option<f32>) -> Self {
        self.modelled_terminals = true;
        self.terminal_threshold = threshold;
        self
    }

    pub fn with_num_transition(mut self, num_transition: usize) -> Self {
        self.num_transition = num_transition;
        self
    }

    fn stride(&self) -> usize {
        self.obs_dim + self.action_dim + 1
    }

    /// Number of features in one sample
    pub fn event_dim(&self) -> usize {
        self.num_transition * self.stride() + self.obs_dim + usize::from(self.modelled_terminals)
    }

    pub fn validate(&self) -> Result<()> {
        if self.obs_dim == 0 || self.action_dim == 0 || self.num_transition == 0 {
            return Err(DiffusionError::invalid(format!(
                "obs_dim, action_dim and num_transition must be positive, got {}, {}, {}",
                self.obs_dim, self.action_dim, self.num_transition
            )));
        }
        Ok(())
    }

    /// Splits `[n, event_dim]` samples into `n * num_transition` transitions
    ///
    /// Transitions are grouped by position in the sample: all first steps,
    /// then all second steps, and so on. Only the last step of a sample can
    /// be terminal; without modelled terminals every flag is zero.
    pub fn split<B: Backend>(&self, samples: Tensor<B, 2>) -> Result<Transitions<B>> {
        self.validate()?;
        let [n, features] = samples.dims();
        if features != self.event_dim() {
            return Err(DiffusionError::ShapeMismatch {
                expected: vec![n, self.event_dim()],
                actual: vec![n, features],
            });
        }
        let device = samples.device();

        let terminal = if self.modelled_terminals {
            let flags = samples
                .clone()
                .narrow(1, features - 1, 1)
                .squeeze_dim::<1>(1);
            match self.terminal_threshold {
                Some(threshold) => flags.greater_elem(threshold).float(),
                None => flags,
            }
        } else {
            Tensor::zeros([n], &device)
        };

        let (obs, act) = (self.obs_dim, self.action_dim);
        let parts = (0..self.num_transition)
            .map(|i| {
                let anchor = self.stride() * i;
                let terminals = if i + 1 == self.num_transition {
                    terminal.clone()
                } else {
                    Tensor::zeros([n], &device)
                };
                Transitions {
                    observations: samples.clone().narrow(1, anchor, obs),
                    actions: samples.clone().narrow(1, anchor + obs, act),
                    rewards: samples
                        .clone()
                        .narrow(1, anchor + obs + act, 1)
                        .squeeze_dim::<1>(1),
                    next_observations: samples.clone().narrow(1, anchor + obs + act + 1, obs),
                    terminals,
                }
            })
            .collect();

        Transitions::concat(parts)
    }
}

/// A batch of `(s, a, r, s', done)` transitions
#[derive(Debug, Clone)]
pub struct Transitions<B: Backend> {
    pub observations: Tensor<B, 2>,
    pub actions: Tensor<B, 2>,
    pub rewards: Tensor<B, 1>,
    pub next_observations: Tensor<B, 2>,
    pub terminals: Tensor<B, 1>,
}

impl<B: Backend> Transitions<B> {
    pub fn len(&self) -> usize {
        self.rewards.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Concatenates batches along the batch axis
    pub fn concat(parts: Vec<Self>) -> Result<Self> {
        if parts.is_empty() {
            return Err(DiffusionError::invalid("cannot concatenate zero transition batches"));
        }
        let mut observations = Vec::with_capacity(parts.len());
        let mut actions = Vec::with_capacity(parts.len());
        let mut rewards = Vec::with_capacity(parts.len());
        let mut next_observations = Vec::with_capacity(parts.len());
        let mut terminals = Vec::with_capacity(parts.len());
        for part in parts {
            observations.push(part.observations);
            actions.push(part.actions);
            rewards.push(part.rewards);
            next_observations.push(part.next_observations);
            terminals.push(part.terminals);
        }
        Ok(Self {
            observations: Tensor::cat(observations, 0),
            actions: Tensor::cat(actions, 0),
            rewards: Tensor::cat(rewards, 0),
            next_observations: Tensor::cat(next_observations, 0),
            terminals: Tensor::cat(terminals, 0),
        })
    }
}
