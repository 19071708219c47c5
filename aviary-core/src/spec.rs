//! Specifications of agent groups.
//!
//! Specifications are handed over by the environment at construction time and
//! are read-only afterwards. Observation shapes include the leading agent
//! axis, e.g. `[n_agents, obs_dim]` for a vector observation or
//! `[n_agents, channels, height, width]` for a camera.
use crate::error::AviaryError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

/// Shape and bounds of a tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorSpec {
    /// Shape, without batch or time axes.
    pub shape: Vec<usize>,

    /// Lower bound of values, if bounded.
    #[serde(default)]
    pub low: Option<f32>,

    /// Upper bound of values, if bounded.
    #[serde(default)]
    pub high: Option<f32>,
}

impl TensorSpec {
    /// Unbounded spec of the given shape.
    pub fn new(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            low: None,
            high: None,
        }
    }

    /// Sets the bounds.
    pub fn bounded(mut self, low: f32, high: f32) -> Self {
        self.low = Some(low);
        self.high = Some(high);
        self
    }

    /// Rank of the shape.
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Size of the last axis.
    pub fn last_dim(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    /// Returns `true` for image-like specs, `[A, C, H, W]` or larger.
    pub fn is_visual(&self) -> bool {
        self.rank() >= 4
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Observation specification: a flat vector or a named composite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObservationSpec {
    /// A single tensor.
    Vector(TensorSpec),

    /// Named sub-specs, e.g. `{"state": [A, 19], "obstacles": [A, 5, 3]}`.
    Composite(BTreeMap<String, TensorSpec>),
}

impl ObservationSpec {
    /// Composite spec from `(name, spec)` pairs.
    pub fn composite<'a>(fields: impl IntoIterator<Item = (&'a str, TensorSpec)>) -> Self {
        Self::Composite(
            fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    /// Fields ordered by name. A vector spec has a single unnamed field.
    pub fn fields(&self) -> Vec<(&str, &TensorSpec)> {
        match self {
            Self::Vector(spec) => vec![("", spec)],
            Self::Composite(fields) => fields.iter().map(|(k, v)| (k.as_str(), v)).collect(),
        }
    }

    /// Splits composite fields into non-visual and visual ones.
    pub fn partition_visual(&self) -> (Vec<(&str, &TensorSpec)>, Vec<(&str, &TensorSpec)>) {
        self.fields().into_iter().partition(|(_, s)| !s.is_visual())
    }

    /// Flattened width of a vector spec. Fails for composite specs.
    pub fn vector_dim(&self) -> Result<usize> {
        match self {
            Self::Vector(spec) => Ok(spec.last_dim()),
            Self::Composite(_) => {
                Err(AviaryError::config("a vector observation spec is required").into())
            }
        }
    }
}

/// Describes one group of homogeneous agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Group name, used to prefix diagnostics.
    pub name: String,

    /// Number of agents in the group.
    pub n_agents: usize,

    /// Per-agent observations.
    pub observation_spec: ObservationSpec,

    /// Actions, `[A, act_dim]`.
    pub action_spec: TensorSpec,

    /// Rewards, `[A, n_heads]`.
    pub reward_spec: TensorSpec,

    /// Joint state for a centralized critic, without the agent axis.
    #[serde(default)]
    pub state_spec: Option<ObservationSpec>,

    /// Privileged physical parameters, `[A, intrinsics_dim]`.
    #[serde(default)]
    pub intrinsics_spec: Option<TensorSpec>,

    /// Window of past observations, `[A, obs_dim, window]`.
    #[serde(default)]
    pub observation_history_spec: Option<TensorSpec>,
}

impl AgentSpec {
    /// Spec with a single reward head and no optional fields.
    pub fn new(
        name: impl Into<String>,
        n_agents: usize,
        observation_spec: ObservationSpec,
        action_dim: usize,
    ) -> Self {
        Self {
            name: name.into(),
            n_agents,
            observation_spec,
            action_spec: TensorSpec::new(&[n_agents, action_dim]).bounded(-1.0, 1.0),
            reward_spec: TensorSpec::new(&[n_agents, 1]),
            state_spec: None,
            intrinsics_spec: None,
            observation_history_spec: None,
        }
    }

    /// Sets the number of reward heads.
    pub fn reward_heads(mut self, n_heads: usize) -> Self {
        self.reward_spec = TensorSpec::new(&[self.n_agents, n_heads]);
        self
    }

    /// Sets the joint state spec.
    pub fn state_spec(mut self, spec: ObservationSpec) -> Self {
        self.state_spec = Some(spec);
        self
    }

    /// Sets the intrinsics spec from its width.
    pub fn intrinsics_dim(mut self, dim: usize) -> Self {
        self.intrinsics_spec = Some(TensorSpec::new(&[self.n_agents, dim]));
        self
    }

    /// Sets the observation history spec from the feature width and window length.
    pub fn observation_history(mut self, obs_dim: usize, window: usize) -> Self {
        self.observation_history_spec =
            Some(TensorSpec::new(&[self.n_agents, obs_dim, window]));
        self
    }

    /// Action width per agent.
    pub fn action_dim(&self) -> usize {
        self.action_spec.last_dim()
    }

    /// Number of reward heads.
    pub fn n_reward_heads(&self) -> usize {
        self.reward_spec.last_dim()
    }

    /// Loads the spec from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves the spec as a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_partition_visual() {
        let spec = ObservationSpec::composite([
            ("state", TensorSpec::new(&[2, 19])),
            ("camera", TensorSpec::new(&[2, 3, 32, 32])),
            ("neighbors", TensorSpec::new(&[2, 1, 6])),
        ]);
        let (state, visual) = spec.partition_visual();
        assert_eq!(state.len(), 2);
        assert_eq!(visual.len(), 1);
        assert_eq!(visual[0].0, "camera");
    }

    #[test]
    fn test_save_load() -> Result<()> {
        let spec = AgentSpec::new("drone", 4, ObservationSpec::Vector(TensorSpec::new(&[4, 23])), 4)
            .reward_heads(2)
            .intrinsics_dim(10)
            .observation_history(23, 32);
        let dir = TempDir::new("agent_spec")?;
        let path = dir.path().join("spec.yaml");
        spec.save(&path)?;
        assert_eq!(AgentSpec::load(&path)?, spec);
        assert_eq!(spec.n_reward_heads(), 2);
        assert_eq!(spec.action_dim(), 4);
        Ok(())
    }
}
