//! The compartment network model
//!
//! A `Model` is an arena of spike inputs and compartment groups, built
//! once, discretized once, then handed to step kernels. All
//! cross-references between objects are indices into this arena, so the
//! model is the single owner of every array.

use crate::discretize::discretize_group;
use crate::error::{CoreError, Result};
use crate::group::Group;
use crate::input::SpikeInput;
use crate::probe::{Probe, ProbeHandle};
use crate::sim::StepKernel;
use crate::synapse::{Synapses, SynapsesRef};

/// Default simulation step, in seconds.
pub const DEFAULT_DT: f64 = 0.001;

/// Handle to a group in a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupHandle(pub(crate) usize);

/// Handle to a spike input in a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputHandle(pub(crate) usize);

/// An ordered collection of spike inputs and compartment groups.
#[derive(Debug, Clone)]
pub struct Model {
    dt: f64,
    pub(crate) inputs: Vec<SpikeInput>,
    pub(crate) groups: Vec<Group>,
    discretized: bool,
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}

impl Model {
    /// Create an empty model with the default step size.
    pub fn new() -> Self {
        Self {
            dt: DEFAULT_DT,
            inputs: Vec::new(),
            groups: Vec::new(),
            discretized: false,
        }
    }

    /// Create an empty model with a custom step size.
    pub fn with_dt(dt: f64) -> Result<Self> {
        if dt <= 0.0 {
            return Err(CoreError::invalid_parameter("dt", dt.to_string(), "> 0"));
        }
        Ok(Self {
            dt,
            ..Self::new()
        })
    }

    /// Simulation step size in seconds.
    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Whether the model has been discretized.
    pub fn is_discretized(&self) -> bool {
        self.discretized
    }

    fn check_mutable(&self, what: &str) -> Result<()> {
        if self.discretized {
            Err(CoreError::frozen(format!(
                "cannot {} after discretize",
                what
            )))
        } else {
            Ok(())
        }
    }

    /// Add a group; groups are simulated in insertion order (host-located
    /// groups are moved to the tail at kernel build).
    pub fn add_group(&mut self, group: Group) -> Result<GroupHandle> {
        self.check_mutable("add a group")?;
        if group.n == 0 {
            return Err(CoreError::invalid_parameter("group.n", "0", ">= 1"));
        }
        self.groups.push(group);
        Ok(GroupHandle(self.groups.len() - 1))
    }

    /// Add a spike input.
    pub fn add_input(&mut self, input: SpikeInput) -> Result<InputHandle> {
        self.check_mutable("add an input")?;
        self.inputs.push(input);
        Ok(InputHandle(self.inputs.len() - 1))
    }

    /// Shared access to a group.
    pub fn group(&self, handle: GroupHandle) -> Result<&Group> {
        self.groups
            .get(handle.0)
            .ok_or_else(|| CoreError::unknown_handle(format!("group {}", handle.0)))
    }

    /// Mutable access to a group; refused once the model is frozen.
    pub fn group_mut(&mut self, handle: GroupHandle) -> Result<&mut Group> {
        self.check_mutable("mutate a group")?;
        self.groups
            .get_mut(handle.0)
            .ok_or_else(|| CoreError::unknown_handle(format!("group {}", handle.0)))
    }

    /// Shared access to an input.
    pub fn input(&self, handle: InputHandle) -> Result<&SpikeInput> {
        self.inputs
            .get(handle.0)
            .ok_or_else(|| CoreError::unknown_handle(format!("input {}", handle.0)))
    }

    /// Mutable access to an input; refused once the model is frozen.
    pub fn input_mut(&mut self, handle: InputHandle) -> Result<&mut SpikeInput> {
        self.check_mutable("mutate an input")?;
        self.inputs
            .get_mut(handle.0)
            .ok_or_else(|| CoreError::unknown_handle(format!("input {}", handle.0)))
    }

    /// Attach a synapse bank to a group, returning its reference.
    pub fn add_synapses(
        &mut self,
        group: GroupHandle,
        synapses: Synapses,
        name: Option<&str>,
    ) -> Result<SynapsesRef> {
        let bank = self.group_mut(group)?.add_synapses(synapses, name)?;
        Ok(SynapsesRef {
            group: group.0,
            bank,
        })
    }

    /// Shared access to a synapse bank.
    pub fn synapses(&self, r: SynapsesRef) -> Result<&Synapses> {
        self.group(GroupHandle(r.group))?
            .synapses
            .get(r.bank)
            .ok_or_else(|| CoreError::unknown_handle(format!("bank {} in group {}", r.bank, r.group)))
    }

    /// Mutable access to a synapse bank; refused once the model is frozen.
    pub fn synapses_mut(&mut self, r: SynapsesRef) -> Result<&mut Synapses> {
        self.group_mut(GroupHandle(r.group))?
            .synapses
            .get_mut(r.bank)
            .ok_or_else(|| CoreError::unknown_handle(format!("bank {} in group {}", r.bank, r.group)))
    }

    /// Attach a probe to a group.
    pub fn add_group_probe(&mut self, group: GroupHandle, probe: Probe) -> Result<ProbeHandle> {
        let idx = self.group_mut(group)?.add_probe(probe);
        Ok(ProbeHandle::Group {
            group: group.0,
            probe: idx,
        })
    }

    /// Attach a probe to a spike input.
    pub fn add_input_probe(&mut self, input: InputHandle, probe: Probe) -> Result<ProbeHandle> {
        let idx = self.input_mut(input)?.add_probe(probe)?;
        Ok(ProbeHandle::Input {
            input: input.0,
            probe: idx,
        })
    }

    /// Freeze every group's float parameters into chip fixed point.
    ///
    /// Runs once; a second call is a usage error.
    pub fn discretize(&mut self) -> Result<()> {
        if self.discretized {
            return Err(CoreError::frozen("discretize already ran"));
        }
        for group in &mut self.groups {
            discretize_group(group)?;
        }
        self.discretized = true;
        Ok(())
    }

    /// Build a step kernel over this model.
    ///
    /// `seed` fixes the noise stream; pass `None` for a random seed.
    pub fn get_simulator(&self, seed: Option<u64>) -> Result<StepKernel<'_>> {
        StepKernel::build(self, seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::LifConfig;

    #[test]
    fn test_add_and_access() {
        let mut model = Model::new();
        let g = model.add_group(Group::new(4)).unwrap();
        assert_eq!(model.group(g).unwrap().n, 4);

        let i = model.add_input(SpikeInput::new(2)).unwrap();
        assert_eq!(model.input(i).unwrap().n(), 2);
    }

    #[test]
    fn test_empty_group_rejected() {
        let mut model = Model::new();
        assert!(model.add_group(Group::new(0)).is_err());
    }

    #[test]
    fn test_unknown_handles() {
        let model = Model::new();
        assert!(model.group(GroupHandle(3)).is_err());
        assert!(model.input(InputHandle(0)).is_err());
    }

    #[test]
    fn test_discretize_freezes_model() {
        let mut model = Model::new();
        let g = model.add_group(Group::new(2)).unwrap();
        model
            .group_mut(g)
            .unwrap()
            .configure_lif(&LifConfig::default())
            .unwrap();

        model.discretize().unwrap();
        assert!(model.is_discretized());
        assert!(matches!(model.group_mut(g), Err(CoreError::Frozen { .. })));
        assert!(matches!(
            model.add_group(Group::new(1)),
            Err(CoreError::Frozen { .. })
        ));
        // second discretize is a usage error
        assert!(matches!(model.discretize(), Err(CoreError::Frozen { .. })));
    }

    #[test]
    fn test_with_dt_validation() {
        assert!(Model::with_dt(0.0).is_err());
        assert!(Model::with_dt(-0.001).is_err());
        assert_eq!(Model::with_dt(0.002).unwrap().dt(), 0.002);
    }
}
