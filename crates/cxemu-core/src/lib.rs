//! Compartment simulator core for the cxemu neuromorphic emulator
//!
//! This crate mirrors the integer arithmetic of a spiking neuromorphic
//! chip: populations of integrate-and-fire compartments fed by weighted
//! synapse banks and axon fan-outs, advanced in fixed ticks through two
//! cascaded first-order filters, thresholding, and refractory handling.
//!
//! The workflow is build, discretize, simulate. A [`Model`] is
//! assembled from [`Group`]s, [`Synapses`] banks, [`Axons`] fan-outs,
//! [`SpikeInput`]s, and [`Probe`]s; [`Model::discretize`] freezes the
//! floating-point configuration into the chip's fixed-point fields; and
//! [`Model::get_simulator`] yields a [`StepKernel`] that reproduces the
//! hardware dynamics tick for tick. Skipping the discretize step runs
//! the same network with floating-point dynamics instead, which is
//! useful for separating quantization effects from model behaviour.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod array;
mod discretize;
pub mod error;
pub mod group;
pub mod input;
pub mod model;
pub mod probe;
pub mod sim;
pub mod synapse;

pub use array::NumericArray;
pub use error::{CoreError, Result};
pub use group::{
    Group, LifConfig, Location, NoiseTarget, NonspikingConfig, ReluConfig, AXONS_MAX,
    MAX_SYNAPSE_BITS,
};
pub use input::SpikeInput;
pub use model::{GroupHandle, InputHandle, Model, DEFAULT_DT};
pub use probe::{Probe, ProbeHandle, ProbeKey};
pub use sim::{NumericMode, StepKernel, MAX_DELAY, Q_BITS, U_BITS};
pub use synapse::{Axons, Synapses, SynapsesRef, TargetInds, TraceConfig};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_integration() {
        let mut model = Model::new();
        let mut group = Group::new(2);
        group.configure_lif(&LifConfig::default()).unwrap();
        let g = model.add_group(group).unwrap();

        model.discretize().unwrap();
        assert!(model.is_discretized());
        assert!(model.group(g).unwrap().vth().is_int());

        let kernel = model.get_simulator(Some(7)).unwrap();
        assert_eq!(kernel.mode(), NumericMode::Int);
        assert_eq!(kernel.n_compartments(), 2);
    }
}
