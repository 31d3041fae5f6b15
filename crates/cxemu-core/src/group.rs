//! Compartment groups
//!
//! A group is a population of compartments sharing configuration: the
//! two filter decays, threshold, bias, refractory delay, noise fields,
//! and the voltage clamp. Groups own their synapse banks, outgoing axon
//! fan-outs, and probes.

use std::collections::HashMap;
use std::str::FromStr;

use cxemu_fmt::REFRACT_DELAY_MAX;

use crate::array::NumericArray;
use crate::error::{CoreError, Result};
use crate::probe::Probe;
use crate::synapse::{Axons, Synapses};

/// Most input axons a single group may receive.
pub const AXONS_MAX: usize = 4096;

/// Most synapse memory bits a single group may consume.
pub const MAX_SYNAPSE_BITS: usize = 16384 * 64;

/// Decay rates below this are treated as no decay at all.
const DECAY_EPSILON: f64 = 1e-15;

/// Synaptic time constants below this are worth flagging.
const TAU_S_MIN: f64 = 0.005;

/// Where a group's compartments are simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Location {
    /// On-chip compartments; voltage resets to zero at threshold
    Core,
    /// Host-side compartments; voltage keeps its overshoot at threshold
    Host,
}

impl FromStr for Location {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "core" => Ok(Self::Core),
            "host" => Ok(Self::Host),
            other => Err(CoreError::UnknownLocation { name: other.into() }),
        }
    }
}

/// Which stage group noise feeds into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NoiseTarget {
    /// Injected into the dendrite accumulator before the current filter
    Dendrite,
    /// Injected into the voltage input after bias
    Membrane,
}

/// Parameters for leaky integrate-and-fire dynamics.
#[derive(Debug, Clone, PartialEq)]
pub struct LifConfig {
    /// Synaptic filter time constant (s)
    pub tau_s: f64,
    /// Membrane time constant (s)
    pub tau_rc: f64,
    /// Refractory period (s)
    pub tau_ref: f64,
    /// Firing threshold
    pub vth: f64,
    /// Simulation step (s)
    pub dt: f64,
}

impl Default for LifConfig {
    fn default() -> Self {
        Self {
            tau_s: 0.005,
            tau_rc: 0.02,
            tau_ref: 0.001,
            vth: 1.0,
            dt: 0.001,
        }
    }
}

/// Parameters for rectified-linear (integrator) dynamics.
#[derive(Debug, Clone, PartialEq)]
pub struct ReluConfig {
    /// Synaptic filter time constant (s)
    pub tau_s: f64,
    /// Refractory period (s)
    pub tau_ref: f64,
    /// Firing threshold
    pub vth: f64,
    /// Simulation step (s)
    pub dt: f64,
}

impl Default for ReluConfig {
    fn default() -> Self {
        Self {
            tau_s: 0.0,
            tau_ref: 0.0,
            vth: 1.0,
            dt: 0.001,
        }
    }
}

/// Parameters for non-spiking pass-through dynamics.
#[derive(Debug, Clone, PartialEq)]
pub struct NonspikingConfig {
    /// Synaptic filter time constant (s)
    pub tau_s: f64,
    /// Firing threshold (effectively unused; voltage tracks input)
    pub vth: f64,
    /// Simulation step (s)
    pub dt: f64,
}

impl Default for NonspikingConfig {
    fn default() -> Self {
        Self {
            tau_s: 0.0,
            vth: 1.0,
            dt: 0.001,
        }
    }
}

/// A population of compartments sharing configuration.
#[derive(Debug, Clone)]
pub struct Group {
    /// Population size
    pub n: usize,
    /// Optional display label
    pub label: Option<String>,
    /// Where these compartments run
    pub location: Location,

    pub(crate) decay_u: NumericArray,
    pub(crate) decay_v: NumericArray,
    pub(crate) refract_delay: Vec<i32>,
    pub(crate) vth: NumericArray,
    pub(crate) bias: NumericArray,
    pub(crate) enable_noise: Vec<bool>,

    pub(crate) vmin: f64,
    pub(crate) vmax: f64,
    pub(crate) noise_exp0: f64,
    pub(crate) noise_mant_offset0: f64,
    pub(crate) noise_target: NoiseTarget,

    pub(crate) scale_u: bool,
    pub(crate) scale_v: bool,

    pub(crate) synapses: Vec<Synapses>,
    named_synapses: HashMap<String, usize>,
    pub(crate) axons: Vec<Axons>,
    named_axons: HashMap<String, usize>,
    pub(crate) probes: Vec<Probe>,
}

impl Group {
    /// Create a core-located group of `n` compartments with all
    /// parameters zeroed.
    pub fn new(n: usize) -> Self {
        Self {
            n,
            label: None,
            location: Location::Core,
            decay_u: NumericArray::zeros(n),
            decay_v: NumericArray::zeros(n),
            refract_delay: vec![0; n],
            vth: NumericArray::zeros(n),
            bias: NumericArray::zeros(n),
            enable_noise: vec![false; n],
            vmin: 0.0,
            vmax: f64::INFINITY,
            noise_exp0: 0.0,
            noise_mant_offset0: 0.0,
            noise_target: NoiseTarget::Dendrite,
            scale_u: false,
            scale_v: false,
            synapses: Vec::new(),
            named_synapses: HashMap::new(),
            axons: Vec::new(),
            named_axons: HashMap::new(),
            probes: Vec::new(),
        }
    }

    /// Set a display label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the simulation location.
    pub fn with_location(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    fn float_mut<'a>(arr: &'a mut NumericArray, name: &'static str) -> Result<&'a mut [f32]> {
        arr.as_float_mut()
            .ok_or_else(|| CoreError::frozen(format!("cannot reconfigure {} after discretize", name)))
    }

    fn set_decay_u(&mut self, tau_s: f64, dt: f64) -> Result<()> {
        if tau_s < 0.0 {
            return Err(CoreError::invalid_parameter(
                "tau_s",
                tau_s.to_string(),
                ">= 0",
            ));
        }
        if dt <= 0.0 {
            return Err(CoreError::invalid_parameter("dt", dt.to_string(), "> 0"));
        }
        if tau_s > 0.0 && tau_s < TAU_S_MIN {
            log::warn!(
                "tau_s is currently {}, which is smaller than {}",
                tau_s,
                TAU_S_MIN
            );
        }
        let value = if tau_s == 0.0 {
            1.0
        } else {
            -(-dt / tau_s).exp_m1()
        };
        Self::float_mut(&mut self.decay_u, "decay_u")?.fill(value as f32);
        Ok(())
    }

    fn set_refract(&mut self, tau_ref: f64, dt: f64) -> Result<()> {
        if tau_ref < 0.0 {
            return Err(CoreError::invalid_parameter(
                "tau_ref",
                tau_ref.to_string(),
                ">= 0",
            ));
        }
        let delay = (tau_ref / dt).round() as i32 + 1;
        if delay > REFRACT_DELAY_MAX {
            return Err(CoreError::invalid_parameter(
                "tau_ref",
                format!("{} ({} ticks)", tau_ref, delay),
                format!("<= {} ticks", REFRACT_DELAY_MAX),
            ));
        }
        self.refract_delay.fill(delay);
        Ok(())
    }

    fn set_vth(&mut self, vth: f64) -> Result<()> {
        if vth < 0.0 {
            return Err(CoreError::invalid_parameter(
                "vth",
                vth.to_string(),
                ">= 0",
            ));
        }
        Self::float_mut(&mut self.vth, "vth")?.fill(vth as f32);
        Ok(())
    }

    /// Configure the synaptic input filter only.
    pub fn configure_filter(&mut self, tau_s: f64, dt: f64) -> Result<()> {
        self.set_decay_u(tau_s, dt)
    }

    /// Configure leaky integrate-and-fire dynamics.
    pub fn configure_lif(&mut self, cfg: &LifConfig) -> Result<()> {
        if cfg.tau_rc <= 0.0 {
            return Err(CoreError::invalid_parameter(
                "tau_rc",
                cfg.tau_rc.to_string(),
                "> 0",
            ));
        }
        self.set_decay_u(cfg.tau_s, cfg.dt)?;
        let decay_v = -(-cfg.dt / cfg.tau_rc).exp_m1();
        Self::float_mut(&mut self.decay_v, "decay_v")?.fill(decay_v as f32);
        self.set_refract(cfg.tau_ref, cfg.dt)?;
        self.set_vth(cfg.vth)?;
        self.vmin = 0.0;
        self.vmax = f64::INFINITY;
        self.scale_u = true;
        self.scale_v = decay_v > DECAY_EPSILON;
        Ok(())
    }

    /// Configure rectified-linear (integrator) dynamics.
    pub fn configure_relu(&mut self, cfg: &ReluConfig) -> Result<()> {
        self.set_decay_u(cfg.tau_s, cfg.dt)?;
        Self::float_mut(&mut self.decay_v, "decay_v")?.fill(0.0);
        self.set_refract(cfg.tau_ref, cfg.dt)?;
        self.set_vth(cfg.vth)?;
        self.vmin = 0.0;
        self.vmax = f64::INFINITY;
        self.scale_u = true;
        self.scale_v = false;
        Ok(())
    }

    /// Configure non-spiking pass-through dynamics.
    pub fn configure_nonspiking(&mut self, cfg: &NonspikingConfig) -> Result<()> {
        self.set_decay_u(cfg.tau_s, cfg.dt)?;
        Self::float_mut(&mut self.decay_v, "decay_v")?.fill(1.0);
        self.refract_delay.fill(1);
        self.set_vth(cfg.vth)?;
        self.vmin = 0.0;
        self.vmax = f64::INFINITY;
        self.scale_u = true;
        self.scale_v = false;
        Ok(())
    }

    /// Set the per-compartment bias.
    pub fn set_bias(&mut self, bias: &[f32]) -> Result<()> {
        if bias.len() != self.n {
            return Err(CoreError::invalid_parameter(
                "bias",
                format!("{} values", bias.len()),
                format!("{} values", self.n),
            ));
        }
        Self::float_mut(&mut self.bias, "bias")?.copy_from_slice(bias);
        Ok(())
    }

    /// Set the voltage clamp range; the floor must not be positive.
    pub fn set_voltage_range(&mut self, vmin: f64, vmax: f64) -> Result<()> {
        if vmin > 0.0 {
            return Err(CoreError::invalid_parameter(
                "vmin",
                vmin.to_string(),
                "<= 0",
            ));
        }
        if vmax < 0.0 {
            return Err(CoreError::invalid_parameter(
                "vmax",
                vmax.to_string(),
                ">= 0",
            ));
        }
        self.vmin = vmin;
        self.vmax = vmax;
        Ok(())
    }

    /// Set the group noise parameters.
    pub fn set_noise(&mut self, exp0: f64, mant_offset0: f64, target: NoiseTarget) {
        self.noise_exp0 = exp0;
        self.noise_mant_offset0 = mant_offset0;
        self.noise_target = target;
    }

    /// Choose which compartments receive noise.
    pub fn set_enable_noise(&mut self, enable: &[bool]) -> Result<()> {
        if enable.len() != self.n {
            return Err(CoreError::invalid_parameter(
                "enable_noise",
                format!("{} values", enable.len()),
                format!("{} values", self.n),
            ));
        }
        self.enable_noise.copy_from_slice(enable);
        Ok(())
    }

    /// Enable noise on every compartment.
    pub fn enable_noise_all(&mut self) {
        self.enable_noise.fill(true);
    }

    /// Attach a synapse bank, enforcing the group's axon and synapse
    /// memory limits and checking the bank's indices fit its format and
    /// this population.
    pub fn add_synapses(&mut self, synapses: Synapses, name: Option<&str>) -> Result<usize> {
        let fmt = synapses.fmt().ok_or_else(|| {
            CoreError::invalid_parameter("synapses", "unformatted bank", "a bank with weights set")
        })?;

        let idx_limit = 1u64 << fmt.real_idx_bits();
        for row in &synapses.indices {
            for &idx in row {
                if u64::from(idx) >= idx_limit {
                    return Err(CoreError::invalid_parameter(
                        "indices",
                        idx.to_string(),
                        format!("< 2^{}", fmt.real_idx_bits()),
                    ));
                }
                if idx as usize >= self.n {
                    return Err(CoreError::invalid_parameter(
                        "indices",
                        idx.to_string(),
                        format!("< {} compartments", self.n),
                    ));
                }
            }
        }

        let new_bits = synapses.bits()?;
        let n_axons: usize =
            self.synapses.iter().map(Synapses::n_axons).sum::<usize>() + synapses.n_axons();
        if n_axons > AXONS_MAX {
            return Err(CoreError::capacity("input axons", n_axons, AXONS_MAX));
        }

        let mut bits = new_bits;
        for existing in &self.synapses {
            bits += existing.bits()?;
        }
        if bits > MAX_SYNAPSE_BITS {
            return Err(CoreError::capacity("synapse bits", bits, MAX_SYNAPSE_BITS));
        }

        if let Some(name) = name {
            if self.named_synapses.contains_key(name) {
                return Err(CoreError::invalid_parameter(
                    "synapses name",
                    name.to_string(),
                    "a name not already in use",
                ));
            }
            self.named_synapses.insert(name.to_string(), self.synapses.len());
        }
        self.synapses.push(synapses);
        Ok(self.synapses.len() - 1)
    }

    /// Attach an outgoing fan-out; must be one-to-one with this
    /// population.
    pub fn add_axons(&mut self, axons: Axons, name: Option<&str>) -> Result<usize> {
        if axons.n_axons() != self.n {
            return Err(CoreError::invalid_parameter(
                "axons",
                format!("{} axons", axons.n_axons()),
                format!("{} (one per compartment)", self.n),
            ));
        }
        if let Some(name) = name {
            if self.named_axons.contains_key(name) {
                return Err(CoreError::invalid_parameter(
                    "axons name",
                    name.to_string(),
                    "a name not already in use",
                ));
            }
            self.named_axons.insert(name.to_string(), self.axons.len());
        }
        self.axons.push(axons);
        Ok(self.axons.len() - 1)
    }

    /// Attach a probe.
    pub fn add_probe(&mut self, probe: Probe) -> usize {
        self.probes.push(probe);
        self.probes.len() - 1
    }

    /// Look up a synapse bank by name.
    pub fn synapses_named(&self, name: &str) -> Option<usize> {
        self.named_synapses.get(name).copied()
    }

    /// Look up an axon fan-out by name.
    pub fn axons_named(&self, name: &str) -> Option<usize> {
        self.named_axons.get(name).copied()
    }

    /// The group's synapse banks.
    pub fn synapses(&self) -> &[Synapses] {
        &self.synapses
    }

    /// The group's outgoing fan-outs.
    pub fn axons(&self) -> &[Axons] {
        &self.axons
    }

    /// The group's threshold array.
    pub fn vth(&self) -> &NumericArray {
        &self.vth
    }

    /// The group's bias array.
    pub fn bias(&self) -> &NumericArray {
        &self.bias
    }

    /// The group's current-filter decay array.
    pub fn decay_u(&self) -> &NumericArray {
        &self.decay_u
    }

    /// The group's voltage-filter decay array.
    pub fn decay_v(&self) -> &NumericArray {
        &self.decay_v
    }

    /// The group's refractory delays, in ticks.
    pub fn refract_delay(&self) -> &[i32] {
        &self.refract_delay
    }

    /// Voltage clamp floor.
    pub fn vmin(&self) -> f64 {
        self.vmin
    }

    /// Voltage clamp ceiling.
    pub fn vmax(&self) -> f64 {
        self.vmax
    }

    /// Whether filtered input is scaled by the current decay.
    pub fn scale_u(&self) -> bool {
        self.scale_u
    }

    /// Whether voltage input is scaled by the voltage decay.
    pub fn scale_v(&self) -> bool {
        self.scale_v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synapse::SynapsesRef;

    #[test]
    fn test_location_from_str() {
        assert_eq!("core".parse::<Location>().unwrap(), Location::Core);
        assert_eq!("host".parse::<Location>().unwrap(), Location::Host);
        assert!("gpu".parse::<Location>().is_err());
    }

    #[test]
    fn test_configure_lif() {
        let mut g = Group::new(3);
        g.configure_lif(&LifConfig::default()).unwrap();

        let decay_u = g.decay_u().as_float().unwrap();
        let decay_v = g.decay_v().as_float().unwrap();
        assert!((f64::from(decay_u[0]) - (1.0 - (-0.2f64).exp())).abs() < 1e-6);
        assert!((f64::from(decay_v[0]) - (1.0 - (-0.05f64).exp())).abs() < 1e-6);
        assert_eq!(g.refract_delay()[0], 2);
        assert!(g.scale_u());
        assert!(g.scale_v());
        assert_eq!(g.vmin(), 0.0);
        assert!(g.vmax().is_infinite());
    }

    #[test]
    fn test_configure_relu_and_nonspiking() {
        let mut g = Group::new(2);
        g.configure_relu(&ReluConfig::default()).unwrap();
        assert_eq!(g.decay_v().as_float().unwrap(), &[0.0, 0.0]);
        assert_eq!(g.decay_u().as_float().unwrap(), &[1.0, 1.0]); // tau_s == 0
        assert_eq!(g.refract_delay()[0], 1);
        assert!(!g.scale_v());

        let mut g = Group::new(2);
        g.configure_nonspiking(&NonspikingConfig::default()).unwrap();
        assert_eq!(g.decay_v().as_float().unwrap(), &[1.0, 1.0]);
        assert_eq!(g.refract_delay()[0], 1);
    }

    #[test]
    fn test_configure_rejects_bad_params() {
        let mut g = Group::new(1);
        assert!(g
            .configure_lif(&LifConfig {
                tau_ref: -0.001,
                ..LifConfig::default()
            })
            .is_err());
        assert!(g
            .configure_lif(&LifConfig {
                tau_rc: 0.0,
                ..LifConfig::default()
            })
            .is_err());
        // refractory delay beyond the 6-bit field
        assert!(g
            .configure_lif(&LifConfig {
                tau_ref: 0.1,
                ..LifConfig::default()
            })
            .is_err());
    }

    #[test]
    fn test_voltage_range_validation() {
        let mut g = Group::new(1);
        assert!(g.set_voltage_range(0.5, 10.0).is_err());
        assert!(g.set_voltage_range(-10.0, -1.0).is_err());
        assert!(g.set_voltage_range(-10.0, 100.0).is_ok());
    }

    #[test]
    fn test_set_bias_length_checked() {
        let mut g = Group::new(3);
        assert!(g.set_bias(&[1.0, 2.0]).is_err());
        assert!(g.set_bias(&[1.0, 2.0, 3.0]).is_ok());
    }

    #[test]
    fn test_add_synapses_capacity() {
        let mut g = Group::new(8);
        let mut syn = Synapses::new(AXONS_MAX + 1);
        let rows = vec![vec![1.0f32]; AXONS_MAX + 1];
        syn.set_full_weights(rows).unwrap();
        assert!(matches!(
            g.add_synapses(syn, None),
            Err(CoreError::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn test_add_synapses_index_bounds() {
        let mut g = Group::new(2);
        let mut syn = Synapses::new(1);
        // three targets, but the group only has two compartments
        syn.set_full_weights(vec![vec![1.0, 1.0, 1.0]]).unwrap();
        assert!(g.add_synapses(syn, None).is_err());
    }

    #[test]
    fn test_named_synapses() {
        let mut g = Group::new(2);
        let mut syn = Synapses::new(2);
        syn.set_diagonal_weights(&[1.0, 1.0]).unwrap();
        let idx = g.add_synapses(syn, Some("ff")).unwrap();
        assert_eq!(g.synapses_named("ff"), Some(idx));

        let mut dup = Synapses::new(2);
        dup.set_diagonal_weights(&[1.0, 1.0]).unwrap();
        assert!(g.add_synapses(dup, Some("ff")).is_err());
    }

    #[test]
    fn test_add_axons_one_to_one() {
        let mut g = Group::new(4);
        let target = SynapsesRef { group: 0, bank: 0 };
        assert!(g.add_axons(Axons::new(3, target), None).is_err());
        assert!(g.add_axons(Axons::new(4, target), None).is_ok());
    }
}
