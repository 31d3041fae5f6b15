//! State probes and readout filtering
//!
//! A probe names a piece of per-compartment state on a group (or the
//! spike raster of an input), an optional compartment slice, an optional
//! dense decode matrix, and an optional first-order readout filter. The
//! kernel captures one snapshot per tick; decoding and filtering happen
//! lazily at readout.

use std::ops::Range;

use crate::error::{CoreError, Result};

/// Which state a probe samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProbeKey {
    /// Synaptic current `u`
    U,
    /// Membrane voltage `v`
    V,
    /// Raw spike bitmap as 0/1
    Spiked,
    /// Spikes scaled to `1/dt`, for rate-style readout
    SpikeRate,
    /// Current relative to threshold, `u / vth`
    X,
}

impl ProbeKey {
    /// Short display name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::U => "u",
            Self::V => "v",
            Self::Spiked => "s",
            Self::SpikeRate => "s/dt",
            Self::X => "x",
        }
    }
}

/// A recording tap on a group or spike input.
#[derive(Debug, Clone)]
pub struct Probe {
    /// Sampled state
    pub key: ProbeKey,
    /// Compartment sub-range; `None` records the whole target
    pub slice: Option<Range<usize>>,
    /// Dense decode matrix, one row per probed compartment
    pub weights: Option<Vec<Vec<f32>>>,
    /// First-order readout filter time constant, seconds
    pub synapse: Option<f64>,
}

impl Probe {
    /// Probe the whole target with no decoding or filtering.
    pub fn new(key: ProbeKey) -> Self {
        Self {
            key,
            slice: None,
            weights: None,
            synapse: None,
        }
    }

    /// Restrict the probe to a compartment sub-range.
    pub fn with_slice(mut self, slice: Range<usize>) -> Self {
        self.slice = Some(slice);
        self
    }

    /// Decode snapshots through a dense matrix at readout.
    pub fn with_weights(mut self, weights: Vec<Vec<f32>>) -> Self {
        self.weights = Some(weights);
        self
    }

    /// Low-pass filter snapshots at readout with time constant `tau_s`.
    pub fn with_filter(mut self, tau_s: f64) -> Self {
        self.synapse = Some(tau_s);
        self
    }

    /// Resolve the probed range against a target of `n` compartments.
    pub(crate) fn resolve_slice(&self, n: usize) -> Result<Range<usize>> {
        match &self.slice {
            None => Ok(0..n),
            Some(r) if r.start <= r.end && r.end <= n => Ok(r.clone()),
            Some(r) => Err(CoreError::invalid_parameter(
                "probe slice",
                format!("{}..{}", r.start, r.end),
                format!("within 0..{}", n),
            )),
        }
    }
}

/// Handle naming one probe in the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeHandle {
    /// Probe on a compartment group
    Group {
        /// Group position in the model
        group: usize,
        /// Probe position within the group
        probe: usize,
    },
    /// Probe on a spike input
    Input {
        /// Input position in the model
        input: usize,
        /// Probe position within the input
        probe: usize,
    },
}

/// Discrete first-order low-pass, matching a zero-order-hold
/// exponential filter at step `dt`.
#[derive(Debug, Clone)]
pub(crate) struct Lowpass {
    d: f32,
    state: Vec<f32>,
}

impl Lowpass {
    pub(crate) fn new(tau_s: f64, dt: f64, dim: usize) -> Self {
        let d = if tau_s > 0.0 {
            (-dt / tau_s).exp() as f32
        } else {
            0.0
        };
        Self {
            d,
            state: vec![0.0; dim],
        }
    }

    /// Filter one sample row in place.
    pub(crate) fn filter_row(&mut self, row: &mut [f32]) {
        debug_assert_eq!(row.len(), self.state.len());
        for (y, x) in self.state.iter_mut().zip(row.iter_mut()) {
            *y += (1.0 - self.d) * (*x - *y);
            *x = *y;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_slice() {
        let p = Probe::new(ProbeKey::V);
        assert_eq!(p.resolve_slice(5).unwrap(), 0..5);

        let p = Probe::new(ProbeKey::V).with_slice(1..3);
        assert_eq!(p.resolve_slice(5).unwrap(), 1..3);

        let p = Probe::new(ProbeKey::V).with_slice(2..9);
        assert!(p.resolve_slice(5).is_err());
    }

    #[test]
    fn test_lowpass_steps_toward_input() {
        let mut lp = Lowpass::new(0.005, 0.001, 1);
        let mut prev = 0.0;
        for _ in 0..50 {
            let mut row = [1.0f32];
            lp.filter_row(&mut row);
            assert!(row[0] > prev);
            assert!(row[0] <= 1.0);
            prev = row[0];
        }
        // converged most of the way after 10 time constants
        assert!(prev > 0.99);
    }

    #[test]
    fn test_lowpass_zero_tau_passes_through() {
        let mut lp = Lowpass::new(0.0, 0.001, 2);
        let mut row = [0.5f32, -0.25];
        lp.filter_row(&mut row);
        assert_eq!(row, [0.5, -0.25]);
    }
}
