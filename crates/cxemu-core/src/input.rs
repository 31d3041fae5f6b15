//! External spike inputs
//!
//! A `SpikeInput` is a pseudo-group with no compartment state: a dense
//! boolean spike raster driving one or more axon fan-outs. The kernel
//! reads row `t` on tick `t`; rows may be appended between ticks, which
//! is how an external host simulator feeds the core.

use crate::error::{CoreError, Result};
use crate::probe::{Probe, ProbeKey};
use crate::synapse::Axons;

/// An externally-supplied dense spike raster.
#[derive(Debug, Clone)]
pub struct SpikeInput {
    n: usize,
    pub(crate) spikes: Vec<Vec<bool>>,
    pub(crate) axons: Vec<Axons>,
    pub(crate) probes: Vec<Probe>,
}

impl SpikeInput {
    /// Create an input with `n` spike lines and no rows yet.
    pub fn new(n: usize) -> Self {
        Self {
            n,
            spikes: Vec::new(),
            axons: Vec::new(),
            probes: Vec::new(),
        }
    }

    /// Create an input from a prebuilt raster; all rows must have the
    /// same width.
    pub fn from_rows(rows: Vec<Vec<bool>>) -> Result<Self> {
        let n = rows.first().map(Vec::len).unwrap_or(0);
        let mut input = Self::new(n);
        input.push_rows(rows)?;
        Ok(input)
    }

    /// Number of spike lines.
    pub fn n(&self) -> usize {
        self.n
    }

    /// Number of rows currently available.
    pub fn n_rows(&self) -> usize {
        self.spikes.len()
    }

    /// Append one spike row.
    pub fn push_row(&mut self, row: Vec<bool>) -> Result<()> {
        if row.len() != self.n {
            return Err(CoreError::invalid_parameter(
                "spike row",
                format!("{} lines", row.len()),
                format!("{} lines", self.n),
            ));
        }
        self.spikes.push(row);
        Ok(())
    }

    /// Append several spike rows.
    pub fn push_rows(&mut self, rows: Vec<Vec<bool>>) -> Result<()> {
        for row in rows {
            self.push_row(row)?;
        }
        Ok(())
    }

    /// Attach an outgoing fan-out; must be one-to-one with the lines.
    pub fn add_axons(&mut self, axons: Axons) -> Result<usize> {
        if axons.n_axons() != self.n {
            return Err(CoreError::invalid_parameter(
                "axons",
                format!("{} axons", axons.n_axons()),
                format!("{} (one per spike line)", self.n),
            ));
        }
        self.axons.push(axons);
        Ok(self.axons.len() - 1)
    }

    /// Attach a probe; spike inputs expose only spike state.
    pub fn add_probe(&mut self, probe: Probe) -> Result<usize> {
        match probe.key {
            ProbeKey::Spiked | ProbeKey::SpikeRate => {}
            key => {
                return Err(CoreError::BadProbeKey {
                    key: key.name(),
                    target: "spike input".into(),
                })
            }
        }
        self.probes.push(probe);
        Ok(self.probes.len() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synapse::SynapsesRef;

    #[test]
    fn test_from_rows() {
        let input = SpikeInput::from_rows(vec![vec![true, false], vec![false, true]]).unwrap();
        assert_eq!(input.n(), 2);
        assert_eq!(input.n_rows(), 2);
    }

    #[test]
    fn test_row_width_checked() {
        let mut input = SpikeInput::new(3);
        assert!(input.push_row(vec![true, false]).is_err());
        assert!(input.push_row(vec![false; 3]).is_ok());
    }

    #[test]
    fn test_axons_must_match_lines() {
        let mut input = SpikeInput::new(4);
        let target = SynapsesRef { group: 0, bank: 0 };
        assert!(input.add_axons(Axons::new(3, target)).is_err());
        assert!(input.add_axons(Axons::new(4, target)).is_ok());
    }

    #[test]
    fn test_probe_keys_limited_to_spikes() {
        let mut input = SpikeInput::new(2);
        assert!(input.add_probe(Probe::new(ProbeKey::Spiked)).is_ok());
        assert!(input.add_probe(Probe::new(ProbeKey::SpikeRate)).is_ok());
        assert!(input.add_probe(Probe::new(ProbeKey::V)).is_err());
    }
}
