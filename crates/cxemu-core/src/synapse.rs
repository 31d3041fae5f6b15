//! Synapse banks and axon fan-outs
//!
//! A `Synapses` bank is the weighted fan-in of a group: one weight/index
//! row per input axon, sharing a single format word. An `Axons` object
//! fans a source population's spikes out onto a bank's input lines.
//! Ownership is strictly tree-shaped — the model owns groups, groups own
//! their banks and axons — so cross-references are `Copy` handles.

use cxemu_fmt::{tracing_mag_int_frac, SynapseFmt, INDEX_BITS_MAP};

use crate::array::NumericArray;
use crate::error::{CoreError, Result};

/// Handle naming one synapse bank: the owning group's position in the
/// model and the bank's position within that group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SynapsesRef {
    /// Owning group position in the model
    pub group: usize,
    /// Bank position within the group
    pub bank: usize,
}

/// Spike-triggered trace configuration for a learning bank.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceConfig {
    /// Trace decay time constant, in ticks
    pub tau: u32,
    /// Trace increment per presynaptic spike
    pub mag: f32,
}

/// A weighted fan-in bank with `n_axons` input lines.
#[derive(Debug, Clone)]
pub struct Synapses {
    n_axons: usize,
    /// One weight row per input axon
    pub(crate) weights: Vec<NumericArray>,
    /// Target compartment index row matching each weight row
    pub(crate) indices: Vec<Vec<u32>>,
    pub(crate) fmt: Option<SynapseFmt>,
    pub(crate) tracing: Option<TraceConfig>,
}

impl Synapses {
    /// Create an empty bank with `n_axons` input lines.
    pub fn new(n_axons: usize) -> Self {
        Self {
            n_axons,
            weights: Vec::new(),
            indices: Vec::new(),
            fmt: None,
            tracing: None,
        }
    }

    /// Number of input lines.
    pub fn n_axons(&self) -> usize {
        self.n_axons
    }

    /// Total number of stored synapse entries.
    pub fn size(&self) -> usize {
        self.weights.iter().map(NumericArray::len).sum()
    }

    /// Whether the bank updates a spike trace.
    pub fn is_tracing(&self) -> bool {
        self.tracing.is_some()
    }

    /// Trace configuration, if learning is enabled.
    pub fn tracing(&self) -> Option<TraceConfig> {
        self.tracing
    }

    /// Shared format word, if one has been chosen.
    pub fn fmt(&self) -> Option<&SynapseFmt> {
        self.fmt.as_ref()
    }

    /// Largest absolute weight; negative infinity if the bank holds
    /// rows but every row is empty, zero if no rows exist yet.
    pub fn max_abs_weight(&self) -> f64 {
        if self.weights.is_empty() {
            return 0.0;
        }
        self.weights
            .iter()
            .map(|w| {
                if w.is_empty() {
                    f64::NEG_INFINITY
                } else {
                    w.max_abs()
                }
            })
            .fold(f64::NEG_INFINITY, f64::max)
    }

    /// Largest stored compartment index, or -1 with no entries.
    pub fn max_index(&self) -> i64 {
        self.indices
            .iter()
            .flat_map(|row| row.iter())
            .map(|&i| i64::from(i))
            .max()
            .unwrap_or(-1)
    }

    /// Synapse memory consumed by this bank, in bits.
    pub fn bits(&self) -> Result<usize> {
        let fmt = self.fmt.as_ref().ok_or_else(|| {
            CoreError::invalid_parameter("format", "unset", "a formatted synapse bank")
        })?;
        let mut total = 0;
        for row in &self.weights {
            total += fmt.bits_per_axon(row.len())?;
        }
        Ok(total)
    }

    /// Install a dense weight matrix, one row per input line.
    ///
    /// Row `i` targets compartments `0..row.len()` in order. Chooses the
    /// dense-run format with 8-bit mixed-sign weights and the narrowest
    /// index width that covers the largest target.
    pub fn set_full_weights(&mut self, rows: Vec<Vec<f32>>) -> Result<()> {
        if rows.len() != self.n_axons {
            return Err(CoreError::invalid_parameter(
                "weights",
                format!("{} rows", rows.len()),
                format!("{} rows (one per input axon)", self.n_axons),
            ));
        }
        self.indices = rows.iter().map(|r| (0..r.len() as u32).collect()).collect();
        self.weights = rows.into_iter().map(NumericArray::Float).collect();
        self.choose_dense_format()
    }

    /// Install a diagonal weight vector: line `i` targets compartment `i`.
    pub fn set_diagonal_weights(&mut self, diag: &[f32]) -> Result<()> {
        if diag.len() != self.n_axons {
            return Err(CoreError::invalid_parameter(
                "weights",
                format!("{} diagonal entries", diag.len()),
                format!("{} (one per input axon)", self.n_axons),
            ));
        }
        self.weights = diag.iter().map(|&d| NumericArray::Float(vec![d])).collect();
        self.indices = (0..diag.len() as u32).map(|i| vec![i]).collect();
        self.choose_dense_format()
    }

    fn choose_dense_format(&mut self) -> Result<()> {
        let needed = index_width(self.max_index());
        let idx_bits = INDEX_BITS_MAP
            .iter()
            .position(|&v| v >= needed)
            .ok_or_else(|| {
                CoreError::invalid_parameter(
                    "indices",
                    format!("{} index bits", needed),
                    format!("<= {}", INDEX_BITS_MAP[INDEX_BITS_MAP.len() - 1]),
                )
            })?;
        let fmt = SynapseFmt {
            compression: 3,
            idx_bits: idx_bits as u8,
            fanout_type: 1,
            num_synapses: 63,
            wgt_bits: 7,
            ..SynapseFmt::default()
        };
        fmt.validate()?;
        self.fmt = Some(fmt);
        Ok(())
    }

    /// Enable spike tracing with the given decay and magnitude.
    ///
    /// The magnitude's integer part must fit the 7-bit trace field.
    pub fn set_learning(&mut self, tracing_tau: u32, tracing_mag: f32) -> Result<()> {
        let (mag_int, _mag_frac) = tracing_mag_int_frac(tracing_mag);
        if mag_int >= 1 << 7 {
            return Err(CoreError::invalid_parameter(
                "tracing_mag",
                tracing_mag.to_string(),
                "integer part < 128",
            ));
        }
        let fmt = self.fmt.get_or_insert_with(SynapseFmt::default);
        fmt.learning_cfg = 1;
        fmt.stdp_profile = 0;
        self.tracing = Some(TraceConfig {
            tau: tracing_tau,
            mag: tracing_mag,
        });
        Ok(())
    }

    /// Replace the bank's format word.
    pub fn set_format(&mut self, fmt: SynapseFmt) -> Result<()> {
        fmt.validate()?;
        self.fmt = Some(fmt);
        Ok(())
    }
}

fn index_width(max_index: i64) -> u32 {
    if max_index <= 0 {
        0
    } else {
        64 - (max_index as u64).leading_zeros()
    }
}

/// Which input lines of the target bank each source spike lands on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetInds {
    /// Line `i` receives source compartment `i`'s spike
    Full,
    /// Line `map[i]` receives source compartment `i`'s spike; duplicate
    /// destinations accumulate
    Map(Vec<u32>),
}

/// A fan-out from a source population onto a synapse bank's input lines.
///
/// Axons carry no data of their own; `n_axons` must equal the source
/// population size (one-to-one fan-out).
#[derive(Debug, Clone)]
pub struct Axons {
    n_axons: usize,
    /// Target synapse bank
    pub target: SynapsesRef,
    /// Input-line selection on the target
    pub target_inds: TargetInds,
}

impl Axons {
    /// Create a one-to-one fan-out onto `target`.
    pub fn new(n_axons: usize, target: SynapsesRef) -> Self {
        Self {
            n_axons,
            target,
            target_inds: TargetInds::Full,
        }
    }

    /// Replace the input-line mapping.
    pub fn with_target_inds(mut self, map: Vec<u32>) -> Self {
        self.target_inds = TargetInds::Map(map);
        self
    }

    /// Number of axons (equals the source population size).
    pub fn n_axons(&self) -> usize {
        self.n_axons
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_weights_build_dense_format() {
        let mut syn = Synapses::new(3);
        syn.set_full_weights(vec![vec![1.0, 2.0], vec![0.5, -0.5], vec![0.0, 0.0]])
            .unwrap();

        assert_eq!(syn.size(), 6);
        assert_eq!(syn.max_index(), 1);
        let fmt = syn.fmt().unwrap();
        assert_eq!(fmt.compression, 3);
        assert_eq!(fmt.wgt_bits, 7);
        assert_eq!(fmt.real_idx_bits(), 6);
        assert_eq!(syn.max_abs_weight(), 2.0);
    }

    #[test]
    fn test_full_weights_row_count_checked() {
        let mut syn = Synapses::new(2);
        let err = syn.set_full_weights(vec![vec![1.0]]);
        assert!(err.is_err());
    }

    #[test]
    fn test_diagonal_weights() {
        let mut syn = Synapses::new(4);
        syn.set_diagonal_weights(&[1.0, -2.0, 3.0, 4.0]).unwrap();

        assert_eq!(syn.size(), 4);
        assert_eq!(syn.indices[2], vec![2]);
        assert_eq!(syn.max_abs_weight(), 4.0);
    }

    #[test]
    fn test_wide_indices_pick_wider_field() {
        let mut syn = Synapses::new(1);
        syn.set_full_weights(vec![vec![0.1; 300]]).unwrap();
        // 300 targets need 9 index bits
        assert_eq!(syn.fmt().unwrap().real_idx_bits(), 9);
    }

    #[test]
    fn test_set_learning() {
        let mut syn = Synapses::new(2);
        syn.set_diagonal_weights(&[1.0, 1.0]).unwrap();
        syn.set_learning(2, 1.5).unwrap();

        assert!(syn.is_tracing());
        let fmt = syn.fmt().unwrap();
        assert_eq!(fmt.learning_cfg, 1);

        let mut syn = Synapses::new(1);
        syn.set_diagonal_weights(&[1.0]).unwrap();
        assert!(syn.set_learning(2, 200.0).is_err());
    }

    #[test]
    fn test_empty_bank_weight_stats() {
        let syn = Synapses::new(4);
        assert_eq!(syn.max_abs_weight(), 0.0);
        assert_eq!(syn.max_index(), -1);
        assert!(syn.bits().is_err()); // no format chosen yet
    }

    #[test]
    fn test_bits_accounting() {
        let mut syn = Synapses::new(2);
        syn.set_full_weights(vec![vec![1.0; 10], vec![1.0; 10]]).unwrap();
        // each axon: 10 entries * 8 bits + 10 header bits -> 2 words
        assert_eq!(syn.bits().unwrap(), 2 * 2 * 64);
    }

    #[test]
    fn test_axons_target_inds() {
        let target = SynapsesRef { group: 0, bank: 0 };
        let ax = Axons::new(5, target);
        assert_eq!(ax.target_inds, TargetInds::Full);

        let ax = Axons::new(3, target).with_target_inds(vec![0, 0, 2]);
        assert_eq!(ax.target_inds, TargetInds::Map(vec![0, 0, 2]));
    }
}
