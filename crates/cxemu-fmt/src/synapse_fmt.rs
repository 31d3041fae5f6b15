//! Synapse format descriptor and weight discretization
//!
//! A synapse bank shares one format word describing how its entries are
//! packed: index width, weight width, sign handling, exponent, compression
//! and learning flags. The format also fixes how float weights map onto
//! the hardware's shifted 8-bit grid and how much synapse memory each
//! axon's entries consume.

use crate::error::{FmtError, Result};

/// Real index widths selectable by the 3-bit `idx_bits` field.
pub const INDEX_BITS_MAP: [u32; 8] = [0, 6, 7, 8, 9, 10, 11, 12];

/// Packed synapse format word.
///
/// Field names mirror the hardware register layout; most carry their
/// reset value of zero until a bank chooses its encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SynapseFmt {
    /// Weight limit mantissa
    pub wgt_limit_mant: u8,
    /// Weight limit exponent
    pub wgt_limit_exp: u8,
    /// Shared weight exponent, -7..=7
    pub wgt_exp: i8,
    /// Discretized maximum weight
    pub disc_max_wgt: u8,
    /// Learning configuration selector
    pub learning_cfg: u8,
    /// Tag field width
    pub tag_bits: u8,
    /// Delay field width
    pub dly_bits: u8,
    /// Weight field width minus sign bit
    pub wgt_bits: u8,
    /// Reuse-synapse-data flag
    pub reuse_syn_data: u8,
    /// Entries per run, minus one
    pub num_synapses: u8,
    /// Compartment index offset
    pub c_idx_offset: u8,
    /// Compartment index multiplier
    pub c_idx_mult: u8,
    /// Skip field width
    pub skip_bits: u8,
    /// Index width selector into [`INDEX_BITS_MAP`]
    pub idx_bits: u8,
    /// Synapse type
    pub syn_type: u8,
    /// Fanout type; 1 means mixed-sign weights
    pub fanout_type: u8,
    /// Compression mode; 0 sparse, 3 dense runs
    pub compression: u8,
    /// STDP profile selector
    pub stdp_profile: u8,
    /// Ignore-delay flag
    pub ignore_dly: u8,
}

impl SynapseFmt {
    /// Weight scaling factor `2^(6 + wgt_exp)` for a given exponent.
    pub fn weight_scale(wgt_exp: i32) -> f64 {
        2f64.powi(6 + wgt_exp)
    }

    /// Stored weight width including the sign bit.
    pub fn width(&self) -> u32 {
        1 + u32::from(self.wgt_bits)
    }

    /// Whether weights carry mixed signs.
    pub fn is_mixed(&self) -> bool {
        self.fanout_type == 1
    }

    /// Left-shift applied to stored weights, `6 + wgt_exp`.
    pub fn w_scale(&self) -> i32 {
        6 + i32::from(self.wgt_exp)
    }

    /// Real index width in bits.
    pub fn real_idx_bits(&self) -> u32 {
        INDEX_BITS_MAP[usize::from(self.idx_bits)]
    }

    /// Real weight width in bits; a 7-bit field packs as a full byte.
    pub fn real_wgt_bits(&self) -> u32 {
        if self.wgt_bits == 7 {
            8
        } else {
            u32::from(self.wgt_bits)
        }
    }

    /// Validate all fields against their hardware ranges.
    pub fn validate(&self) -> Result<()> {
        if !(-7..=7).contains(&self.wgt_exp) {
            return Err(FmtError::invalid_field(
                "wgt_exp",
                i64::from(self.wgt_exp),
                "-7..=7",
            ));
        }
        if self.tag_bits >= 4 {
            return Err(FmtError::invalid_field(
                "tag_bits",
                i64::from(self.tag_bits),
                "0..4",
            ));
        }
        if self.dly_bits >= 8 {
            return Err(FmtError::invalid_field(
                "dly_bits",
                i64::from(self.dly_bits),
                "0..8",
            ));
        }
        if !(1..8).contains(&self.wgt_bits) {
            return Err(FmtError::invalid_field(
                "wgt_bits",
                i64::from(self.wgt_bits),
                "1..8",
            ));
        }
        if self.c_idx_offset >= 16 {
            return Err(FmtError::invalid_field(
                "c_idx_offset",
                i64::from(self.c_idx_offset),
                "0..16",
            ));
        }
        if self.c_idx_mult >= 16 {
            return Err(FmtError::invalid_field(
                "c_idx_mult",
                i64::from(self.c_idx_mult),
                "0..16",
            ));
        }
        if self.idx_bits >= 8 {
            return Err(FmtError::invalid_field(
                "idx_bits",
                i64::from(self.idx_bits),
                "0..8",
            ));
        }
        Ok(())
    }

    /// Discretize one weight onto the shifted grid for this format.
    ///
    /// With width `w` and mixed flag `m`, the grid step is `2^s` for
    /// `s = 8 - w + m`; values clip to the `8 - s`-bit magnitude and the
    /// result is left-shifted by `w_scale + s`.
    pub fn discretize_weight(&self, w: f64) -> i32 {
        let s = 8 - self.width() as i32 + i32::from(self.is_mixed());
        let m = (1i32 << (8 - s)) - 1;
        let shift = self.w_scale() + s;
        assert!(shift >= 0, "negative weight shift {}", shift);
        let q = (w / 2f64.powi(s)).round();
        let q = (q as i32).clamp(-m, m);
        q << shift
    }

    /// Discretize a row of weights; see [`Self::discretize_weight`].
    pub fn discretize_weights(&self, weights: &[f64]) -> Vec<i32> {
        weights.iter().map(|&w| self.discretize_weight(w)).collect()
    }

    /// Synapse memory consumed by one axon holding `n_weights` entries.
    ///
    /// Entries pack into runs of `num_synapses + 1`; each run pays a 4-bit
    /// format index plus a 6-bit run length and rounds up to a 64-bit
    /// word. Sparse banks (compression 0) additionally store an index per
    /// entry; dense runs (compression 3) do not.
    pub fn bits_per_axon(&self, n_weights: usize) -> Result<usize> {
        let mut bits_per_entry =
            (self.real_wgt_bits() + u32::from(self.dly_bits) + u32::from(self.tag_bits)) as usize;
        match self.compression {
            0 => bits_per_entry += self.real_idx_bits() as usize,
            3 => {}
            mode => return Err(FmtError::UnsupportedCompression { mode }),
        }

        const FMT_IDX_BITS: usize = 4;
        const RUN_LEN_BITS: usize = 6;
        let per_run = usize::from(self.num_synapses) + 1;

        let mut bits = 0;
        let mut i = 0;
        while i < n_weights {
            let n = (n_weights - i).min(per_run);
            let run_bits = n * bits_per_entry + FMT_IDX_BITS + RUN_LEN_BITS;
            bits += (run_bits + 63) / 64 * 64;
            i += per_run;
        }
        Ok(bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn dense_fmt() -> SynapseFmt {
        SynapseFmt {
            compression: 3,
            idx_bits: 1,
            fanout_type: 1,
            num_synapses: 63,
            wgt_bits: 7,
            ..SynapseFmt::default()
        }
    }

    #[test]
    fn test_derived_properties() {
        let fmt = dense_fmt();
        assert_eq!(fmt.width(), 8);
        assert!(fmt.is_mixed());
        assert_eq!(fmt.w_scale(), 6);
        assert_eq!(fmt.real_idx_bits(), 6);
        assert_eq!(fmt.real_wgt_bits(), 8);
        assert!(fmt.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        let mut fmt = dense_fmt();
        fmt.wgt_exp = 8;
        assert!(fmt.validate().is_err());

        let mut fmt = dense_fmt();
        fmt.wgt_bits = 0;
        assert!(fmt.validate().is_err());

        let mut fmt = dense_fmt();
        fmt.tag_bits = 4;
        assert!(fmt.validate().is_err());
    }

    #[test]
    fn test_discretize_weight_grid() {
        let fmt = dense_fmt();
        // width 8, mixed: step 2^1, magnitude limit 127, shift 6 + 0 + 1
        assert_eq!(fmt.discretize_weight(0.0), 0);
        assert_eq!(fmt.discretize_weight(2.0), 1 << 7);
        assert_eq!(fmt.discretize_weight(255.0), 127 << 7);
        assert_eq!(fmt.discretize_weight(-255.0), -(127 << 7));
        // clips beyond the magnitude limit
        assert_eq!(fmt.discretize_weight(1e6), 127 << 7);
    }

    #[test]
    fn test_discretize_weight_exponent_shift() {
        let mut fmt = dense_fmt();
        fmt.wgt_exp = -6;
        // shift becomes 6 - 6 + 1 = 1
        assert_eq!(fmt.discretize_weight(254.0), 127 << 1);
    }

    #[test]
    fn test_bits_per_axon_dense() {
        let fmt = dense_fmt();
        // 64 entries fit one run: 64*8 + 10 = 522 -> 9 words
        assert_eq!(fmt.bits_per_axon(64).unwrap(), 9 * 64);
        // one entry: 8 + 10 = 18 -> 1 word
        assert_eq!(fmt.bits_per_axon(1).unwrap(), 64);
        assert_eq!(fmt.bits_per_axon(0).unwrap(), 0);
        // 65 entries spill into a second run
        assert_eq!(fmt.bits_per_axon(65).unwrap(), 9 * 64 + 64);
    }

    #[test]
    fn test_bits_per_axon_sparse_counts_indices() {
        let mut fmt = dense_fmt();
        fmt.compression = 0;
        // entries now cost 8 + 6 index bits
        assert_eq!(fmt.bits_per_axon(1).unwrap(), 64);
        assert_eq!(fmt.bits_per_axon(64).unwrap(), (64 * 14 + 10 + 63) / 64 * 64);
    }

    #[test]
    fn test_bits_per_axon_rejects_unknown_compression() {
        let mut fmt = dense_fmt();
        fmt.compression = 1;
        assert!(fmt.bits_per_axon(4).is_err());
    }

    proptest! {
        #[test]
        fn prop_discretized_weight_bounded(w in -1e4f64..1e4) {
            let fmt = dense_fmt();
            let q = fmt.discretize_weight(w);
            let s = 1; // 8 - width + mixed
            let m = 127;
            prop_assert!(q.abs() <= m << (fmt.w_scale() + s));
            // always a multiple of the grid step
            prop_assert_eq!(q % (1 << (fmt.w_scale() + s)), 0);
        }
    }
}
