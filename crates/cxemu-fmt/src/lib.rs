//! Chip numeric field encodings for the cxemu compartment simulator
//!
//! The target hardware stores every compartment parameter in a narrow
//! mantissa/exponent or plain fixed-point field. This crate is the single
//! source of truth for those bit widths: threshold and bias encoders, the
//! 12-bit filter decay scale, voltage floor/ceiling exponents, refractory
//! limits, and the synapse format descriptor with its weight
//! discretization and memory accounting.
//!
//! Everything here is pure and stateless; the model and kernel crates
//! build on top of it.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod synapse_fmt;

pub use error::{FmtError, Result};
pub use synapse_fmt::{SynapseFmt, INDEX_BITS_MAP};

/// Maximum voltage-threshold mantissa (17-bit field).
pub const VTH_MAN_MAX: i32 = (1 << 17) - 1;

/// Fixed exponent applied to every voltage threshold.
pub const VTH_EXP: i32 = 6;

/// Largest representable voltage threshold, `VTH_MAN_MAX * 2^VTH_EXP`.
pub const VTH_MAX: i32 = VTH_MAN_MAX << VTH_EXP;

/// Maximum bias mantissa magnitude (12-bit field plus sign).
pub const BIAS_MAN_MAX: i32 = (1 << 12) - 1;

/// Maximum bias exponent (3-bit field).
pub const BIAS_EXP_MAX: i32 = (1 << 3) - 1;

/// Largest representable bias magnitude, `BIAS_MAN_MAX * 2^BIAS_EXP_MAX`.
pub const BIAS_MAX: i32 = BIAS_MAN_MAX << BIAS_EXP_MAX;

/// Scale for quantizing filter decay rates (12-bit field).
pub const DECAY_MAX: i32 = (1 << 12) - 1;

/// Largest refractory delay in ticks (6-bit field).
pub const REFRACT_DELAY_MAX: i32 = (1 << 6) - 1;

/// Split a voltage threshold into its mantissa/exponent encoding.
///
/// The exponent is fixed at [`VTH_EXP`]; the mantissa must land in
/// `[0, VTH_MAN_MAX]`. Out-of-range inputs are a program error: the
/// discretizer only calls this after scale selection has proven the
/// threshold feasible.
pub fn vth_to_manexp(vth: f64) -> (i32, i32) {
    let exp = VTH_EXP;
    let man = (vth / f64::from(1 << exp)).round() as i32;
    assert!(
        (0..=VTH_MAN_MAX).contains(&man),
        "vth mantissa {} out of range [0, {}]",
        man,
        VTH_MAN_MAX
    );
    (man, exp)
}

/// Split a bias into its mantissa/exponent encoding.
///
/// The exponent is the smallest value that brings the mantissa magnitude
/// within [`BIAS_MAN_MAX`]. Out-of-range inputs are a program error, as
/// with [`vth_to_manexp`].
pub fn bias_to_manexp(bias: f64) -> (i32, i32) {
    let r = (bias.abs() / f64::from(BIAS_MAN_MAX)).max(1.0);
    let exp = r.log2().ceil() as i32;
    assert!(
        (0..=BIAS_EXP_MAX).contains(&exp),
        "bias exponent {} out of range [0, {}]",
        exp,
        BIAS_EXP_MAX
    );
    let man = (bias / f64::from(1i32 << exp)).round() as i32;
    assert!(
        man.abs() <= BIAS_MAN_MAX,
        "bias mantissa {} out of range [-{1}, {1}]",
        man,
        BIAS_MAN_MAX
    );
    (man, exp)
}

/// Quantize a filter decay rate onto the 12-bit hardware grid.
pub fn decay_to_fixed(decay: f32) -> i32 {
    (f64::from(decay) * f64::from(DECAY_MAX)).round() as i32
}

/// Quantize a voltage floor onto the `-2^e + 1` grid, `e` in `[0, 31]`.
pub fn vmin_quantize(vmin: f64) -> f64 {
    let e = (-vmin + 1.0).log2().round().clamp(0.0, 31.0);
    -(2f64.powf(e)) + 1.0
}

/// Quantize a voltage ceiling onto the `2^(9 + 2e) - 1` grid, `e` in `[0, 7]`.
///
/// An unbounded ceiling saturates to the largest grid point, `2^23 - 1`.
pub fn vmax_quantize(vmax: f64) -> f64 {
    let e = (((vmax + 1.0).log2() - 9.0) * 0.5).round().clamp(0.0, 7.0);
    2f64.powf(9.0 + 2.0 * e) - 1.0
}

/// Split a trace magnitude into its integer and 1/128-fractional parts.
pub fn tracing_mag_int_frac(mag: f32) -> (i32, i32) {
    let mag_int = mag.trunc() as i32;
    let mag_frac = (128.0 * (f64::from(mag) - f64::from(mag_int))).round() as i32;
    (mag_int, mag_frac)
}
