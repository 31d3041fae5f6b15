//! One-shot discretization of float parameters into chip fixed point
//!
//! Per group, the pass quantizes the filter decays and voltage clamp,
//! then picks a common scaling for thresholds, biases, and weights so
//! that everything lands inside the hardware bit budgets while relative
//! magnitudes survive. Three regimes cover the search: weight-dominant
//! groups sweep the shared weight exponent, bias-dominant groups halve
//! the bias scale until thresholds fit, and quiet groups simply stretch
//! the threshold to full range.

use cxemu_fmt::{
    bias_to_manexp, decay_to_fixed, vmax_quantize, vmin_quantize, vth_to_manexp, SynapseFmt,
    BIAS_MAX, VTH_MAX,
};

use crate::array::NumericArray;
use crate::error::{CoreError, Result};
use crate::group::Group;
use crate::probe::ProbeKey;

/// Weights smaller than this count as absent for regime selection.
const W_EPSILON: f64 = 1e-8;

/// Biases smaller than this count as absent for regime selection.
const B_EPSILON: f64 = 1e-8;

/// Banks whose largest weight is below this keep the floor exponent.
const BANK_EPSILON: f64 = 1e-16;

/// Floor for a bank's shared weight exponent.
const WGT_EXP_MIN: i32 = -6;

/// Shared weight exponent forced onto tracing banks.
const TRACING_WGT_EXP: i32 = 4;

pub(crate) fn discretize_group(group: &mut Group) -> Result<()> {
    let n = group.n;

    let frozen = || CoreError::frozen("group is already discretized");
    let decay_u: Vec<f32> = group.decay_u.as_float().ok_or_else(frozen)?.to_vec();
    let decay_v: Vec<f32> = group.decay_v.as_float().ok_or_else(frozen)?.to_vec();
    let vth_f: Vec<f32> = group.vth.as_float().ok_or_else(frozen)?.to_vec();
    let bias_f: Vec<f32> = group.bias.as_float().ok_or_else(frozen)?.to_vec();

    // decays, saving the input factors the float dynamics would have used
    let u_infactor: Vec<f64> = if group.scale_u {
        decay_u.iter().map(|&d| f64::from(d)).collect()
    } else {
        vec![1.0; n]
    };
    let v_infactor: Vec<f64> = if group.scale_v {
        decay_v.iter().map(|&d| f64::from(d)).collect()
    } else {
        vec![1.0; n]
    };
    group
        .decay_u
        .freeze(decay_u.iter().map(|&d| decay_to_fixed(d)).collect());
    group
        .decay_v
        .freeze(decay_v.iter().map(|&d| decay_to_fixed(d)).collect());
    group.scale_u = false;
    group.scale_v = false;

    // voltage clamp
    group.vmin = vmin_quantize(group.vmin);
    group.vmax = vmax_quantize(group.vmax);

    // scale selection
    let w_maxs: Vec<f64> = group.synapses.iter().map(|s| s.max_abs_weight()).collect();
    let w_max = if w_maxs.is_empty() {
        0.0
    } else {
        w_maxs.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    };
    let b_max = bias_f
        .iter()
        .map(|&b| f64::from(b.abs()))
        .fold(0.0, f64::max);

    let round_with = |values: &[f32], scales: &[f64]| -> Vec<f64> {
        values
            .iter()
            .zip(scales)
            .map(|(&x, &s)| (f64::from(x) * s).round())
            .collect()
    };

    let mut wgt_exp: i32 = -7;
    let v_scale: Vec<f64>;
    let w_scale: Vec<f64>;
    let vth_r: Vec<f64>;
    let bias_r: Vec<f64>;

    if w_max > W_EPSILON {
        let w_scale_0 = 255.0 / w_max;
        let s_scale: Vec<f64> = u_infactor
            .iter()
            .zip(&v_infactor)
            .map(|(&u, &v)| 1.0 / (u * v))
            .collect();

        let mut chosen = None;
        for we in (-7..=0).rev() {
            let v_s: Vec<f64> = s_scale
                .iter()
                .map(|&s| s * w_scale_0 * SynapseFmt::weight_scale(we))
                .collect();
            let b_s: Vec<f64> = v_s.iter().zip(&v_infactor).map(|(&v, &vi)| v * vi).collect();
            let vth_c = round_with(&vth_f, &v_s);
            let bias_c = round_with(&bias_f, &b_s);
            let fits = vth_c.iter().all(|&x| x <= f64::from(VTH_MAX))
                && bias_c.iter().all(|&x| x.abs() <= f64::from(BIAS_MAX));
            if fits {
                chosen = Some((we, v_s, vth_c, bias_c));
                break;
            }
        }
        let (we, v_s, vth_c, bias_c) = chosen.ok_or_else(|| {
            CoreError::discretization("no feasible weight exponent for this group")
        })?;
        wgt_exp = we;
        v_scale = v_s;
        vth_r = vth_c;
        bias_r = bias_c;
        w_scale = vec![w_scale_0; n];
    } else if b_max > B_EPSILON {
        let mut b_scale_0 = f64::from(BIAS_MAX) / b_max;
        let mut chosen = None;
        while b_scale_0 * b_max > 1.0 {
            let v_s: Vec<f64> = v_infactor.iter().map(|&vi| b_scale_0 / vi).collect();
            let w_s: Vec<f64> = u_infactor
                .iter()
                .map(|&ui| b_scale_0 * ui / SynapseFmt::weight_scale(wgt_exp))
                .collect();
            let vth_c = round_with(&vth_f, &v_s);
            let bias_c = round_with(&bias_f, &vec![b_scale_0; n]);
            if vth_c.iter().all(|&x| x <= f64::from(VTH_MAX)) {
                chosen = Some((v_s, w_s, vth_c, bias_c));
                break;
            }
            b_scale_0 /= 2.0;
        }
        let (v_s, w_s, vth_c, bias_c) = chosen.ok_or_else(|| {
            CoreError::discretization("no feasible bias scaling for this group")
        })?;
        v_scale = v_s;
        w_scale = w_s;
        vth_r = vth_c;
        bias_r = bias_c;
    } else {
        let vth_max = vth_f.iter().fold(f64::NEG_INFINITY, |m, &x| m.max(f64::from(x)));
        let v_scale_0 = f64::from(VTH_MAX) / (vth_max + 1.0);
        v_scale = vec![v_scale_0; n];
        vth_r = round_with(&vth_f, &v_scale);
        let b_s: Vec<f64> = v_infactor.iter().map(|&vi| v_scale_0 * vi).collect();
        bias_r = round_with(&bias_f, &b_s);
        w_scale = u_infactor
            .iter()
            .zip(&v_infactor)
            .map(|(&ui, &vi)| v_scale_0 * vi * ui / SynapseFmt::weight_scale(wgt_exp))
            .collect();
    }

    // re-encode threshold and bias through their hardware fields
    let vth_i: Vec<i32> = vth_r
        .iter()
        .map(|&v| {
            let (man, exp) = vth_to_manexp(v);
            man << exp
        })
        .collect();
    group.vth.freeze(vth_i);

    let bias_i: Vec<i32> = bias_r
        .iter()
        .map(|&b| {
            let (man, exp) = bias_to_manexp(b);
            man * (1 << exp)
        })
        .collect();
    group.bias.freeze(bias_i);

    // per-bank weight discretization
    for (i, syn) in group.synapses.iter_mut().enumerate() {
        let (wgt_exp2, d_wgt_exp) = if w_maxs[i] > BANK_EPSILON {
            let d = (w_max / w_maxs[i]).log2().floor() as i32;
            debug_assert!(d >= 0);
            ((wgt_exp - d).max(WGT_EXP_MIN), d)
        } else {
            (WGT_EXP_MIN, wgt_exp - WGT_EXP_MIN)
        };

        let mut fmt = *syn.fmt().ok_or_else(|| {
            CoreError::discretization(format!("synapse bank {} has no format", i))
        })?;
        fmt.wgt_exp = wgt_exp2 as i8;

        let factor = 2f64.powi(d_wgt_exp);
        for (row, idxs) in syn.weights.iter_mut().zip(&syn.indices) {
            let scaled: Vec<f64> = match row {
                NumericArray::Float(ws) => ws
                    .iter()
                    .zip(idxs)
                    .map(|(&w, &ix)| f64::from(w) * w_scale[ix as usize] * factor)
                    .collect(),
                NumericArray::Int(_) => return Err(frozen()),
            };
            row.freeze(fmt.discretize_weights(&scaled));
        }

        if syn.is_tracing() {
            fmt.wgt_exp = TRACING_WGT_EXP as i8;
        }
        syn.fmt = Some(fmt);
    }

    // noise exponent in chip units
    let v_scale_0 = v_scale[0];
    debug_assert!(v_scale
        .iter()
        .all(|&v| (v - v_scale_0).abs() <= v_scale_0.abs() * 1e-9));
    let noise_exp = (10f64.powf(group.noise_exp0) * v_scale_0).log2().round();
    if noise_exp < 0.0 {
        log::warn!("Noise amplitude falls below lower limit");
    }
    if noise_exp > 23.0 {
        log::warn!("Noise amplitude exceeds upper limit ({} > 23)", noise_exp);
    }
    group.noise_exp0 = noise_exp.clamp(0.0, 23.0);
    group.noise_mant_offset0 = (2.0 * group.noise_mant_offset0).round();

    // keep voltage probes in user units
    for probe in &mut group.probes {
        if probe.key == ProbeKey::V {
            if let Some(weights) = &mut probe.weights {
                for row in weights {
                    for x in row {
                        *x /= v_scale_0 as f32;
                    }
                }
            }
        }
    }

    Ok(())
}
