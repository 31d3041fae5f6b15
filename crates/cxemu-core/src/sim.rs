//! The step kernel
//!
//! `StepKernel` advances a built (and usually discretized) model in
//! fixed ticks, reproducing the chip's arithmetic: per-bank spike
//! accumulation, two cascaded first-order filters, thresholding with
//! refractory handling, bounded-range noise, and probe capture. The
//! kernel borrows the model for the lifetime of the run and owns all
//! runtime state.

use std::collections::HashMap;
use std::ops::Range;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::array::NumericArray;
use crate::error::{CoreError, Result};
use crate::group::{Location, NoiseTarget};
use crate::model::{GroupHandle, InputHandle, Model};
use crate::probe::{Lowpass, ProbeHandle, ProbeKey};
use crate::synapse::TargetInds;

/// Signed bit budget of the dendrite accumulator.
pub const Q_BITS: u32 = 21;

/// Signed bit budget of the filtered current and its biased input.
pub const U_BITS: u32 = 23;

/// Depth of the dendrite delay queue.
pub const MAX_DELAY: usize = 1;

/// Numeric mode the kernel runs in, decided by the model's arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericMode {
    /// Build-time floating-point dynamics
    Float,
    /// Chip-faithful integer dynamics
    Int,
}

/// Flattened per-compartment parameters and state, one variant per mode.
#[derive(Debug)]
enum SimState {
    Float {
        q: Vec<Vec<f32>>,
        u: Vec<f32>,
        v: Vec<f32>,
        decay_u: Vec<f32>,
        decay_v: Vec<f32>,
        scale_u: Vec<f32>,
        scale_v: Vec<f32>,
        vth: Vec<f32>,
        bias: Vec<f32>,
        vmin: Vec<f32>,
        vmax: Vec<f32>,
    },
    Int {
        q: Vec<Vec<i64>>,
        u: Vec<i64>,
        v: Vec<i64>,
        decay_u: Vec<i64>,
        decay_v: Vec<i64>,
        vth: Vec<i64>,
        bias: Vec<i64>,
        vmin: Vec<i64>,
        vmax: Vec<i64>,
    },
}

#[derive(Debug)]
enum ProbeSource {
    /// Absolute state range for a group probe, slice already applied
    Group(Range<usize>),
    /// Input position; the probe slice applies to the spike row
    Input(usize, Range<usize>),
}

#[derive(Debug)]
struct ProbeRt {
    key: ProbeKey,
    source: ProbeSource,
    raw: Vec<Vec<f32>>,
    weights: Option<Vec<Vec<f32>>>,
    tau: Option<f64>,
    filter: Option<Lowpass>,
    cursor: usize,
    processed: Vec<Vec<f32>>,
}

/// Numerical simulation of chip behaviour over a built model.
#[derive(Debug)]
pub struct StepKernel<'m> {
    model: &'m Model,
    seed: u64,
    rng: StdRng,
    t: usize,
    strict: bool,
    closed: bool,
    overflow_warned: bool,
    mode: NumericMode,

    n_cx: usize,
    order: Vec<usize>,
    slices: Vec<Range<usize>>,
    cx_slice: Range<usize>,
    cpu_slice: Range<usize>,

    bank_of: Vec<Vec<usize>>,
    group_axon_banks: Vec<Vec<usize>>,
    input_axon_banks: Vec<Vec<usize>>,
    a_in: Vec<Vec<i32>>,
    z: Vec<Vec<f64>>,

    input_spikes: Vec<Vec<Vec<bool>>>,

    state: SimState,
    s: Vec<bool>,
    c: Vec<i32>,
    w: Vec<i32>,
    refract: Vec<i32>,

    noise_enable: Vec<bool>,
    noise_exp: Vec<f64>,
    noise_mant: Vec<f64>,
    noise_at_membrane: Vec<bool>,

    probes: Vec<ProbeRt>,
    probe_index: HashMap<ProbeHandle, usize>,
}

impl<'m> StepKernel<'m> {
    pub(crate) fn build(model: &'m Model, seed: Option<u64>) -> Result<Self> {
        if model.groups.is_empty() {
            return Err(CoreError::invalid_parameter(
                "model",
                "no groups",
                "at least one compartment group",
            ));
        }

        let seed = seed.unwrap_or_else(rand::random);
        log::debug!("StepKernel seed: {}", seed);
        let rng = StdRng::seed_from_u64(seed);

        // host-located groups go to the tail, otherwise insertion order
        let mut order: Vec<usize> = (0..model.groups.len()).collect();
        order.sort_by_key(|&g| model.groups[g].location == Location::Host);

        let mut slices = vec![0..0; model.groups.len()];
        let mut first_host = None;
        let mut i0 = 0;
        for &g in &order {
            let group = &model.groups[g];
            if group.location == Location::Host && first_host.is_none() {
                first_host = Some(i0);
            }
            slices[g] = i0..i0 + group.n;
            i0 += group.n;
        }
        let n_cx = i0;
        let cx_end = first_host.unwrap_or(n_cx);
        let cx_slice = 0..cx_end;
        let cpu_slice = cx_end..n_cx;

        let mode = if model.groups[order[0]].vth.is_int() {
            NumericMode::Int
        } else {
            NumericMode::Float
        };
        log::debug!("StepKernel numeric mode: {:?}", mode);
        let want_int = mode == NumericMode::Int;
        for group in &model.groups {
            let uniform = group.vth.is_int() == want_int
                && group.bias.is_int() == want_int
                && group.decay_u.is_int() == want_int
                && group.decay_v.is_int() == want_int;
            if !uniform {
                return Err(CoreError::invalid_parameter(
                    "model",
                    "mixed numeric modes",
                    "all groups discretized, or none",
                ));
            }
            if want_int && (group.scale_u || group.scale_v) {
                return Err(CoreError::invalid_parameter(
                    "model",
                    "scaled input in integer mode",
                    "scale_u and scale_v cleared by discretize",
                ));
            }
        }

        // enumerate banks in simulation order
        let mut bank_of = vec![Vec::new(); model.groups.len()];
        let mut a_in = Vec::new();
        let mut z = Vec::new();
        for &g in &order {
            let group = &model.groups[g];
            for syn in &group.synapses {
                if syn.weights.len() != syn.n_axons() {
                    return Err(CoreError::invalid_parameter(
                        "synapses",
                        format!("{} weight rows for {} axons", syn.weights.len(), syn.n_axons()),
                        "weights set before simulation",
                    ));
                }
                for row in &syn.weights {
                    if row.is_int() != want_int {
                        return Err(CoreError::invalid_parameter(
                            "synapses",
                            "weight rows in the wrong numeric mode",
                            "weights matching the model's arrays",
                        ));
                    }
                }
                bank_of[g].push(a_in.len());
                a_in.push(vec![0i32; syn.n_axons()]);
                z.push(if syn.is_tracing() {
                    vec![0.0; syn.n_axons()]
                } else {
                    Vec::new()
                });
            }
        }

        let resolve_axon = |source_n: usize,
                            target: crate::synapse::SynapsesRef,
                            target_inds: &TargetInds|
         -> Result<usize> {
            let group = model
                .groups
                .get(target.group)
                .ok_or_else(|| CoreError::unknown_handle(format!("group {}", target.group)))?;
            let syn = group.synapses.get(target.bank).ok_or_else(|| {
                CoreError::unknown_handle(format!("bank {} in group {}", target.bank, target.group))
            })?;
            match target_inds {
                TargetInds::Full => {
                    if syn.n_axons() != source_n {
                        return Err(CoreError::invalid_parameter(
                            "axons",
                            format!("{} source lines onto {} inputs", source_n, syn.n_axons()),
                            "matching sizes for a full fan-out",
                        ));
                    }
                }
                TargetInds::Map(map) => {
                    if map.len() != source_n {
                        return Err(CoreError::invalid_parameter(
                            "axons",
                            format!("{} target indices for {} source lines", map.len(), source_n),
                            "one target index per source line",
                        ));
                    }
                    if let Some(&bad) = map.iter().find(|&&m| m as usize >= syn.n_axons()) {
                        return Err(CoreError::invalid_parameter(
                            "axons",
                            bad.to_string(),
                            format!("< {} target inputs", syn.n_axons()),
                        ));
                    }
                }
            }
            Ok(bank_of[target.group][target.bank])
        };

        let mut group_axon_banks = vec![Vec::new(); model.groups.len()];
        for (g, group) in model.groups.iter().enumerate() {
            for axon in &group.axons {
                group_axon_banks[g].push(resolve_axon(group.n, axon.target, &axon.target_inds)?);
            }
        }
        let mut input_axon_banks = vec![Vec::new(); model.inputs.len()];
        for (ii, input) in model.inputs.iter().enumerate() {
            for axon in &input.axons {
                input_axon_banks[ii].push(resolve_axon(input.n(), axon.target, &axon.target_inds)?);
            }
        }

        // flatten per-compartment parameters in simulation order
        let state = match mode {
            NumericMode::Float => {
                let mut decay_u = Vec::with_capacity(n_cx);
                let mut decay_v = Vec::with_capacity(n_cx);
                let mut scale_u = Vec::with_capacity(n_cx);
                let mut scale_v = Vec::with_capacity(n_cx);
                let mut vth = Vec::with_capacity(n_cx);
                let mut bias = Vec::with_capacity(n_cx);
                let mut vmin = Vec::with_capacity(n_cx);
                let mut vmax = Vec::with_capacity(n_cx);
                for &g in &order {
                    let group = &model.groups[g];
                    let du = group.decay_u.as_float().unwrap_or(&[]);
                    let dv = group.decay_v.as_float().unwrap_or(&[]);
                    decay_u.extend_from_slice(du);
                    decay_v.extend_from_slice(dv);
                    scale_u.extend(du.iter().map(|&d| if group.scale_u { d } else { 1.0 }));
                    scale_v.extend(dv.iter().map(|&d| if group.scale_v { d } else { 1.0 }));
                    vth.extend_from_slice(group.vth.as_float().unwrap_or(&[]));
                    bias.extend_from_slice(group.bias.as_float().unwrap_or(&[]));
                    vmin.extend(std::iter::repeat(group.vmin as f32).take(group.n));
                    vmax.extend(std::iter::repeat(group.vmax as f32).take(group.n));
                }
                SimState::Float {
                    q: vec![vec![0.0; n_cx]; MAX_DELAY],
                    u: vec![0.0; n_cx],
                    v: vec![0.0; n_cx],
                    decay_u,
                    decay_v,
                    scale_u,
                    scale_v,
                    vth,
                    bias,
                    vmin,
                    vmax,
                }
            }
            NumericMode::Int => {
                let mut decay_u = Vec::with_capacity(n_cx);
                let mut decay_v = Vec::with_capacity(n_cx);
                let mut vth = Vec::with_capacity(n_cx);
                let mut bias = Vec::with_capacity(n_cx);
                let mut vmin = Vec::with_capacity(n_cx);
                let mut vmax = Vec::with_capacity(n_cx);
                for &g in &order {
                    let group = &model.groups[g];
                    decay_u.extend(group.decay_u.as_int().unwrap_or(&[]).iter().map(|&x| i64::from(x)));
                    decay_v.extend(group.decay_v.as_int().unwrap_or(&[]).iter().map(|&x| i64::from(x)));
                    vth.extend(group.vth.as_int().unwrap_or(&[]).iter().map(|&x| i64::from(x)));
                    bias.extend(group.bias.as_int().unwrap_or(&[]).iter().map(|&x| i64::from(x)));
                    vmin.extend(std::iter::repeat(group.vmin as i64).take(group.n));
                    vmax.extend(std::iter::repeat(group.vmax as i64).take(group.n));
                }
                SimState::Int {
                    q: vec![vec![0; n_cx]; MAX_DELAY],
                    u: vec![0; n_cx],
                    v: vec![0; n_cx],
                    decay_u,
                    decay_v,
                    vth,
                    bias,
                    vmin,
                    vmax,
                }
            }
        };

        let mut refract = Vec::with_capacity(n_cx);
        let mut noise_enable = Vec::with_capacity(n_cx);
        let mut noise_exp = Vec::with_capacity(n_cx);
        let mut noise_mant = Vec::with_capacity(n_cx);
        let mut noise_at_membrane = Vec::with_capacity(n_cx);
        for &g in &order {
            let group = &model.groups[g];
            refract.extend_from_slice(&group.refract_delay);
            noise_enable.extend_from_slice(&group.enable_noise);
            noise_exp.extend(std::iter::repeat(group.noise_exp0).take(group.n));
            noise_mant.extend(std::iter::repeat(group.noise_mant_offset0).take(group.n));
            noise_at_membrane.extend(
                std::iter::repeat(group.noise_target == NoiseTarget::Membrane).take(group.n),
            );
        }

        // register probes: inputs first, then groups in simulation order
        let mut probes = Vec::new();
        let mut probe_index = HashMap::new();
        for (ii, input) in model.inputs.iter().enumerate() {
            for (pi, probe) in input.probes.iter().enumerate() {
                match probe.key {
                    ProbeKey::Spiked | ProbeKey::SpikeRate => {}
                    key => {
                        return Err(CoreError::BadProbeKey {
                            key: key.name(),
                            target: format!("spike input {}", ii),
                        })
                    }
                }
                let slice = probe.resolve_slice(input.n())?;
                validate_probe_weights(probe.weights.as_ref(), slice.len())?;
                probe_index.insert(ProbeHandle::Input { input: ii, probe: pi }, probes.len());
                probes.push(ProbeRt {
                    key: probe.key,
                    source: ProbeSource::Input(ii, slice),
                    raw: Vec::new(),
                    weights: probe.weights.clone(),
                    tau: probe.synapse,
                    filter: None,
                    cursor: 0,
                    processed: Vec::new(),
                });
            }
        }
        for &g in &order {
            let group = &model.groups[g];
            for (pi, probe) in group.probes.iter().enumerate() {
                let slice = probe.resolve_slice(group.n)?;
                validate_probe_weights(probe.weights.as_ref(), slice.len())?;
                let start = slices[g].start;
                probe_index.insert(ProbeHandle::Group { group: g, probe: pi }, probes.len());
                probes.push(ProbeRt {
                    key: probe.key,
                    source: ProbeSource::Group(start + slice.start..start + slice.end),
                    raw: Vec::new(),
                    weights: probe.weights.clone(),
                    tau: probe.synapse,
                    filter: None,
                    cursor: 0,
                    processed: Vec::new(),
                });
            }
        }

        Ok(Self {
            model,
            seed,
            rng,
            t: 0,
            strict: true,
            closed: false,
            overflow_warned: false,
            mode,
            n_cx,
            order,
            slices,
            cx_slice,
            cpu_slice,
            bank_of,
            group_axon_banks,
            input_axon_banks,
            a_in,
            z,
            input_spikes: model.inputs.iter().map(|i| i.spikes.clone()).collect(),
            state,
            s: vec![false; n_cx],
            c: vec![0; n_cx],
            w: vec![0; n_cx],
            refract,
            noise_enable,
            noise_exp,
            noise_mant,
            noise_at_membrane,
            probes,
            probe_index,
        })
    }

    /// The RNG seed this kernel runs with.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Ticks stepped so far.
    pub fn t(&self) -> usize {
        self.t
    }

    /// Numeric mode the kernel runs in.
    pub fn mode(&self) -> NumericMode {
        self.mode
    }

    /// Total number of compartments.
    pub fn n_compartments(&self) -> usize {
        self.n_cx
    }

    /// Whether arithmetic range violations abort the run.
    pub fn strict(&self) -> bool {
        self.strict
    }

    /// Toggle strict arithmetic; lenient mode warns once and clamps.
    pub fn set_strict(&mut self, strict: bool) {
        if !strict {
            log::warn!("strict arithmetic disabled; overflow will clamp");
        }
        self.strict = strict;
    }

    /// Close the kernel; further stepping is a usage error.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// The state range covering a group's compartments.
    pub fn group_slice(&self, handle: GroupHandle) -> Result<Range<usize>> {
        self.slices
            .get(handle.0)
            .cloned()
            .ok_or_else(|| CoreError::unknown_handle(format!("group {}", handle.0)))
    }

    /// The spike bitmap from the last tick.
    pub fn spiked(&self) -> &[bool] {
        &self.s
    }

    /// Per-compartment spike counters.
    pub fn spike_counts(&self) -> &[i32] {
        &self.c
    }

    /// Per-compartment refractory counters.
    pub fn refract_counters(&self) -> &[i32] {
        &self.w
    }

    /// Membrane voltages as f64, whichever mode the kernel runs in.
    pub fn voltages(&self) -> Vec<f64> {
        match &self.state {
            SimState::Float { v, .. } => v.iter().map(|&x| f64::from(x)).collect(),
            SimState::Int { v, .. } => v.iter().map(|&x| x as f64).collect(),
        }
    }

    /// Synaptic currents as f64, whichever mode the kernel runs in.
    pub fn currents(&self) -> Vec<f64> {
        match &self.state {
            SimState::Float { u, .. } => u.iter().map(|&x| f64::from(x)).collect(),
            SimState::Int { u, .. } => u.iter().map(|&x| x as f64).collect(),
        }
    }

    /// Per-axon trace values of a tracing bank, or `None` for a bank
    /// without learning enabled.
    pub fn traces(&self, r: crate::synapse::SynapsesRef) -> Option<&[f64]> {
        let bank = *self.bank_of.get(r.group)?.get(r.bank)?;
        if self.z[bank].is_empty() {
            None
        } else {
            Some(&self.z[bank])
        }
    }

    /// Append spike rows to an input between ticks.
    ///
    /// This is the host-coupling hook: the kernel reads row `t` on tick
    /// `t`, so a driver may stream rows in as the run progresses.
    pub fn append_input_spikes(&mut self, handle: InputHandle, rows: Vec<Vec<bool>>) -> Result<()> {
        let input = self.model.input(handle)?;
        let spikes = &mut self.input_spikes[handle.0];
        for row in rows {
            if row.len() != input.n() {
                return Err(CoreError::invalid_parameter(
                    "spike row",
                    format!("{} lines", row.len()),
                    format!("{} lines", input.n()),
                ));
            }
            spikes.push(row);
        }
        Ok(())
    }

    /// Advance the network by `steps` ticks.
    pub fn run_steps(&mut self, steps: usize) -> Result<()> {
        log::debug!("running {} steps from tick {}", steps, self.t);
        for _ in 0..steps {
            self.step()?;
        }
        Ok(())
    }

    /// Advance the network by one tick.
    pub fn step(&mut self) -> Result<()> {
        if self.closed {
            return Err(CoreError::KernelClosed);
        }
        let model = self.model;
        let n_cx = self.n_cx;
        let tick = self.t;

        // advance the dendrite delay queue
        match &mut self.state {
            SimState::Float { q, .. } => {
                q.rotate_left(1);
                if let Some(newest) = q.last_mut() {
                    newest.fill(0.0);
                }
            }
            SimState::Int { q, .. } => {
                q.rotate_left(1);
                if let Some(newest) = q.last_mut() {
                    newest.fill(0);
                }
            }
        }

        // reset per-bank inputs
        for a in &mut self.a_in {
            a.fill(0);
        }

        // inject external spikes
        for (ii, input) in model.inputs.iter().enumerate() {
            if input.axons.is_empty() && input.probes.is_empty() {
                continue;
            }
            let rows = &self.input_spikes[ii];
            let row = rows.get(tick).ok_or(CoreError::SpikesExhausted {
                input: ii,
                tick,
                rows: rows.len(),
            })?;
            for (ai, axon) in input.axons.iter().enumerate() {
                let bank = self.input_axon_banks[ii][ai];
                match &axon.target_inds {
                    TargetInds::Full => {
                        for (j, &sp) in row.iter().enumerate() {
                            if sp {
                                self.a_in[bank][j] += 1;
                            }
                        }
                    }
                    TargetInds::Map(map) => {
                        for (j, &sp) in row.iter().enumerate() {
                            if sp {
                                self.a_in[bank][map[j] as usize] += 1;
                            }
                        }
                    }
                }
            }
        }

        // inject internal spikes; repeated target indices accumulate
        for &g in &self.order {
            let group = &model.groups[g];
            let src = self.slices[g].clone();
            for (ai, axon) in group.axons.iter().enumerate() {
                let bank = self.group_axon_banks[g][ai];
                match &axon.target_inds {
                    TargetInds::Full => {
                        for j in 0..group.n {
                            if self.s[src.start + j] {
                                self.a_in[bank][j] += 1;
                            }
                        }
                    }
                    TargetInds::Map(map) => {
                        for j in 0..group.n {
                            if self.s[src.start + j] {
                                self.a_in[bank][map[j] as usize] += 1;
                            }
                        }
                    }
                }
            }
        }

        // synaptic accumulation into the dendrite queue, plus traces
        for &g in &self.order {
            let group = &model.groups[g];
            let b_start = self.slices[g].start;
            for (bi, syn) in group.synapses.iter().enumerate() {
                let bank = self.bank_of[g][bi];
                for i in 0..syn.n_axons() {
                    let count = self.a_in[bank][i];
                    if count <= 0 {
                        continue;
                    }
                    let idxs = &syn.indices[i];
                    match (&mut self.state, &syn.weights[i]) {
                        (SimState::Float { q, .. }, NumericArray::Float(ws)) => {
                            for (&wv, &ix) in ws.iter().zip(idxs) {
                                q[0][b_start + ix as usize] += wv * count as f32;
                            }
                        }
                        (SimState::Int { q, .. }, NumericArray::Int(ws)) => {
                            for (&wv, &ix) in ws.iter().zip(idxs) {
                                q[0][b_start + ix as usize] +=
                                    i64::from(wv) * i64::from(count);
                            }
                        }
                        _ => {
                            return Err(CoreError::invalid_parameter(
                                "synapses",
                                "weight rows in the wrong numeric mode",
                                "weights matching the model's arrays",
                            ))
                        }
                    }
                }
                if let Some(trace) = syn.tracing() {
                    let decay = (-1.0 / f64::from(trace.tau.max(1))).exp();
                    let z = &mut self.z[bank];
                    for (zi, &a) in z.iter_mut().zip(&self.a_in[bank]) {
                        *zi = *zi * decay + f64::from(trace.mag) * f64::from(a);
                    }
                }
            }
        }

        // noise, drawn for every compartment so the stream is
        // independent of which compartments enable it
        let mut noise = vec![0.0f64; n_cx];
        match self.mode {
            NumericMode::Int => {
                for i in 0..n_cx {
                    let x = f64::from(self.rng.gen_range(-128..128));
                    if self.noise_enable[i] {
                        noise[i] = (x + 64.0 * self.noise_mant[i])
                            * 2f64.powi(self.noise_exp[i] as i32 - 7);
                    }
                }
            }
            NumericMode::Float => {
                for i in 0..n_cx {
                    let x = self.rng.gen_range(-1.0..1.0);
                    if self.noise_enable[i] {
                        noise[i] = (x + self.noise_mant[i]) * 10f64.powf(self.noise_exp[i]);
                    }
                }
            }
        }

        // the two cascaded filters, clamp, and threshold
        match &mut self.state {
            SimState::Float {
                q,
                u,
                v,
                decay_u,
                decay_v,
                scale_u,
                scale_v,
                vth,
                bias,
                vmin,
                vmax,
            } => {
                let q0 = &mut q[0];
                for i in 0..n_cx {
                    if !self.noise_at_membrane[i] {
                        q0[i] += noise[i] as f32;
                    }
                }
                let q0: &[f32] = q0;
                let decay_u: &[f32] = decay_u;
                let decay_v: &[f32] = decay_v;
                let scale_u: &[f32] = scale_u;
                let scale_v: &[f32] = scale_v;
                let vmin: &[f32] = vmin;
                let vmax: &[f32] = vmax;

                #[cfg(feature = "parallel")]
                u.par_iter_mut().enumerate().for_each(|(i, ui)| {
                    *ui = (1.0 - decay_u[i]) * *ui + scale_u[i] * q0[i];
                });
                #[cfg(not(feature = "parallel"))]
                for (i, ui) in u.iter_mut().enumerate() {
                    *ui = (1.0 - decay_u[i]) * *ui + scale_u[i] * q0[i];
                }

                let mut u2 = vec![0.0f32; n_cx];
                for i in 0..n_cx {
                    u2[i] = u[i] + bias[i];
                    if self.noise_at_membrane[i] {
                        u2[i] += noise[i] as f32;
                    }
                }
                let u2: &[f32] = &u2;

                #[cfg(feature = "parallel")]
                v.par_iter_mut().enumerate().for_each(|(i, vi)| {
                    *vi = ((1.0 - decay_v[i]) * *vi + scale_v[i] * u2[i])
                        .clamp(vmin[i], vmax[i]);
                });
                #[cfg(not(feature = "parallel"))]
                for (i, vi) in v.iter_mut().enumerate() {
                    *vi = ((1.0 - decay_v[i]) * *vi + scale_v[i] * u2[i])
                        .clamp(vmin[i], vmax[i]);
                }

                for i in 0..n_cx {
                    if self.w[i] > 0 {
                        v[i] = 0.0;
                    }
                    self.s[i] = v[i] > vth[i];
                }
                for i in self.cx_slice.clone() {
                    if self.s[i] {
                        v[i] = 0.0;
                    }
                }
                for i in self.cpu_slice.clone() {
                    if self.s[i] {
                        v[i] -= vth[i];
                    }
                }
            }
            SimState::Int {
                q,
                u,
                v,
                decay_u,
                decay_v,
                vth,
                bias,
                vmin,
                vmax,
            } => {
                let q0 = &mut q[0];
                for i in 0..n_cx {
                    if !self.noise_at_membrane[i] && noise[i] != 0.0 {
                        q0[i] = (q0[i] as f64 + noise[i]).trunc() as i64;
                    }
                }
                check_range(q0, Q_BITS, "q0", tick, self.strict, &mut self.overflow_warned)?;

                for i in 0..n_cx {
                    let r = 4096 - 1 - decay_u[i];
                    u[i] = u[i].signum() * ((u[i].abs() * r) >> 12) + q0[i];
                }
                check_range(u, U_BITS, "u", tick, self.strict, &mut self.overflow_warned)?;

                let mut u2 = vec![0i64; n_cx];
                for i in 0..n_cx {
                    u2[i] = u[i] + bias[i];
                    if self.noise_at_membrane[i] && noise[i] != 0.0 {
                        u2[i] = (u2[i] as f64 + noise[i]).trunc() as i64;
                    }
                }
                check_range(&mut u2, U_BITS, "u2", tick, self.strict, &mut self.overflow_warned)?;

                for i in 0..n_cx {
                    let r = 4096 - decay_v[i];
                    v[i] = (v[i].signum() * ((v[i].abs() * r) >> 12) + u2[i])
                        .clamp(vmin[i], vmax[i]);
                }

                for i in 0..n_cx {
                    if self.w[i] > 0 {
                        v[i] = 0;
                    }
                    self.s[i] = v[i] > vth[i];
                }
                for i in self.cx_slice.clone() {
                    if self.s[i] {
                        v[i] = 0;
                    }
                }
                for i in self.cpu_slice.clone() {
                    if self.s[i] {
                        v[i] -= vth[i];
                    }
                }
            }
        }

        // refractory and spike counters
        for i in 0..n_cx {
            if self.s[i] {
                self.w[i] = self.refract[i];
                self.c[i] += 1;
            }
            self.w[i] = (self.w[i] - 1).max(0);
        }

        self.record_probes();
        self.t += 1;
        Ok(())
    }

    fn record_probes(&mut self) {
        let tick = self.t;
        for probe in &mut self.probes {
            let row: Vec<f32> = match &probe.source {
                ProbeSource::Input(ii, slice) => {
                    let spikes = &self.input_spikes[*ii][tick];
                    spikes[slice.clone()]
                        .iter()
                        .map(|&sp| if sp { 1.0 } else { 0.0 })
                        .collect()
                }
                ProbeSource::Group(range) => match (&self.state, probe.key) {
                    (SimState::Float { u, .. }, ProbeKey::U) => u[range.clone()].to_vec(),
                    (SimState::Float { v, .. }, ProbeKey::V) => v[range.clone()].to_vec(),
                    (SimState::Float { u, vth, .. }, ProbeKey::X) => u[range.clone()]
                        .iter()
                        .zip(&vth[range.clone()])
                        .map(|(&ui, &vt)| ui / vt)
                        .collect(),
                    (SimState::Int { u, .. }, ProbeKey::U) => {
                        u[range.clone()].iter().map(|&x| x as f32).collect()
                    }
                    (SimState::Int { v, .. }, ProbeKey::V) => {
                        v[range.clone()].iter().map(|&x| x as f32).collect()
                    }
                    (SimState::Int { u, vth, .. }, ProbeKey::X) => u[range.clone()]
                        .iter()
                        .zip(&vth[range.clone()])
                        .map(|(&ui, &vt)| (ui as f64 / vt as f64) as f32)
                        .collect(),
                    (_, ProbeKey::Spiked) | (_, ProbeKey::SpikeRate) => self.s[range.clone()]
                        .iter()
                        .map(|&sp| if sp { 1.0 } else { 0.0 })
                        .collect(),
                },
            };
            probe.raw.push(row);
        }
    }

    /// Read a probe's accumulated output as `[T][d]` float samples.
    ///
    /// Decoding weights and the optional first-order filter apply
    /// lazily; already-returned samples are cached and returned again
    /// unchanged, with filter state persisting across reads.
    pub fn get_probe_output(&mut self, handle: ProbeHandle) -> Result<Vec<Vec<f32>>> {
        let idx = *self
            .probe_index
            .get(&handle)
            .ok_or_else(|| CoreError::unknown_handle("probe".to_string()))?;
        let dt = self.model.dt();
        let probe = &mut self.probes[idx];

        while probe.cursor < probe.raw.len() {
            let mut row = probe.raw[probe.cursor].clone();
            if probe.key == ProbeKey::SpikeRate {
                for x in &mut row {
                    *x /= dt as f32;
                }
            }
            if let Some(wm) = &probe.weights {
                let cols = wm.first().map(Vec::len).unwrap_or(0);
                let mut decoded = vec![0.0f32; cols];
                for (&xi, wrow) in row.iter().zip(wm) {
                    for (out, &wv) in decoded.iter_mut().zip(wrow) {
                        *out += xi * wv;
                    }
                }
                row = decoded;
            }
            if let Some(tau) = probe.tau {
                let dim = row.len();
                let filter = probe
                    .filter
                    .get_or_insert_with(|| Lowpass::new(tau, dt, dim));
                filter.filter_row(&mut row);
            }
            probe.processed.push(row);
            probe.cursor += 1;
        }
        Ok(probe.processed.clone())
    }
}

fn validate_probe_weights(weights: Option<&Vec<Vec<f32>>>, n_probed: usize) -> Result<()> {
    if let Some(wm) = weights {
        if wm.len() != n_probed {
            return Err(CoreError::invalid_parameter(
                "probe weights",
                format!("{} rows", wm.len()),
                format!("{} rows (one per probed compartment)", n_probed),
            ));
        }
        let cols = wm.first().map(Vec::len).unwrap_or(0);
        if wm.iter().any(|row| row.len() != cols) {
            return Err(CoreError::invalid_parameter(
                "probe weights",
                "ragged rows".to_string(),
                "a dense matrix",
            ));
        }
    }
    Ok(())
}

fn check_range(
    values: &mut [i64],
    bits: u32,
    field: &'static str,
    tick: usize,
    strict: bool,
    warned: &mut bool,
) -> Result<()> {
    let lo = -(1i64 << (bits - 1));
    let hi = (1i64 << (bits - 1)) - 1;
    if values.iter().all(|&x| (lo..=hi).contains(&x)) {
        return Ok(());
    }
    if strict {
        return Err(CoreError::Overflow { tick, field, bits });
    }
    if !*warned {
        log::warn!(
            "{} left its signed {}-bit range at tick {}; clamping",
            field,
            bits,
            tick
        );
        *warned = true;
    }
    for x in values.iter_mut() {
        *x = (*x).clamp(lo, hi);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{Group, LifConfig, ReluConfig};
    use crate::input::SpikeInput;
    use crate::model::Model;
    use crate::probe::Probe;
    use crate::synapse::{Axons, Synapses};

    fn relu_model(n: usize) -> (Model, GroupHandle) {
        let mut model = Model::new();
        let mut group = Group::new(n);
        group.configure_relu(&ReluConfig::default()).unwrap();
        let g = model.add_group(group).unwrap();
        (model, g)
    }

    #[test]
    fn test_build_requires_groups() {
        let model = Model::new();
        assert!(model.get_simulator(Some(1)).is_err());
    }

    #[test]
    fn test_float_mode_before_discretize() {
        let (model, _) = relu_model(3);
        let kernel = model.get_simulator(Some(1)).unwrap();
        assert_eq!(kernel.mode(), NumericMode::Float);
        assert_eq!(kernel.n_compartments(), 3);
    }

    #[test]
    fn test_int_mode_after_discretize() {
        let (mut model, _) = relu_model(3);
        model.discretize().unwrap();
        let kernel = model.get_simulator(Some(1)).unwrap();
        assert_eq!(kernel.mode(), NumericMode::Int);
    }

    #[test]
    fn test_host_groups_sort_to_tail() {
        let mut model = Model::new();
        let mut host = Group::new(2).with_location(crate::group::Location::Host);
        host.configure_relu(&ReluConfig::default()).unwrap();
        let h = model.add_group(host).unwrap();
        let mut core = Group::new(3);
        core.configure_relu(&ReluConfig::default()).unwrap();
        let c = model.add_group(core).unwrap();

        let kernel = model.get_simulator(Some(1)).unwrap();
        assert_eq!(kernel.group_slice(c).unwrap(), 0..3);
        assert_eq!(kernel.group_slice(h).unwrap(), 3..5);
        assert_eq!(kernel.cx_slice, 0..3);
        assert_eq!(kernel.cpu_slice, 3..5);
    }

    #[test]
    fn test_bias_drives_relu_spikes() {
        let (mut model, g) = relu_model(1);
        model.group_mut(g).unwrap().set_bias(&[2.0]).unwrap();
        let mut kernel = model.get_simulator(Some(1)).unwrap();
        kernel.step().unwrap();
        // u = bias, v integrates past vth = 1 on the first tick
        assert!(kernel.spiked()[0]);
        assert_eq!(kernel.spike_counts()[0], 1);
        // core compartment voltage resets to zero
        assert_eq!(kernel.voltages()[0], 0.0);
    }

    #[test]
    fn test_host_compartment_keeps_overshoot() {
        let mut model = Model::new();
        let mut group = Group::new(1).with_location(crate::group::Location::Host);
        group.configure_relu(&ReluConfig::default()).unwrap();
        group.set_bias(&[2.5]).unwrap();
        model.add_group(group).unwrap();

        let mut kernel = model.get_simulator(Some(1)).unwrap();
        kernel.step().unwrap();
        assert!(kernel.spiked()[0]);
        // v = 2.5 crossed vth = 1.0, overshoot preserved
        let v = kernel.voltages()[0];
        assert!((v - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_spike_input_chain() {
        let (mut model, g) = relu_model(2);
        let mut syn = Synapses::new(2);
        syn.set_diagonal_weights(&[2.0, 2.0]).unwrap();
        let bank = model.add_synapses(g, syn, None).unwrap();

        let mut input = SpikeInput::new(2);
        input.push_rows(vec![vec![true, false], vec![false, false]]).unwrap();
        input.add_axons(Axons::new(2, bank)).unwrap();
        model.add_input(input).unwrap();

        let mut kernel = model.get_simulator(Some(1)).unwrap();
        kernel.step().unwrap();
        assert_eq!(kernel.spiked(), &[true, false]);
        kernel.step().unwrap();
        assert_eq!(kernel.spiked(), &[false, false]);
    }

    #[test]
    fn test_spike_matrix_exhaustion() {
        let (mut model, g) = relu_model(1);
        let mut syn = Synapses::new(1);
        syn.set_diagonal_weights(&[1.0]).unwrap();
        let bank = model.add_synapses(g, syn, None).unwrap();

        let mut input = SpikeInput::new(1);
        input.push_row(vec![false]).unwrap();
        input.add_axons(Axons::new(1, bank)).unwrap();
        let ih = model.add_input(input).unwrap();

        let mut kernel = model.get_simulator(Some(1)).unwrap();
        kernel.step().unwrap();
        assert!(matches!(
            kernel.step(),
            Err(CoreError::SpikesExhausted { tick: 1, .. })
        ));

        // appending rows un-sticks the kernel
        kernel.append_input_spikes(ih, vec![vec![true]]).unwrap();
        kernel.step().unwrap();
        assert_eq!(kernel.t(), 2);
    }

    #[test]
    fn test_duplicate_target_inds_accumulate() {
        let (mut model, g) = relu_model(2);
        let mut syn = Synapses::new(2);
        syn.set_diagonal_weights(&[0.6, 0.6]).unwrap();
        let bank = model.add_synapses(g, syn, None).unwrap();

        // both source lines land on input line 0
        let mut input = SpikeInput::new(2);
        input.push_row(vec![true, true]).unwrap();
        input
            .add_axons(Axons::new(2, bank).with_target_inds(vec![0, 0]))
            .unwrap();
        model.add_input(input).unwrap();

        let mut kernel = model.get_simulator(Some(1)).unwrap();
        kernel.step().unwrap();
        // two accumulated spikes * 0.6 = 1.2 crosses vth on line 0 only
        assert_eq!(kernel.spiked(), &[true, false]);
    }

    #[test]
    fn test_tracing_bank_accumulates_and_decays() {
        let (mut model, g) = relu_model(2);
        let mut syn = Synapses::new(2);
        syn.set_diagonal_weights(&[0.1, 0.1]).unwrap();
        syn.set_learning(2, 1.0).unwrap();
        let bank = model.add_synapses(g, syn, None).unwrap();

        let mut input = SpikeInput::new(2);
        input
            .push_rows(vec![vec![true, false], vec![false, false]])
            .unwrap();
        input.add_axons(Axons::new(2, bank)).unwrap();
        model.add_input(input).unwrap();

        let mut kernel = model.get_simulator(Some(1)).unwrap();
        kernel.step().unwrap();
        let z_after_spike = kernel.traces(bank).unwrap().to_vec();
        assert!((z_after_spike[0] - 1.0).abs() < 1e-9);
        assert_eq!(z_after_spike[1], 0.0);

        kernel.step().unwrap();
        let z_decayed = kernel.traces(bank).unwrap();
        let expected = (-0.5f64).exp();
        assert!((z_decayed[0] - expected).abs() < 1e-9);
    }

    #[test]
    fn test_closed_kernel_refuses_step() {
        let (model, _) = relu_model(1);
        let mut kernel = model.get_simulator(Some(1)).unwrap();
        kernel.close();
        assert!(matches!(kernel.step(), Err(CoreError::KernelClosed)));
    }

    #[test]
    fn test_strict_overflow_aborts_int_run() {
        let mut model = Model::new();
        let mut group = Group::new(1);
        group.configure_relu(&ReluConfig::default()).unwrap();
        group.configure_filter(0.1, 0.001).unwrap();
        let g = model.add_group(group).unwrap();

        let n_axons = 512;
        let mut syn = Synapses::new(n_axons);
        syn.set_full_weights(vec![vec![1.0]; n_axons]).unwrap();
        let bank = model.add_synapses(g, syn, None).unwrap();

        let nt = 20;
        let mut input = SpikeInput::new(n_axons);
        input.push_rows(vec![vec![true; n_axons]; nt]).unwrap();
        input.add_axons(Axons::new(n_axons, bank)).unwrap();
        model.add_input(input).unwrap();
        model.discretize().unwrap();

        let mut strict = model.get_simulator(Some(1)).unwrap();
        let err = strict.run_steps(nt);
        assert!(matches!(err, Err(CoreError::Overflow { .. })));

        let mut lenient = model.get_simulator(Some(1)).unwrap();
        lenient.set_strict(false);
        lenient.run_steps(nt).unwrap();
        // clamped, not wrapped: current stays within its bit budget
        let hi = f64::from(1u32 << (U_BITS - 1));
        assert!(lenient.currents().iter().all(|&u| u.abs() <= hi));
    }

    #[test]
    fn test_refractory_state_machine() {
        let mut model = Model::new();
        let mut group = Group::new(1);
        group
            .configure_lif(&LifConfig {
                tau_ref: 0.002,
                ..LifConfig::default()
            })
            .unwrap();
        // strong enough to cross threshold on the first unclamped tick
        group.set_bias(&[30.0]).unwrap();
        let g = model.add_group(group).unwrap();
        let refract = model.group(g).unwrap().refract_delay()[0];
        assert_eq!(refract, 3);

        let mut kernel = model.get_simulator(Some(1)).unwrap();
        let mut spike_ticks = Vec::new();
        for tick in 0..20 {
            kernel.step().unwrap();
            if kernel.spiked()[0] {
                spike_ticks.push(tick);
                assert_eq!(kernel.refract_counters()[0], refract - 1);
            }
            // counters never escape [0, refract]
            assert!((0..=refract).contains(&kernel.refract_counters()[0]));
        }
        // with this bias the compartment fires as soon as it may
        for pair in spike_ticks.windows(2) {
            assert_eq!(pair[1] - pair[0], refract as usize);
        }
    }

    #[test]
    fn test_probe_output_length_and_decode() {
        use crate::group::NonspikingConfig;

        let mut model = Model::new();
        let mut group = Group::new(2);
        group.configure_nonspiking(&NonspikingConfig::default()).unwrap();
        group.set_bias(&[0.25, 0.5]).unwrap();
        let g = model.add_group(group).unwrap();
        let pv = model
            .add_group_probe(g, Probe::new(ProbeKey::V))
            .unwrap();
        let pd = model
            .add_group_probe(
                g,
                Probe::new(ProbeKey::V).with_weights(vec![vec![1.0, 2.0], vec![1.0, 2.0]]),
            )
            .unwrap();

        let mut kernel = model.get_simulator(Some(1)).unwrap();
        kernel.run_steps(4).unwrap();

        let v_out = kernel.get_probe_output(pv).unwrap();
        assert_eq!(v_out.len(), 4);
        assert_eq!(v_out[0].len(), 2);
        // the pass-through voltage tracks the bias
        assert!((v_out[0][0] - 0.25).abs() < 1e-6);
        assert!((v_out[0][1] - 0.5).abs() < 1e-6);

        let d_out = kernel.get_probe_output(pd).unwrap();
        assert_eq!(d_out.len(), 4);
        assert_eq!(d_out[0].len(), 2);
        // decoded = [0.25 + 0.5, 2*0.25 + 2*0.5]
        assert!((d_out[0][0] - 0.75).abs() < 1e-6);
        assert!((d_out[0][1] - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_probe_output_incremental_reads() {
        use crate::group::NonspikingConfig;

        let mut model = Model::new();
        let mut group = Group::new(1);
        group.configure_nonspiking(&NonspikingConfig::default()).unwrap();
        group.set_bias(&[0.1]).unwrap();
        let g = model.add_group(group).unwrap();
        let p = model
            .add_group_probe(g, Probe::new(ProbeKey::V).with_filter(0.005))
            .unwrap();

        let mut kernel = model.get_simulator(Some(1)).unwrap();
        kernel.run_steps(3).unwrap();
        let first = kernel.get_probe_output(p).unwrap();
        kernel.run_steps(3).unwrap();
        let second = kernel.get_probe_output(p).unwrap();

        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 6);
        // already-returned samples are unchanged by the second read
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a, b);
        }
        // the filter keeps converging rather than restarting
        assert!(second[5][0] > second[2][0]);
    }

    #[test]
    fn test_spike_rate_probe_scales_by_dt() {
        let (mut model, g) = relu_model(1);
        model.group_mut(g).unwrap().set_bias(&[2.0]).unwrap();
        let p = model
            .add_group_probe(g, Probe::new(ProbeKey::SpikeRate))
            .unwrap();

        let mut kernel = model.get_simulator(Some(1)).unwrap();
        kernel.step().unwrap();
        let out = kernel.get_probe_output(p).unwrap();
        assert!((out[0][0] - 1000.0).abs() < 0.01); // 1/dt at dt = 1 ms
    }

    #[test]
    fn test_same_seed_same_noise_stream() {
        let mut model = Model::new();
        let mut group = Group::new(8);
        group.configure_relu(&ReluConfig::default()).unwrap();
        group.enable_noise_all();
        group.set_noise(-1.0, 0.0, NoiseTarget::Dendrite);
        let g = model.add_group(group).unwrap();
        let p = model.add_group_probe(g, Probe::new(ProbeKey::U)).unwrap();

        let mut k1 = model.get_simulator(Some(99)).unwrap();
        let mut k2 = model.get_simulator(Some(99)).unwrap();
        k1.run_steps(20).unwrap();
        k2.run_steps(20).unwrap();
        assert_eq!(
            k1.get_probe_output(p).unwrap(),
            k2.get_probe_output(p).unwrap()
        );

        let mut k3 = model.get_simulator(Some(100)).unwrap();
        k3.run_steps(20).unwrap();
        assert_ne!(
            k2.get_probe_output(p).unwrap(),
            k3.get_probe_output(p).unwrap()
        );
    }
}
