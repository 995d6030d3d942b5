//! 1:N mixing of a single source into a multi-track destination
//!
//! Every policy shares the same click-free gain ramp: for each destination
//! track the applied volume moves linearly from where the previous tick left
//! off to this tick's target, and the endpoint is cached for the next tick,
//! so amplitude never jumps at a tick boundary no matter how parameters
//! changed in between.

use crate::{
    emitter::Emitter,
    resample::{resample, INTERP_TAPS, MIN_FACTOR},
    spatial::{Placement, AXIS_BACK, AXIS_RIGHT, AXIS_UP},
    store::MixBuffer,
    Sample,
};

/// Output topology selecting the per-track mixing policy
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RenderMode {
    /// Left/right pan law with a shoulder, no time offsets
    Stereo,
    /// Per-speaker angular weight applied directly
    PureStereo,
    /// Single directional factor per track, cheapest positional path
    Spatial,
    /// Pan law plus up/down and back/front weights with one head-delay
    /// offset each
    Surround,
    /// Independent gain weight and head-delay offset on all three axes
    Hrtf,
}

/// What a mix call tells its caller about the source
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MixOutcome {
    /// Keep the source registered
    Continue,
    /// Nothing was written this tick but the source is still alive
    Silent,
    /// The source is done and can be deregistered
    Finished,
}

/// Pan shoulder: a source on the speaker's side of the listener plays at
/// full volume, fading only once it crosses to the opposite side.
/// cos(0.5 rad).
const PAN_SHOULDER: f32 = 0.8776;

/// Per-mixer staging storage, sized once at setup so a tick never allocates
pub(crate) struct Scratch {
    /// Source-rate window fetched from the sample store
    window: Vec<Sample>,
    /// Destination-rate resampled lane; index `lead` is the tick's first
    /// frame, earlier indices are lookahead history
    lane: Vec<Sample>,
    lead: usize,
}

impl Scratch {
    pub fn new(pre_delay: usize, capacity: usize) -> Self {
        let lane_len = pre_delay + capacity;
        Self {
            // Generous factor headroom; ticks clamp their window to this
            window: vec![0; 8 * lane_len + 2 * INTERP_TAPS],
            lane: vec![0; lane_len],
            lead: pre_delay,
        }
    }
}

/// Mix one emitter's current buffer into `dest`
///
/// Runs the full per-source chain: effective pitch, resampling into the
/// staging lane, effective gain, then the policy-specific ramped
/// accumulation into every destination track.
pub(crate) fn mix_emitter(
    dest: &mut MixBuffer,
    scratch: &mut Scratch,
    em: &mut Emitter,
    placement: &Placement,
    mode: RenderMode,
) -> MixOutcome {
    let store = em.store.clone();
    let sfreq = store.rate() as f32;
    let dfreq = dest.rate() as f32;
    let mut dduration = dest.duration();

    let pitch = em.pitch.effective(placement.pitch, em.stopped);

    // A pitch that rounds the tick's frame count to zero freezes the source
    // in place; the tick still consumes wall time so a stopping source can
    // run out
    if pitch < MIN_FACTOR {
        em.pos_sec += dduration as f64;
        if em.pos_sec > store.duration() as f64 {
            em.pos_sec = store.duration() as f64;
            em.playing = false;
            em.stopped = true;
        }
        return done_or_silent(em);
    }

    let src_loops = em.looping && !em.streaming;
    if em.pos_sec >= store.duration() as f64 && !src_loops {
        em.pos_sec = store.duration() as f64;
        em.playing = false;
        em.stopped = true;
        return done_or_silent(em);
    }

    let fact = (sfreq * pitch / dfreq).max(MIN_FACTOR);

    // Distance delay: a negative cursor counts down to the sound's arrival
    let mut dest_pos = 0usize;
    if em.pos_sec < 0.0 {
        let new_pos = em.pos_sec + (dduration * pitch) as f64;
        if new_pos < 0.0 {
            em.pos_sec = new_pos;
            return MixOutcome::Silent;
        }
        // Arrives mid-tick
        dest_pos = ((-em.pos_sec / pitch as f64) * dfreq as f64) as usize;
        dest_pos = dest_pos.min(dest.frames().saturating_sub(1));
        em.pos_sec = 0.0;
        dduration = (dest.frames() - dest_pos) as f32 / dfreq;
    }

    // Advance the cursor, wrapping loops and catching the streamed tail
    let eps = 1.1 / sfreq;
    let loop_start_sec = store.loop_start() as f32 / sfreq;
    let loop_end_sec = store.loop_end() as f32 / sfreq;
    let mut new_pos = em.pos_sec + (dduration * pitch) as f64;
    if new_pos >= (loop_end_sec - eps) as f64 && src_loops {
        em.loop_no += 1;
        if em.loop_max.is_some_and(|max| em.loop_no >= max) {
            em.looping = false;
        } else {
            let loop_len = (loop_end_sec - loop_start_sec).max(eps) as f64;
            new_pos -= loop_start_sec as f64;
            new_pos %= loop_len;
            new_pos += loop_start_sec as f64;
        }
    } else if new_pos >= (store.duration() - eps) as f64 && !src_loops {
        let dt = (store.duration() as f64 - em.pos_sec) as f32 / pitch;
        if dt < 1.1 / dfreq {
            em.playing = false;
            em.stopped = true;
            return done_or_silent(em);
        }
        // Final sliver: mix it, then ramp out below
        em.stopped = true;
        new_pos = store.duration() as f64;
        dduration = dt;
    }

    let dno = ((dduration * dfreq).round() as usize)
        .min(dest.frames().saturating_sub(dest_pos))
        .max(1);

    // Fetch a source window and resample it into the staging lane,
    // lookahead included
    let src_cursor = em.pos_sec * sfreq as f64;
    let src_frame = src_cursor.floor() as isize;
    let smu = (src_cursor - src_cursor.floor()) as f32;
    let mut lead_src = (scratch.lead as f32 * fact).ceil() as usize;
    let mut need = lead_src + ((dno as f32 * fact).ceil() as usize) + INTERP_TAPS;
    if need > scratch.window.len() {
        log::debug!(
            "resample window clamped: need {need}, have {}",
            scratch.window.len()
        );
        lead_src = lead_src.min(scratch.window.len() / 2);
        need = scratch.window.len();
    }
    store.window(
        em.track.min(store.tracks() - 1),
        src_frame - lead_src as isize,
        src_loops,
        &mut scratch.window[..need],
    );
    let lane_len = (scratch.lead + dno).min(scratch.lane.len());
    resample(
        &mut scratch.lane[..lane_len],
        &scratch.window[..need],
        smu,
        fact,
    );
    em.pos_sec = new_pos;

    // Effective gain and end-of-life bookkeeping
    let lead = scratch.lead;
    let resampled = &scratch.lane[lead..lane_len];
    let mut outcome = MixOutcome::Continue;
    if !em.playing && em.stopped {
        outcome = MixOutcome::Finished;
    }
    let step = em.gain.effective(placement.gain, em.stopped, resampled);
    if outcome == MixOutcome::Continue && !step.env_active && em.stopped {
        // No envelope governs the release; let any distance delay drain
        em.delay_sec -= dest.duration();
        if em.delay_sec <= 0.0 {
            outcome = MixOutcome::Finished;
        }
    }
    if step.env_finished {
        outcome = MixOutcome::Finished;
    }
    let gain = sanitize(step.gain);

    // Automatic onset/release ramp: fade in on the first audible tick, fade
    // out on the tick that stops, unless a timed envelope already shapes it
    let mut svol = 1.0;
    let mut evol = 1.0;
    if !step.env_active && em.playing == em.stopped {
        svol = if em.stopped || dest_pos > 0 { 1.0 } else { 0.0 };
        evol = if em.stopped { 0.0 } else { 1.0 };
        em.playing = !em.stopped;
    }

    let tracks = dest.tracks();
    let pre = dest.pre_delay();
    for t in 0..tracks {
        let lane = dest.lane_mut(t);
        let dst = &mut lane[pre + dest_pos..pre + dest_pos + dno];
        match mode {
            RenderMode::Stereo | RenderMode::PureStereo | RenderMode::Spatial => {
                let dir = match mode {
                    RenderMode::Stereo => (PAN_SHOULDER + placement.pan[t]).clamp(0.0, 1.0),
                    _ => placement.pan[t].clamp(0.0, 1.0),
                };
                let vstart = dir * svol * em.prev_gain[t];
                let vend = dir * evol * gain;
                let vstep = (vend - vstart) / dno as f32;
                ramp_add(dst, &scratch.lane, lead, 0, vstart, vstep);
                em.prev_gain[t] = gain;
            }
            RenderMode::Surround => {
                let dir = (PAN_SHOULDER + placement.pan[t]).clamp(0.0, 1.0);
                let vstart = dir * svol * em.prev_gain[t];
                let vend = dir * evol * gain;
                let vstep = (vend - vstart) / dno as f32;
                // Axis images ignore the horizontal pan and hold their
                // level through the tick
                let image = svol * em.prev_gain[t];
                ramp_add(dst, &scratch.lane, lead, 0, vstart, vstep);
                em.prev_gain[t] = gain;

                // Up/down and back/front each add one delayed image
                for axis in [AXIS_UP, AXIS_BACK] {
                    let w = match axis {
                        AXIS_UP => 0.25,
                        _ => (0.25 + 0.5 * placement.axis[t][axis]).max(0.0),
                    };
                    let diff = clamp_offset(placement.offset[t][axis], dno, pre);
                    ramp_add(dst, &scratch.lane, lead, diff, image * w, 0.0);
                }
            }
            RenderMode::Hrtf => {
                let vstart = svol * em.prev_gain[t];
                let vend = evol * gain;
                let vstep = (vend - vstart) / dno as f32;
                em.prev_gain[t] = vend;

                let weights = [
                    0.5 + 0.75 * placement.axis[t][AXIS_RIGHT],
                    (0.25 + placement.axis[t][AXIS_UP]).max(0.0),
                    (0.25 + 0.5 * placement.axis[t][AXIS_BACK]).max(0.0),
                ];
                for (axis, &w) in weights.iter().enumerate() {
                    let diff = clamp_offset(placement.offset[t][axis], dno, pre);
                    ramp_add(dst, &scratch.lane, lead, diff, vstart * w, vstep * w);
                }
            }
        }
    }

    outcome
}

fn done_or_silent(em: &Emitter) -> MixOutcome {
    if em.stopped && !em.playing {
        MixOutcome::Finished
    } else {
        MixOutcome::Silent
    }
}

/// NaNs and negative gains never reach the ramp
fn sanitize(gain: f32) -> f32 {
    if gain.is_finite() {
        gain.max(0.0)
    } else {
        0.0
    }
}

/// Head-delay offsets stay inside the rendered lane: at most `pre_delay`
/// samples into the past, at most one tick into the future
fn clamp_offset(offset: f32, frames: usize, pre_delay: usize) -> isize {
    let diff = if offset.is_finite() { offset as isize } else { 0 };
    diff.clamp(-(frames as isize), pre_delay as isize)
}

/// Accumulate staging-lane samples into `dst` under a linear gain ramp
///
/// `src` is the whole staging lane, lookahead included; `base` indexes the
/// first rendered frame of this span within it (`dst[0]` reads
/// `src[base]`). A positive `diff` shifts the read cursor into the
/// lookahead history, a negative one towards the future. Reads outside the
/// rendered region contribute silence.
fn ramp_add(dst: &mut [Sample], src: &[Sample], base: usize, diff: isize, vstart: f32, vstep: f32) {
    let mut v = vstart;
    for (i, d) in dst.iter_mut().enumerate() {
        let idx = base as isize + i as isize - diff;
        let s = if idx < 0 {
            0
        } else {
            src.get(idx as usize).copied().unwrap_or(0)
        };
        *d = d.saturating_add((s as f32 * v) as Sample);
        v += vstep;
    }
}
