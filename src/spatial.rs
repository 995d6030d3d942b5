//! Direction, distance, and velocity factors feeding the mix
//!
//! Everything here is computed once per tick per emitter, from positions
//! expressed in listener space: world coordinates translated so the listener
//! sits at the origin, velocities relative to the listener.

use crate::{
    emitter::Emitter,
    math::{direction_to, dot, norm},
    mix::RenderMode,
    MAX_TRACKS,
};

/// Default speed of sound in m/s
pub const SPEED_OF_SOUND: f32 = 343.0;

/// Scene-wide propagation parameters
#[derive(Debug, Copy, Clone)]
pub struct Scene {
    /// Speed of sound between emitters and the listener, m/s
    pub sound_velocity: f32,
    /// Doppler exaggeration; 1.0 is physical
    pub doppler_factor: f32,
}

impl Default for Scene {
    fn default() -> Self {
        Self {
            sound_velocity: SPEED_OF_SOUND,
            doppler_factor: 1.0,
        }
    }
}

/// Pitch shift along the emitter/listener connecting line at sound speed
/// `ss`
///
/// `vs` is the listener's speed away from the emitter, `ve` the emitter's
/// speed towards the listener; approaching emitters raise pitch. Speeds at
/// or above `ss` saturate instead of inverting.
pub fn doppler_shift(vs: f32, ve: f32, ss: f32) -> f32 {
    let vss = ss - vs.min(ss);
    let ves = (ss - ve.min(ss)).max(1.0);
    vss / ves
}

/// Distance attenuation models
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DistanceModel {
    /// No attenuation
    None,
    /// Exponential falloff against the reference distance
    InverseExponential,
    /// Inverse rolloff
    Inverse,
    /// Inverse rolloff, clamped between reference and max distance
    InverseClamped,
    /// Linear falloff between reference and max distance
    Linear,
    /// Linear falloff, clamped
    LinearClamped,
    /// Exponential rolloff
    Exponential,
    /// Exponential rolloff, clamped
    ExponentialClamped,
}

impl DistanceModel {
    /// Gain for a source `dist` meters away
    pub fn attenuation(self, dist: f32, ref_dist: f32, max_dist: f32, rolloff: f32) -> f32 {
        use DistanceModel::*;
        let clamped = |d: f32| d.max(ref_dist).min(max_dist);
        match self {
            None => 1.0,
            InverseExponential | Exponential => exp_gain(dist, ref_dist, rolloff),
            ExponentialClamped => exp_gain(clamped(dist), ref_dist, rolloff),
            Inverse => inv_gain(dist, ref_dist, rolloff),
            InverseClamped => inv_gain(clamped(dist), ref_dist, rolloff),
            Linear => lin_gain(dist, ref_dist, max_dist, rolloff),
            LinearClamped => lin_gain(clamped(dist), ref_dist, max_dist, rolloff),
        }
    }
}

fn exp_gain(dist: f32, ref_dist: f32, rolloff: f32) -> f32 {
    if ref_dist <= 0.0 {
        return 1.0;
    }
    let fraction = dist / ref_dist;
    if fraction > 0.0 {
        fraction.powf(-rolloff)
    } else {
        1.0
    }
}

fn inv_gain(dist: f32, ref_dist: f32, rolloff: f32) -> f32 {
    let denom = ref_dist + rolloff * (dist - ref_dist);
    if denom != 0.0 {
        ref_dist / denom
    } else {
        1.0
    }
}

fn lin_gain(dist: f32, ref_dist: f32, max_dist: f32, rolloff: f32) -> f32 {
    let denom = max_dist - ref_dist;
    if denom != 0.0 {
        (1.0 - rolloff) * (dist - ref_dist) / denom
    } else {
        1.0
    }
}

/// Distance attenuation configuration for one emitter
#[derive(Debug, Copy, Clone)]
pub struct DistanceParams {
    /// Which falloff curve to apply
    pub model: DistanceModel,
    /// Distance at which the source plays at nominal volume
    pub ref_distance: f32,
    /// Distance beyond which clamped models stop attenuating
    pub max_distance: f32,
    /// Falloff steepness
    pub rolloff: f32,
}

impl Default for DistanceParams {
    fn default() -> Self {
        Self {
            model: DistanceModel::InverseExponential,
            ref_distance: 1.0,
            max_distance: 3400.0,
            rolloff: 1.0,
        }
    }
}

/// Directional audio cone carried by an emitter
///
/// Angles are stored as cosines; a source facing away from the listener
/// fades from full volume inside the inner angle to `outer_gain` outside
/// the outer one.
#[derive(Debug, Copy, Clone)]
pub struct Cone {
    /// Cosine of the inner cone angle
    pub inner: f32,
    /// Cosine of the outer cone angle
    pub outer: f32,
    /// Gain applied outside the outer cone
    pub outer_gain: f32,
}

impl Cone {
    fn attenuation(&self, facing: f32) -> f32 {
        if facing >= self.inner {
            return 1.0;
        }
        if facing > self.outer {
            let t = (facing - self.inner) * (self.outer_gain - 1.0) / (self.outer - self.inner);
            1.0 + t
        } else {
            self.outer_gain
        }
    }
}

/// Per-track output geometry
///
/// For plain stereo modes only the pan direction matters. Surround and
/// binaural modes give every track three axis vectors (left-right, up-down,
/// back-front), each contributing a gain weight and a head-delay offset.
pub struct SpeakerLayout {
    tracks: usize,
    pan: [mint::Vector3<f32>; MAX_TRACKS],
    axes: [[mint::Vector3<f32>; 3]; MAX_TRACKS],
    /// Head delay scale per axis, seconds
    delay_factor: [f32; 3],
    /// Head delay floor per axis, seconds
    delay_offset: [f32; 3],
}

impl SpeakerLayout {
    /// Two-track layout for headphones or a stereo speaker pair
    pub fn stereo() -> Self {
        let x = mint::Vector3::from([1.0, 0.0, 0.0]);
        let nx = mint::Vector3::from([-1.0, 0.0, 0.0]);
        let ny = mint::Vector3::from([0.0, -1.0, 0.0]);
        let z = mint::Vector3::from([0.0, 0.0, 1.0]);
        let zero = mint::Vector3::from([0.0; 3]);
        let mut pan = [zero; MAX_TRACKS];
        pan[0] = nx;
        pan[1] = x;
        let mut axes = [[zero; 3]; MAX_TRACKS];
        // Left shell hears +X sources directly, right shell -X
        axes[0] = [x, ny, z];
        axes[1] = [nx, ny, z];
        Self {
            tracks: 2,
            pan,
            axes,
            delay_factor: [0.00064, 0.000090, 0.00024],
            delay_offset: [0.0, 0.000100, 0.0],
        }
    }

    /// Pan-only layout from one direction per output track
    pub fn from_directions(dirs: &[mint::Vector3<f32>]) -> Self {
        let mut layout = Self::stereo();
        layout.tracks = dirs.len().min(MAX_TRACKS);
        for (t, &d) in dirs.iter().take(MAX_TRACKS).enumerate() {
            layout.pan[t] = d;
            layout.axes[t] = [d, [0.0, -1.0, 0.0].into(), [0.0, 0.0, 1.0].into()];
        }
        layout
    }

    /// Number of output tracks this layout describes
    pub fn tracks(&self) -> usize {
        self.tracks
    }
}

/// Everything the mixing stage needs to place one emitter for one tick
pub(crate) struct Placement {
    /// Doppler pitch factor
    pub pitch: f32,
    /// Distance and cone attenuation combined
    pub gain: f32,
    /// Propagation delay from the emitter's current distance, seconds
    pub delay_sec: f32,
    /// Stereo/spatial directional factor per track
    pub pan: [f32; MAX_TRACKS],
    /// Directional factor per track and axis
    pub axis: [[f32; 3]; MAX_TRACKS],
    /// Head-delay time offset per track and axis, in destination samples
    pub offset: [[f32; 3]; MAX_TRACKS],
}

/// Project an emitter's listener-space motion onto the output layout
pub(crate) fn prepare(
    emitter: &Emitter,
    layout: &SpeakerLayout,
    mode: RenderMode,
    scene: &Scene,
    rate: u32,
) -> Placement {
    let pos = mint::Vector3::from([
        emitter.position.x,
        emitter.position.y,
        emitter.position.z,
    ]);
    let dist = norm(pos);
    let epos = direction_to(emitter.position);

    let mut pitch = 1.0;
    if dist > 1.0 {
        // Component of the emitter's velocity towards the listener
        let ve = -dot(emitter.velocity, epos);
        let ss = scene.sound_velocity / scene.doppler_factor.max(1e-3);
        pitch = doppler_shift(0.0, ve, ss);
    }

    let d = emitter.distance;
    let mut gain = d
        .model
        .attenuation(dist, d.ref_distance, d.max_distance, d.rolloff);
    if let Some(cone) = emitter.cone {
        // How squarely the emitter faces the listener
        let facing = dot(emitter.direction, [-epos.x, -epos.y, -epos.z].into());
        gain *= cone.attenuation(facing);
    }

    let dist_fact = if d.ref_distance > 0.0 {
        (dist / d.ref_distance).min(1.0)
    } else {
        1.0
    };
    let fs = rate as f32;

    let mut placement = Placement {
        pitch,
        gain,
        delay_sec: dist / scene.sound_velocity.max(1.0),
        pan: [0.0; MAX_TRACKS],
        axis: [[0.0; 3]; MAX_TRACKS],
        offset: [[0.0; 3]; MAX_TRACKS],
    };

    for t in 0..layout.tracks {
        match mode {
            RenderMode::Stereo | RenderMode::PureStereo => {
                placement.pan[t] = dot(layout.pan[t], epos) * dist_fact;
            }
            RenderMode::Spatial => {
                placement.pan[t] = 0.5 + dot(layout.pan[t], epos) * dist_fact;
            }
            RenderMode::Surround | RenderMode::Hrtf => {
                placement.pan[t] = dot(layout.pan[t], epos) * dist_fact;
                for axis in 0..3 {
                    let dp = dot(layout.axes[t][axis], epos);
                    placement.axis[t][axis] = dp * dist_fact;

                    // Map [-1, 1] onto [0, 1], shaping the rear and upper
                    // responses the way a head does
                    let mut dp01 = 0.5 + dp / 2.0;
                    if mode == RenderMode::Hrtf {
                        match axis {
                            AXIS_BACK => dp01 *= dp01,
                            AXIS_UP => dp01 = 0.25 * (5.0 * dp01 - dp01 * dp01),
                            _ => {}
                        }
                    }
                    let offs = layout.delay_offset[axis] * fs;
                    let fact = layout.delay_factor[axis] * fs;
                    placement.offset[t][axis] = (offs + dp01 * fact).max(0.0);
                }
            }
        }
    }
    placement
}

pub(crate) const AXIS_RIGHT: usize = 0;
pub(crate) const AXIS_UP: usize = 1;
pub(crate) const AXIS_BACK: usize = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doppler_approaching_raises_pitch() {
        assert!(doppler_shift(0.0, 50.0, SPEED_OF_SOUND) > 1.0);
        assert!(doppler_shift(0.0, -50.0, SPEED_OF_SOUND) < 1.0);
        assert_eq!(doppler_shift(0.0, 0.0, SPEED_OF_SOUND), 1.0);
    }

    #[test]
    fn doppler_saturates_at_sound_speed() {
        let v = doppler_shift(0.0, 2.0 * SPEED_OF_SOUND, SPEED_OF_SOUND);
        assert!(v.is_finite() && v > 1.0);
    }

    #[test]
    fn exponential_attenuation_halves_per_doubling() {
        let g1 = DistanceModel::InverseExponential.attenuation(2.0, 1.0, 100.0, 1.0);
        assert!((g1 - 0.5).abs() < 1e-6);
        let g2 = DistanceModel::InverseExponential.attenuation(4.0, 1.0, 100.0, 1.0);
        assert!((g2 - 0.25).abs() < 1e-6);
    }

    #[test]
    fn clamped_models_hold_at_max_distance() {
        let m = DistanceModel::ExponentialClamped;
        let at_max = m.attenuation(10.0, 1.0, 10.0, 1.0);
        let beyond = m.attenuation(1000.0, 1.0, 10.0, 1.0);
        assert_eq!(at_max, beyond);
    }

    #[test]
    fn cone_fades_between_angles() {
        let cone = Cone {
            inner: 0.8,
            outer: 0.2,
            outer_gain: 0.1,
        };
        assert_eq!(cone.attenuation(0.9), 1.0);
        assert_eq!(cone.attenuation(0.2), 0.1);
        let mid = cone.attenuation(0.5);
        assert!(mid > 0.1 && mid < 1.0);
    }

    #[test]
    fn placement_shifts_pitch_for_closing_emitter() {
        let store = std::sync::Arc::new(crate::SampleStore::from_frames(44100, &[0; 64]));
        let mut em = Emitter::new(store);
        em.position = [10.0, 0.0, 0.0].into();
        em.velocity = [-50.0, 0.0, 0.0].into();
        let layout = SpeakerLayout::stereo();
        let p = prepare(&em, &layout, RenderMode::Stereo, &Scene::default(), 44100);
        assert!(p.pitch > 1.0);
        em.velocity = [50.0, 0.0, 0.0].into();
        let p = prepare(&em, &layout, RenderMode::Stereo, &Scene::default(), 44100);
        assert!(p.pitch < 1.0);
    }

    #[test]
    fn hrtf_offsets_bounded_and_sided() {
        let em = {
            let store =
                std::sync::Arc::new(crate::SampleStore::from_frames(44100, &[0; 64]));
            let mut em = Emitter::new(store);
            em.position = [10.0, 0.0, 0.0].into();
            em
        };
        let layout = SpeakerLayout::stereo();
        let p = prepare(&em, &layout, RenderMode::Hrtf, &Scene::default(), 44100);
        // Source hard right: sound reaches the left ear late, the right
        // ear immediately
        assert!(p.offset[0][AXIS_RIGHT] > p.offset[1][AXIS_RIGHT]);
        for t in 0..2 {
            for axis in 0..3 {
                assert!(p.offset[t][axis] >= 0.0);
                assert!(p.offset[t][axis] <= 0.00164 * 44100.0);
            }
        }
    }
}
