//! Real-time spatial audio rendering
//!
//! Sound sources ([`Emitter`]s) are resampled to the output rate, spatially
//! mixed into a multi-track ring buffer, shaped by a nonlinear dynamics
//! stage, and handed to an audio device at a cadence driven by an adaptive
//! scheduler.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! let sink = resona::backend::probe(&resona::Config::default()).unwrap();
//! let device = resona::Device::open(resona::Config::default(), sink).unwrap();
//!
//! // Decoded PCM from the asset layer:
//! # let pcm: Vec<i16> = vec![0; 44100];
//! let asset = resona::AssetSource {
//!     frequency: 44100,
//!     channels: 1,
//!     bits_per_sample: 16,
//!     loop_start: 0,
//!     loop_end: 0,
//!     pcm: resona::Pcm::I16(&pcm),
//! };
//! let store = Arc::new(resona::SampleStore::from_asset(&asset).unwrap());
//!
//! let mut emitter = resona::Emitter::new(store);
//! emitter.position = [1.0, 0.0, -2.0].into();
//! let id = device.mixer().lock().unwrap().register(emitter);
//!
//! device.play();
//! ```

#![warn(missing_docs)]

pub mod backend;
mod device;
mod dynamics;
mod emitter;
mod math;
mod mix;
mod mixer;
mod modulate;
mod resample;
mod sched;
mod sink;
mod spatial;
mod store;

pub use device::{Device, EngineError, PlaybackState};
pub use dynamics::Dynamics;
pub use emitter::{Bus, BusDynamics, Emitter, EmitterId};
pub use mix::{MixOutcome, RenderMode};
pub use mixer::Mixer;
pub use modulate::{
    Envelope, EnvelopeFollower, GainChain, GainModulator, Lfo, PitchChain, Segment, Waveform,
};
pub use sched::Pid;
pub use sink::{
    Config, DeviceSink, Format, FormatRequest, Param, SinkError, SinkState, Transport,
};
pub use spatial::{
    doppler_shift, Cone, DistanceModel, DistanceParams, Scene, SpeakerLayout, SPEED_OF_SOUND,
};
pub use store::{AllocationError, AssetSource, MixBuffer, Pcm, SampleStore};

/// Fixed-point mixing sample: signed 32 bits with headroom above the nominal
/// 24-bit range
///
/// Every mixing stage operates on this format; conversion to and from the
/// device-native sample format happens at the sink boundary.
pub type Sample = i32;

/// Magnitude of a full-scale source sample after widening to the mix format
pub const NOMINAL_PEAK: Sample = (1 << 23) - 1;

/// Most output tracks any destination buffer can carry
pub const MAX_TRACKS: usize = 8;
