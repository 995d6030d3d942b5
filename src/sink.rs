//! The contract between the scheduler and an audio transport

use std::time::Duration;

use thiserror::Error;

use crate::store::MixBuffer;

/// Failures surfaced by a device transport
#[derive(Debug, Error)]
pub enum SinkError {
    /// The device cannot provide any format close to the request
    #[error("format negotiation failed: {0}")]
    Negotiation(String),
    /// No usable device was found
    #[error("no audio device available")]
    Unavailable,
    /// The hardware ring buffer underran (playback) or overran (capture)
    #[error("xrun at the device boundary")]
    Xrun,
    /// The driver failed in a way bounded recovery could not fix
    #[error("driver failure: {0}")]
    Driver(String),
}

/// How a transport paces the scheduler
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Transport {
    /// The scheduler times its own ticks and corrects drift
    Timer,
    /// The device signals readiness and the scheduler blocks on it
    Interrupt,
}

/// State changes a sink accepts
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SinkState {
    /// Suspend the stream
    Pause,
    /// Resume the stream
    Resume,
}

/// Queryable transport parameters
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Param {
    /// End-to-end latency in seconds
    Latency,
    /// Lowest supported sample rate
    FrequencyMin,
    /// Highest supported sample rate
    FrequencyMax,
    /// Fewest supported tracks
    TracksMin,
    /// Most supported tracks
    TracksMax,
    /// Lowest volume setting
    VolumeMin,
    /// Highest volume setting
    VolumeMax,
    /// Samples queued in the device, as reported by the driver
    SampleDelay,
}

/// What the mixer asks a device for
#[derive(Debug, Copy, Clone)]
pub struct FormatRequest {
    /// Desired sample rate in Hz
    pub rate: u32,
    /// Desired output tracks
    pub tracks: usize,
    /// Desired device sample width
    pub bits_per_sample: u32,
    /// Target latency in seconds
    pub latency: f32,
}

/// What the device actually granted
///
/// The mixer sizes its buffers from these values, never from the request.
#[derive(Debug, Copy, Clone)]
pub struct Format {
    /// Granted sample rate in Hz
    pub rate: u32,
    /// Granted output tracks
    pub tracks: usize,
    /// Granted device sample width
    pub bits_per_sample: u32,
    /// Frames consumed per scheduler tick
    pub period_frames: usize,
}

impl Format {
    /// Seconds of audio one tick covers
    pub fn period(&self) -> f32 {
        self.period_frames as f32 / self.rate as f32
    }
}

/// Setup-time configuration, supplied once when a device is opened
#[derive(Debug, Clone)]
pub struct Config {
    /// Device to open; `None` picks the default
    pub device: Option<String>,
    /// Requested sample rate in Hz
    pub frequency: u32,
    /// Requested output tracks
    pub tracks: usize,
    /// Requested device sample width
    pub bits_per_sample: u32,
    /// Target latency in seconds
    pub latency: f32,
    /// Output topology
    pub mode: crate::RenderMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: None,
            frequency: 48000,
            tracks: 2,
            bits_per_sample: 16,
            latency: 0.020,
            mode: crate::RenderMode::Stereo,
        }
    }
}

impl Config {
    pub(crate) fn request(&self) -> FormatRequest {
        FormatRequest {
            rate: self.frequency,
            tracks: self.tracks,
            bits_per_sample: self.bits_per_sample,
            latency: self.latency,
        }
    }
}

/// An audio transport consuming mixed output
///
/// Implementations convert between the internal fixed-point mix format and
/// whatever the device speaks; the scheduler only honors the negotiated
/// [`Format`] and never inspects device bytes.
pub trait DeviceSink: Send {
    /// Negotiate a format close to `request`
    ///
    /// Failure is fatal for the device instance; the mixer never enters
    /// playback without a granted format.
    fn negotiate(&mut self, request: &FormatRequest) -> Result<Format, SinkError>;

    /// How this transport paces the scheduler
    fn transport(&self) -> Transport;

    /// Hand `frames` mixed frames to the device
    ///
    /// Returns the number of frames the device actually consumed since the
    /// previous call, which feeds the adaptive wait-time controller.
    fn write_frames(
        &mut self,
        buffer: &MixBuffer,
        frames: usize,
        pitch: f32,
        gain: f32,
    ) -> Result<usize, SinkError>;

    /// Capture `frames` frames from the device into `buffer`
    fn read_frames(
        &mut self,
        buffer: &mut MixBuffer,
        frames: usize,
        gain: f32,
    ) -> Result<usize, SinkError> {
        let _ = (buffer, frames, gain);
        Ok(0)
    }

    /// Query a transport parameter
    fn query(&self, param: Param) -> f32;

    /// Request a state change; returns whether the sink honored it
    fn set_state(&mut self, state: SinkState) -> bool;

    /// Block until the device wants data, for interrupt-driven transports
    fn wait_ready(&mut self, timeout: Duration) -> Result<(), SinkError> {
        let _ = timeout;
        Ok(())
    }

    /// Re-prepare the stream after an xrun
    fn prepare(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Whether this sink captures rather than plays
    fn is_capture(&self) -> bool {
        false
    }

    /// Restart a capture stream after recovery
    fn start(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Report a transport-level problem
    fn report_error(&mut self, message: &str) {
        log::warn!("device sink: {message}");
    }
}
