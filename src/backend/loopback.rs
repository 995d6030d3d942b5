//! Loopback transport: a timer-driven virtual device
//!
//! Consumes mixed output without any hardware, optionally keeping the
//! rendered frames for inspection or file export. The device queue is
//! modeled against the wall clock so the adaptive scheduler behaves exactly
//! as it would against real timer-driven hardware.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::sink::{DeviceSink, Format, FormatRequest, Param, SinkError, SinkState, Transport};
use crate::store::MixBuffer;

/// Frames per period granted during negotiation when the requested latency
/// is impossible
const MIN_PERIOD_FRAMES: usize = 64;

/// A sink that plays into memory
pub struct LoopbackSink {
    format: Option<Format>,
    latency: f32,
    /// Virtual queue fill in frames, drained against the wall clock
    fill: f64,
    last_write: Option<Instant>,
    paused: bool,
    captured: Option<Arc<Mutex<Vec<i16>>>>,
}

impl Default for LoopbackSink {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackSink {
    /// A loopback sink that discards rendered audio
    pub fn new() -> Self {
        Self {
            format: None,
            latency: 0.0,
            fill: 0.0,
            last_write: None,
            paused: true,
            captured: None,
        }
    }

    /// A loopback sink that appends every rendered frame, interleaved, to a
    /// shared buffer
    pub fn capturing() -> (Self, Arc<Mutex<Vec<i16>>>) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let mut sink = Self::new();
        sink.captured = Some(buffer.clone());
        (sink, buffer)
    }
}

impl DeviceSink for LoopbackSink {
    fn negotiate(&mut self, request: &FormatRequest) -> Result<Format, SinkError> {
        if request.rate == 0 || request.tracks == 0 {
            return Err(SinkError::Negotiation(
                "rate and track count must be non-zero".into(),
            ));
        }
        let period_frames =
            ((request.latency * request.rate as f32) as usize).max(MIN_PERIOD_FRAMES);
        let format = Format {
            rate: request.rate,
            tracks: request.tracks.min(crate::MAX_TRACKS),
            bits_per_sample: 16,
            period_frames,
        };
        self.latency = period_frames as f32 / request.rate as f32;
        self.format = Some(format);
        Ok(format)
    }

    fn transport(&self) -> Transport {
        Transport::Timer
    }

    fn write_frames(
        &mut self,
        buffer: &MixBuffer,
        frames: usize,
        _pitch: f32,
        gain: f32,
    ) -> Result<usize, SinkError> {
        let format = self
            .format
            .ok_or_else(|| SinkError::Driver("write before negotiation".into()))?;
        let frames = frames.min(buffer.frames());

        // Drain the virtual queue for the time since the last hand-off
        let now = Instant::now();
        if let Some(last) = self.last_write {
            let elapsed = now.duration_since(last).as_secs_f64();
            self.fill = (self.fill - elapsed * format.rate as f64).max(0.0);
        }
        self.last_write = Some(now);
        self.fill += frames as f64;

        if let Some(captured) = &self.captured {
            let mut out = captured.lock().unwrap();
            out.reserve(frames * format.tracks);
            for i in 0..frames {
                for t in 0..format.tracks {
                    let wide = (buffer.track(t)[i] as f32 * gain) as i32;
                    out.push((wide >> 8).clamp(i16::MIN as i32, i16::MAX as i32) as i16);
                }
            }
        }
        Ok(frames)
    }

    fn query(&self, param: Param) -> f32 {
        match param {
            Param::Latency => self.latency,
            Param::FrequencyMin => 4000.0,
            Param::FrequencyMax => 192_000.0,
            Param::TracksMin => 1.0,
            Param::TracksMax => crate::MAX_TRACKS as f32,
            Param::VolumeMin => 0.0,
            Param::VolumeMax => 1.0,
            Param::SampleDelay => self.fill as f32,
        }
    }

    fn set_state(&mut self, state: SinkState) -> bool {
        self.paused = state == SinkState::Pause;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format_request() -> FormatRequest {
        FormatRequest {
            rate: 8000,
            tracks: 2,
            bits_per_sample: 16,
            latency: 0.016,
        }
    }

    #[test]
    fn negotiation_honors_request() {
        let mut sink = LoopbackSink::new();
        let format = sink.negotiate(&format_request()).unwrap();
        assert_eq!(format.rate, 8000);
        assert_eq!(format.tracks, 2);
        assert_eq!(format.period_frames, 128);
        assert!((sink.query(Param::Latency) - 0.016).abs() < 1e-6);
    }

    #[test]
    fn capture_interleaves_and_narrows() {
        let (mut sink, captured) = LoopbackSink::capturing();
        sink.negotiate(&format_request()).unwrap();
        let mut buffer = MixBuffer::allocate(2, 8000, 16, 4, 0).unwrap();
        buffer.track_mut(0).fill(1 << 8);
        buffer.track_mut(1).fill(2 << 8);
        let accepted = sink.write_frames(&buffer, 4, 1.0, 1.0).unwrap();
        assert_eq!(accepted, 4);
        let data = captured.lock().unwrap();
        assert_eq!(&data[..4], &[1, 2, 1, 2]);
    }

    #[test]
    fn queue_drains_with_time() {
        let mut sink = LoopbackSink::new();
        sink.negotiate(&format_request()).unwrap();
        let buffer = MixBuffer::allocate(2, 8000, 16, 128, 0).unwrap();
        sink.write_frames(&buffer, 128, 1.0, 1.0).unwrap();
        let fill = sink.query(Param::SampleDelay);
        assert_eq!(fill, 128.0);
        std::thread::sleep(std::time::Duration::from_millis(8));
        sink.write_frames(&buffer, 128, 1.0, 1.0).unwrap();
        // ~64 frames drained during the sleep
        assert!(sink.query(Param::SampleDelay) < 256.0);
    }

    #[test]
    fn write_before_negotiation_fails() {
        let mut sink = LoopbackSink::new();
        let buffer = MixBuffer::allocate(1, 8000, 16, 4, 0).unwrap();
        assert!(sink.write_frames(&buffer, 4, 1.0, 1.0).is_err());
    }
}
