//! Kernel-direct transport speaking an explicit wire format
//!
//! Hardware parameter negotiation goes through a versioned, little-endian
//! parameter block rather than ad-hoc struct punning, so the exchange can
//! be tested against an in-memory port with no device present. The port
//! itself is a capability object: embedders resolve one once at startup
//! (e.g. by opening a PCM character device) and its absence simply leaves
//! this backend unavailable.

use std::time::Duration;

use thiserror::Error;

use crate::sink::{DeviceSink, Format, FormatRequest, Param, SinkError, SinkState, Transport};
use crate::store::MixBuffer;

/// Wire-format revision understood by this implementation
pub const WIRE_VERSION: u32 = 1;

/// Encoded size of a [`StreamParams`] block
pub const WIRE_LEN: usize = 24;

/// Errors decoding a parameter block
#[derive(Debug, Error)]
pub enum WireError {
    /// Block is not exactly [`WIRE_LEN`] bytes
    #[error("parameter block must be {WIRE_LEN} bytes, got {0}")]
    BadLength(usize),
    /// The peer speaks a different revision
    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u32),
    /// A field holds a value no device could grant
    #[error("invalid field: {0}")]
    BadField(&'static str),
}

/// Hardware stream parameters, version 1
///
/// Layout, all fields little-endian u32:
///
/// | offset | field           |
/// |--------|-----------------|
/// | 0      | `version`       |
/// | 4      | `rate`          |
/// | 8      | `tracks`        |
/// | 12     | `bits`          |
/// | 16     | `period_frames` |
/// | 20     | `buffer_frames` |
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StreamParams {
    /// Wire revision; always [`WIRE_VERSION`] when encoded here
    pub version: u32,
    /// Sample rate in Hz
    pub rate: u32,
    /// Interleaved track count
    pub tracks: u32,
    /// Sample width in bits
    pub bits: u32,
    /// Frames per hardware period
    pub period_frames: u32,
    /// Total hardware buffer length in frames
    pub buffer_frames: u32,
}

impl StreamParams {
    /// Serialize into the wire layout
    pub fn encode(&self) -> [u8; WIRE_LEN] {
        let mut out = [0u8; WIRE_LEN];
        for (i, v) in [
            self.version,
            self.rate,
            self.tracks,
            self.bits,
            self.period_frames,
            self.buffer_frames,
        ]
        .into_iter()
        .enumerate()
        {
            out[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Parse and validate a wire block
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != WIRE_LEN {
            return Err(WireError::BadLength(bytes.len()));
        }
        let field = |i: usize| {
            let mut v = [0u8; 4];
            v.copy_from_slice(&bytes[i * 4..i * 4 + 4]);
            u32::from_le_bytes(v)
        };
        let params = Self {
            version: field(0),
            rate: field(1),
            tracks: field(2),
            bits: field(3),
            period_frames: field(4),
            buffer_frames: field(5),
        };
        if params.version != WIRE_VERSION {
            return Err(WireError::UnsupportedVersion(params.version));
        }
        if params.rate == 0 {
            return Err(WireError::BadField("rate"));
        }
        if params.tracks == 0 {
            return Err(WireError::BadField("tracks"));
        }
        if params.bits != 8 && params.bits != 16 && params.bits != 24 && params.bits != 32 {
            return Err(WireError::BadField("bits"));
        }
        if params.period_frames == 0 || params.buffer_frames < params.period_frames {
            return Err(WireError::BadField("period_frames"));
        }
        Ok(params)
    }
}

/// Byte-level access to a PCM device
///
/// The one capability the kernel-direct backend needs. Implementations
/// wrap a real character device; tests use an in-memory port.
pub trait PcmPort: Send {
    /// Exchange parameter blocks; the returned block holds what the device
    /// granted
    fn configure(&mut self, request: &[u8]) -> Result<Vec<u8>, SinkError>;
    /// Queue interleaved device-native frames; returns bytes accepted
    fn submit(&mut self, bytes: &[u8]) -> Result<usize, SinkError>;
    /// Frames currently queued in the device
    fn delay(&self) -> Result<u32, SinkError>;
    /// Block until the device wants data
    fn ready(&mut self, timeout: Duration) -> Result<(), SinkError>;
    /// Return the stream to the configured-and-idle state
    fn prepare(&mut self) -> Result<(), SinkError>;
    /// Suspend or resume the stream clock
    fn pause(&mut self, pause: bool) -> Result<(), SinkError>;
}

/// Interrupt-driven sink over a [`PcmPort`]
pub struct KernelSink<P> {
    port: P,
    granted: Option<StreamParams>,
    staging: Vec<u8>,
}

impl<P: PcmPort> KernelSink<P> {
    /// Wrap an opened port
    pub fn new(port: P) -> Self {
        Self {
            port,
            granted: None,
            staging: Vec::new(),
        }
    }

    /// The parameters the device granted, once negotiated
    pub fn granted(&self) -> Option<&StreamParams> {
        self.granted.as_ref()
    }
}

impl<P: PcmPort> DeviceSink for KernelSink<P> {
    fn negotiate(&mut self, request: &FormatRequest) -> Result<Format, SinkError> {
        let period = (request.latency * request.rate as f32) as u32;
        let wanted = StreamParams {
            version: WIRE_VERSION,
            rate: request.rate,
            tracks: request.tracks as u32,
            bits: request.bits_per_sample,
            period_frames: period.max(16),
            buffer_frames: period.max(16) * 2,
        };
        let reply = self.port.configure(&wanted.encode())?;
        let granted =
            StreamParams::decode(&reply).map_err(|e| SinkError::Negotiation(e.to_string()))?;
        // Stage one period of interleaved device frames, sized off the
        // grant so no allocation happens once ticks are running
        self.staging = Vec::with_capacity(
            granted.period_frames as usize * granted.tracks as usize * (granted.bits as usize / 8),
        );
        self.granted = Some(granted);
        Ok(Format {
            rate: granted.rate,
            tracks: granted.tracks as usize,
            bits_per_sample: granted.bits,
            period_frames: granted.period_frames as usize,
        })
    }

    fn transport(&self) -> Transport {
        Transport::Interrupt
    }

    fn write_frames(
        &mut self,
        buffer: &MixBuffer,
        frames: usize,
        _pitch: f32,
        gain: f32,
    ) -> Result<usize, SinkError> {
        let granted = self
            .granted
            .ok_or_else(|| SinkError::Driver("write before negotiation".into()))?;
        let frames = frames.min(buffer.frames());
        let tracks = (granted.tracks as usize).min(buffer.tracks());
        self.staging.clear();
        for i in 0..frames {
            for t in 0..tracks {
                let wide = (buffer.track(t)[i] as f32 * gain) as i32;
                let narrow = (wide >> 8).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
                self.staging.extend_from_slice(&narrow.to_le_bytes());
            }
        }
        let accepted = self.port.submit(&self.staging)?;
        Ok(accepted / (tracks * 2).max(1))
    }

    fn query(&self, param: Param) -> f32 {
        let granted = match &self.granted {
            Some(g) => g,
            None => return 0.0,
        };
        match param {
            Param::Latency => granted.buffer_frames as f32 / granted.rate as f32,
            Param::FrequencyMin => 4000.0,
            Param::FrequencyMax => 192_000.0,
            Param::TracksMin => 1.0,
            Param::TracksMax => crate::MAX_TRACKS as f32,
            Param::VolumeMin => 0.0,
            Param::VolumeMax => 1.0,
            Param::SampleDelay => self.port.delay().unwrap_or(0) as f32,
        }
    }

    fn set_state(&mut self, state: SinkState) -> bool {
        self.port.pause(state == SinkState::Pause).is_ok()
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<(), SinkError> {
        self.port.ready(timeout)
    }

    fn prepare(&mut self) -> Result<(), SinkError> {
        self.port.prepare()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A device that grants 16-bit stereo at whatever rate it is asked,
    /// clamped into its supported range
    struct MemoryPort {
        granted: Option<StreamParams>,
        bytes: Vec<u8>,
        prepares: u32,
    }

    impl MemoryPort {
        fn new() -> Self {
            Self {
                granted: None,
                bytes: Vec::new(),
                prepares: 0,
            }
        }
    }

    impl PcmPort for MemoryPort {
        fn configure(&mut self, request: &[u8]) -> Result<Vec<u8>, SinkError> {
            let wanted = StreamParams::decode(request)
                .map_err(|e| SinkError::Negotiation(e.to_string()))?;
            let granted = StreamParams {
                version: WIRE_VERSION,
                rate: wanted.rate.clamp(8000, 48000),
                tracks: wanted.tracks.min(2),
                bits: 16,
                period_frames: wanted.period_frames.next_power_of_two(),
                buffer_frames: wanted.period_frames.next_power_of_two() * 2,
            };
            self.granted = Some(granted);
            Ok(granted.encode().to_vec())
        }

        fn submit(&mut self, bytes: &[u8]) -> Result<usize, SinkError> {
            self.bytes.extend_from_slice(bytes);
            Ok(bytes.len())
        }

        fn delay(&self) -> Result<u32, SinkError> {
            Ok(0)
        }

        fn ready(&mut self, _: Duration) -> Result<(), SinkError> {
            Ok(())
        }

        fn prepare(&mut self) -> Result<(), SinkError> {
            self.prepares += 1;
            Ok(())
        }

        fn pause(&mut self, _: bool) -> Result<(), SinkError> {
            Ok(())
        }
    }

    #[test]
    fn round_trips_wire_format() {
        let params = StreamParams {
            version: WIRE_VERSION,
            rate: 44100,
            tracks: 2,
            bits: 16,
            period_frames: 512,
            buffer_frames: 1024,
        };
        assert_eq!(StreamParams::decode(&params.encode()).unwrap(), params);
    }

    #[test]
    fn rejects_malformed_blocks() {
        assert!(matches!(
            StreamParams::decode(&[0; 8]),
            Err(WireError::BadLength(8))
        ));
        let mut bad_version = StreamParams {
            version: 9,
            rate: 44100,
            tracks: 2,
            bits: 16,
            period_frames: 512,
            buffer_frames: 1024,
        }
        .encode();
        assert!(matches!(
            StreamParams::decode(&bad_version),
            Err(WireError::UnsupportedVersion(9))
        ));
        bad_version[0..4].copy_from_slice(&WIRE_VERSION.to_le_bytes());
        bad_version[4..8].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            StreamParams::decode(&bad_version),
            Err(WireError::BadField("rate"))
        ));
    }

    #[test]
    fn negotiates_against_memory_port() {
        let mut sink = KernelSink::new(MemoryPort::new());
        let format = sink
            .negotiate(&FormatRequest {
                rate: 96000,
                tracks: 6,
                bits_per_sample: 24,
                latency: 0.010,
            })
            .unwrap();
        // The device, not the request, decides
        assert_eq!(format.rate, 48000);
        assert_eq!(format.tracks, 2);
        assert_eq!(format.bits_per_sample, 16);
        assert!(format.period_frames.is_power_of_two());
    }

    #[test]
    fn writes_interleaved_device_frames() {
        let mut sink = KernelSink::new(MemoryPort::new());
        sink.negotiate(&FormatRequest {
            rate: 8000,
            tracks: 2,
            bits_per_sample: 16,
            latency: 0.016,
        })
        .unwrap();
        let mut buffer = MixBuffer::allocate(2, 8000, 16, 4, 0).unwrap();
        buffer.track_mut(0).fill(0x0100);
        buffer.track_mut(1).fill(-0x0100);
        let accepted = sink.write_frames(&buffer, 4, 1.0, 1.0).unwrap();
        assert_eq!(accepted, 4);
        let bytes = &sink.port.bytes;
        assert_eq!(bytes.len(), 4 * 2 * 2);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 1);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), -1);
    }
}
