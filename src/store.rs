use thiserror::Error;

use crate::{Sample, MAX_TRACKS};

/// Failure to obtain or resize track storage
///
/// Only raised on the setup/resize path; no allocation ever happens while a
/// mix tick is in flight.
#[derive(Debug, Error)]
pub enum AllocationError {
    /// No output tracks requested
    #[error("destination buffer needs at least one track")]
    NoTracks,
    /// More tracks requested than the mixer supports
    #[error("destination buffer supports at most {MAX_TRACKS} tracks")]
    TooManyTracks,
    /// Zero-length buffer requested
    #[error("destination buffer needs a non-zero capacity")]
    NoFrames,
    /// Requested dimensions overflow addressable storage
    #[error("track storage size overflows")]
    TooLarge,
    /// The allocator refused the arena
    #[error("out of memory allocating {0} samples")]
    OutOfMemory(usize),
}

/// Multi-track destination buffer for one mix target
///
/// One contiguous arena owns the storage for every track; tracks are fixed
/// offsets into it and are freed as one unit. Each track lane reserves
/// `pre_delay` samples ahead of frame zero so time-delay effects and
/// negative spatial offsets can read into the recent past.
pub struct MixBuffer {
    arena: Box<[Sample]>,
    tracks: usize,
    rate: u32,
    bits_per_sample: u32,
    /// Samples per lane: `pre_delay + capacity`
    stride: usize,
    frames: usize,
    capacity: usize,
    pre_delay: usize,
}

impl MixBuffer {
    /// Allocate a buffer of `tracks` lanes able to hold `capacity` frames at
    /// `rate`, each lane led by `pre_delay` lookahead samples
    pub fn allocate(
        tracks: usize,
        rate: u32,
        bits_per_sample: u32,
        capacity: usize,
        pre_delay: usize,
    ) -> Result<Self, AllocationError> {
        let (stride, arena) = Self::arena_for(tracks, capacity, pre_delay)?;
        Ok(Self {
            arena,
            tracks,
            rate,
            bits_per_sample,
            stride,
            frames: capacity,
            capacity,
            pre_delay,
        })
    }

    fn arena_for(
        tracks: usize,
        capacity: usize,
        pre_delay: usize,
    ) -> Result<(usize, Box<[Sample]>), AllocationError> {
        if tracks == 0 {
            return Err(AllocationError::NoTracks);
        }
        if tracks > MAX_TRACKS {
            return Err(AllocationError::TooManyTracks);
        }
        if capacity == 0 {
            return Err(AllocationError::NoFrames);
        }
        let stride = pre_delay
            .checked_add(capacity)
            .ok_or(AllocationError::TooLarge)?;
        let len = stride
            .checked_mul(tracks)
            .ok_or(AllocationError::TooLarge)?;
        let mut arena = Vec::new();
        arena
            .try_reserve_exact(len)
            .map_err(|_| AllocationError::OutOfMemory(len))?;
        arena.resize(len, 0);
        Ok((stride, arena.into_boxed_slice()))
    }

    /// Reallocate for a new track count, rate, or capacity
    ///
    /// Only legal between ticks; the scheduler thread owns the buffer
    /// exclusively while a mix is in flight, so exclusive access here is
    /// enforced by the borrow. Existing contents are discarded.
    pub fn resize(
        &mut self,
        tracks: usize,
        rate: u32,
        capacity: usize,
        pre_delay: usize,
    ) -> Result<(), AllocationError> {
        let (stride, arena) = Self::arena_for(tracks, capacity, pre_delay)?;
        self.arena = arena;
        self.tracks = tracks;
        self.rate = rate;
        self.stride = stride;
        self.frames = capacity;
        self.capacity = capacity;
        self.pre_delay = pre_delay;
        Ok(())
    }

    /// Number of output tracks
    pub fn tracks(&self) -> usize {
        self.tracks
    }

    /// Destination sample rate in Hz
    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Bits per sample of the negotiated device format
    pub fn bits_per_sample(&self) -> u32 {
        self.bits_per_sample
    }

    /// Frames valid in the current tick
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Largest frame count the allocation can hold
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lookahead samples reserved ahead of frame zero in every lane
    pub fn pre_delay(&self) -> usize {
        self.pre_delay
    }

    /// Duration of the valid region in seconds
    pub fn duration(&self) -> f32 {
        self.frames as f32 / self.rate as f32
    }

    /// Shrink the valid region; never grows past capacity
    pub fn set_frames(&mut self, frames: usize) {
        self.frames = frames.min(self.capacity);
    }

    /// Zero every lane, lookahead included
    pub fn clear(&mut self) {
        self.arena.fill(0);
    }

    /// Full lane for track `t`; index `pre_delay` is frame zero
    pub fn lane(&self, t: usize) -> &[Sample] {
        &self.arena[t * self.stride..(t + 1) * self.stride]
    }

    /// Mutable full lane for track `t`
    pub fn lane_mut(&mut self, t: usize) -> &mut [Sample] {
        &mut self.arena[t * self.stride..(t + 1) * self.stride]
    }

    /// The valid frames of track `t`, without the lookahead lead
    pub fn track(&self, t: usize) -> &[Sample] {
        let start = t * self.stride + self.pre_delay;
        &self.arena[start..start + self.frames]
    }

    /// Mutable valid frames of track `t`
    pub fn track_mut(&mut self, t: usize) -> &mut [Sample] {
        let start = t * self.stride + self.pre_delay;
        &mut self.arena[start..start + self.frames]
    }
}

/// Decoded PCM handed over by the asset-loading layer
pub struct AssetSource<'a> {
    /// Native sample rate in Hz
    pub frequency: u32,
    /// Interleaved channel count
    pub channels: usize,
    /// Source sample width; 8, 16, and 24 bits are accepted
    pub bits_per_sample: u32,
    /// First frame of the loop region
    pub loop_start: usize,
    /// One past the last frame of the loop region; 0 means the whole sound
    pub loop_end: usize,
    /// The decoded samples, interleaved when `channels > 1`
    pub pcm: Pcm<'a>,
}

/// Sample widths accepted from the asset layer
pub enum Pcm<'a> {
    /// Signed 8-bit PCM
    I8(&'a [i8]),
    /// Signed 16-bit PCM
    I16(&'a [i16]),
    /// Signed 24-bit PCM in the low bits of an i32
    I24(&'a [i32]),
}

impl Pcm<'_> {
    fn len(&self) -> usize {
        match self {
            Pcm::I8(s) => s.len(),
            Pcm::I16(s) => s.len(),
            Pcm::I24(s) => s.len(),
        }
    }

    /// Widen sample `i` into the 24-bit nominal mixing range
    fn widen(&self, i: usize) -> Sample {
        match self {
            Pcm::I8(s) => (s[i] as Sample) << 16,
            Pcm::I16(s) => (s[i] as Sample) << 8,
            Pcm::I24(s) => s[i],
        }
    }
}

/// Immutable PCM storage and loop metadata for a source sound
///
/// Samples are widened to the internal fixed-point format at construction
/// and stored track-major, so the mix path never touches the device format.
pub struct SampleStore {
    data: Box<[Sample]>,
    tracks: usize,
    frames: usize,
    rate: u32,
    loop_start: usize,
    loop_end: usize,
}

impl SampleStore {
    /// Build a store from decoded asset PCM, deinterleaving multi-channel
    /// input into per-track storage
    pub fn from_asset(asset: &AssetSource) -> Result<Self, AllocationError> {
        if asset.channels == 0 {
            return Err(AllocationError::NoTracks);
        }
        let frames = asset.pcm.len() / asset.channels;
        if frames == 0 {
            return Err(AllocationError::NoFrames);
        }
        let len = frames
            .checked_mul(asset.channels)
            .ok_or(AllocationError::TooLarge)?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| AllocationError::OutOfMemory(len))?;
        for t in 0..asset.channels {
            for f in 0..frames {
                data.push(asset.pcm.widen(f * asset.channels + t));
            }
        }
        let loop_end = if asset.loop_end == 0 {
            frames
        } else {
            asset.loop_end.min(frames)
        };
        Ok(Self {
            data: data.into_boxed_slice(),
            tracks: asset.channels,
            frames,
            rate: asset.frequency,
            loop_start: asset.loop_start.min(loop_end),
            loop_end,
        })
    }

    /// Build a mono store directly from mix-format samples
    pub fn from_frames(rate: u32, samples: &[Sample]) -> Self {
        Self {
            data: samples.into(),
            tracks: 1,
            frames: samples.len(),
            rate,
            loop_start: 0,
            loop_end: samples.len(),
        }
    }

    /// Number of source tracks
    pub fn tracks(&self) -> usize {
        self.tracks
    }

    /// Frames per track
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Native sample rate in Hz
    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Loop region start frame
    pub fn loop_start(&self) -> usize {
        self.loop_start
    }

    /// One past the loop region end frame
    pub fn loop_end(&self) -> usize {
        self.loop_end
    }

    /// Playback length in seconds
    pub fn duration(&self) -> f32 {
        self.frames as f32 / self.rate as f32
    }

    /// All frames of track `t`
    pub fn track(&self, t: usize) -> &[Sample] {
        &self.data[t * self.frames..(t + 1) * self.frames]
    }

    /// Copy `out.len()` samples of track `t` starting at `start`, wrapping
    /// into the loop region when `looping`, zero-filling outside the sound
    pub(crate) fn window(&self, t: usize, start: isize, looping: bool, out: &mut [Sample]) {
        let track = self.track(t);
        let loop_len = self.loop_end.saturating_sub(self.loop_start);
        for (i, o) in out.iter_mut().enumerate() {
            let mut pos = start + i as isize;
            if looping && loop_len > 0 && pos >= self.loop_end as isize {
                pos = self.loop_start as isize + (pos - self.loop_start as isize) % loop_len as isize;
            }
            *o = if pos < 0 || pos >= track.len() as isize {
                0
            } else {
                track[pos as usize]
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lane_layout() {
        let mut b = MixBuffer::allocate(2, 48000, 16, 256, 32).unwrap();
        assert_eq!(b.frames(), 256);
        assert_eq!(b.lane(0).len(), 288);
        b.track_mut(1)[0] = 7;
        assert_eq!(b.lane(1)[32], 7);
        assert_eq!(b.lane(0)[32], 0);
    }

    #[test]
    fn frames_never_exceed_capacity() {
        let mut b = MixBuffer::allocate(1, 48000, 16, 64, 0).unwrap();
        b.set_frames(1000);
        assert_eq!(b.frames(), 64);
    }

    #[test]
    fn rejects_empty() {
        assert!(matches!(
            MixBuffer::allocate(0, 48000, 16, 64, 0),
            Err(AllocationError::NoTracks)
        ));
        assert!(matches!(
            MixBuffer::allocate(1, 48000, 16, 0, 0),
            Err(AllocationError::NoFrames)
        ));
    }

    #[test]
    fn widens_to_nominal_range() {
        let pcm = [i16::MAX, i16::MIN, 0];
        let store = SampleStore::from_asset(&AssetSource {
            frequency: 44100,
            channels: 1,
            bits_per_sample: 16,
            loop_start: 0,
            loop_end: 0,
            pcm: Pcm::I16(&pcm),
        })
        .unwrap();
        assert_eq!(store.track(0)[0], (i16::MAX as Sample) << 8);
        assert_eq!(store.track(0)[1], (i16::MIN as Sample) << 8);
    }

    #[test]
    fn deinterleaves() {
        let pcm = [1i32, -1, 2, -2, 3, -3];
        let store = SampleStore::from_asset(&AssetSource {
            frequency: 44100,
            channels: 2,
            bits_per_sample: 24,
            loop_start: 0,
            loop_end: 0,
            pcm: Pcm::I24(&pcm),
        })
        .unwrap();
        assert_eq!(store.track(0), &[1, 2, 3]);
        assert_eq!(store.track(1), &[-1, -2, -3]);
    }

    #[test]
    fn window_wraps_loop() {
        let store = SampleStore::from_asset(&AssetSource {
            frequency: 8,
            channels: 1,
            bits_per_sample: 24,
            loop_start: 2,
            loop_end: 4,
            pcm: Pcm::I24(&[10, 11, 12, 13, 14, 15]),
        })
        .unwrap();
        let mut out = [0; 6];
        store.window(0, 2, true, &mut out);
        assert_eq!(out, [12, 13, 12, 13, 12, 13]);
    }

    #[test]
    fn window_zero_fills_outside() {
        let store = SampleStore::from_frames(8, &[5, 6, 7]);
        let mut out = [99; 5];
        store.window(0, -1, false, &mut out);
        assert_eq!(out, [0, 5, 6, 7, 0]);
    }
}
