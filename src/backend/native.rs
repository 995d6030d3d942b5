//! Native audio output through cpal
//!
//! cpal pulls data from its own callback thread, so this sink is
//! timer-driven from the scheduler's point of view: the scheduler pushes
//! mixed frames into a lock-protected sample queue, the device callback
//! drains it, and the only other state crossing the thread boundary is a
//! pair of atomically-updated meters.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::sink::{DeviceSink, Format, FormatRequest, Param, SinkError, SinkState, Transport};
use crate::store::MixBuffer;

/// Periods of audio the hand-off queue may hold before writes are clipped
const QUEUE_PERIODS: usize = 4;

struct Shared {
    samples: Mutex<VecDeque<i16>>,
    /// Callback starvation events
    underruns: AtomicUsize,
    /// Output peak, f32 bits
    peak: AtomicU32,
}

enum StreamCmd {
    Pause,
    Resume,
    Quit,
}

/// Callback-driven sink over the default host
pub struct NativeSink {
    device_name: Option<String>,
    shared: Arc<Shared>,
    format: Option<Format>,
    control: Option<mpsc::Sender<StreamCmd>>,
    owner: Option<thread::JoinHandle<()>>,
    latency: f32,
    queue_cap: usize,
}

impl NativeSink {
    /// Capability probe: available only when the host has an output device
    pub fn detect(config: &crate::sink::Config) -> Option<Self> {
        let host = cpal::default_host();
        host.default_output_device()?;
        Some(Self {
            device_name: config.device.clone(),
            shared: Arc::new(Shared {
                samples: Mutex::new(VecDeque::new()),
                underruns: AtomicUsize::new(0),
                peak: AtomicU32::new(0),
            }),
            format: None,
            control: None,
            owner: None,
            latency: 0.0,
            queue_cap: 0,
        })
    }

    fn find_device(&self) -> Result<cpal::Device, SinkError> {
        let host = cpal::default_host();
        match &self.device_name {
            None => host.default_output_device().ok_or(SinkError::Unavailable),
            Some(name) => host
                .output_devices()
                .map_err(|e| SinkError::Driver(e.to_string()))?
                .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                .ok_or(SinkError::Unavailable),
        }
    }

    /// Callback starvation events since the stream started
    pub fn underruns(&self) -> usize {
        self.shared.underruns.load(Ordering::Relaxed)
    }

    /// Peak output magnitude seen by the device callback, in device units
    pub fn peak(&self) -> f32 {
        f32::from_bits(self.shared.peak.load(Ordering::Relaxed))
    }
}

fn drain<T: cpal::Sample + cpal::FromSample<i16>>(shared: &Shared, data: &mut [T]) {
    let mut queue = shared.samples.lock().unwrap();
    let mut peak = 0i16;
    let mut starved = false;
    for out in data.iter_mut() {
        match queue.pop_front() {
            Some(s) => {
                peak = peak.max(s.saturating_abs());
                *out = T::from_sample(s);
            }
            None => {
                starved = true;
                *out = T::from_sample(0i16);
            }
        }
    }
    drop(queue);
    if starved {
        shared.underruns.fetch_add(1, Ordering::Relaxed);
    }
    shared
        .peak
        .store((peak as f32).to_bits(), Ordering::Relaxed);
}

impl DeviceSink for NativeSink {
    fn negotiate(&mut self, request: &FormatRequest) -> Result<Format, SinkError> {
        let device = self.find_device()?;
        let default = device
            .default_output_config()
            .map_err(|e| SinkError::Negotiation(e.to_string()))?;
        let rate = default.sample_rate().0;
        let tracks = (default.channels() as usize).min(crate::MAX_TRACKS);
        let sample_format = default.sample_format();
        let period_frames = ((request.latency * rate as f32) as usize).max(64);
        let config = cpal::StreamConfig {
            channels: tracks as u16,
            sample_rate: cpal::SampleRate(rate),
            buffer_size: cpal::BufferSize::Default,
        };

        // The stream object never leaves the thread that builds it; the
        // scheduler only ever talks to the queue and this command channel
        let (cmd_tx, cmd_rx) = mpsc::channel::<StreamCmd>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();
        let shared = self.shared.clone();
        let owner = thread::Builder::new()
            .name("resona-stream".into())
            .spawn(move || {
                let err_fn = |e| log::warn!("output stream error: {e}");
                let built = match sample_format {
                    cpal::SampleFormat::F32 => device.build_output_stream(
                        &config,
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            drain(&shared, data)
                        },
                        err_fn,
                        None,
                    ),
                    cpal::SampleFormat::I16 => device.build_output_stream(
                        &config,
                        move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                            drain(&shared, data)
                        },
                        err_fn,
                        None,
                    ),
                    other => {
                        let _ = ready_tx.send(Err(format!("unsupported sample format {other}")));
                        return;
                    }
                };
                match built {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        loop {
                            match cmd_rx.recv() {
                                Ok(StreamCmd::Pause) => {
                                    if let Err(e) = stream.pause() {
                                        log::warn!("stream pause failed: {e}");
                                    }
                                }
                                Ok(StreamCmd::Resume) => {
                                    if let Err(e) = stream.play() {
                                        log::warn!("stream resume failed: {e}");
                                    }
                                }
                                Ok(StreamCmd::Quit) | Err(_) => break,
                            }
                        }
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                    }
                }
            })
            .map_err(|e| SinkError::Driver(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| SinkError::Driver("stream thread died".into()))?
            .map_err(SinkError::Negotiation)?;

        self.control = Some(cmd_tx);
        self.owner = Some(owner);
        self.queue_cap = QUEUE_PERIODS * period_frames * tracks;
        self.latency = QUEUE_PERIODS as f32 * period_frames as f32 / rate as f32;
        let format = Format {
            rate,
            tracks,
            bits_per_sample: 16,
            period_frames,
        };
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
        let tracks = format.tracks.min(buffer.tracks());
        let mut queue = self.shared.samples.lock().unwrap();
        let space = self.queue_cap.saturating_sub(queue.len()) / format.tracks;
        let accepted = frames.min(space);
        for i in 0..accepted {
            for t in 0..format.tracks {
                let wide = (buffer.track(t.min(tracks - 1))[i] as f32 * gain) as i32;
                queue.push_back((wide >> 8).clamp(i16::MIN as i32, i16::MAX as i32) as i16);
            }
        }
        Ok(accepted)
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
            Param::SampleDelay => {
                let queued = self.shared.samples.lock().unwrap().len();
                let tracks = self.format.map(|f| f.tracks).unwrap_or(1).max(1);
                (queued / tracks) as f32
            }
        }
    }

    fn set_state(&mut self, state: SinkState) -> bool {
        let cmd = match state {
            SinkState::Pause => StreamCmd::Pause,
            SinkState::Resume => StreamCmd::Resume,
        };
        match &self.control {
            Some(tx) => tx.send(cmd).is_ok(),
            None => false,
        }
    }

    fn prepare(&mut self) -> Result<(), SinkError> {
        self.shared.samples.lock().unwrap().clear();
        self.shared.underruns.store(0, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for NativeSink {
    fn drop(&mut self) {
        if let Some(tx) = self.control.take() {
            let _ = tx.send(StreamCmd::Quit);
        }
        if let Some(owner) = self.owner.take() {
            let _ = owner.join();
        }
    }
}
