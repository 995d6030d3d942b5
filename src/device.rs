//! The real-time device thread and its control surface
//!
//! Every opened device gets one dedicated thread running the scheduler
//! loop; the owning (control) thread only ever touches a mutex-guarded
//! state flag and a condition variable, never ring-buffer memory. The mix
//! graph is reached through its own mutex, held by the scheduler for
//! exactly one tick at a time.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::{
    mixer::Mixer,
    sched::{recover, Pid},
    sink::{Config, DeviceSink, Format, Param, SinkError, SinkState, Transport},
    store::AllocationError,
};

/// Errors opening or running a device
#[derive(Debug, Error)]
pub enum EngineError {
    /// The transport failed
    #[error(transparent)]
    Sink(#[from] SinkError),
    /// Buffer storage could not be obtained
    #[error(transparent)]
    Allocation(#[from] AllocationError),
}

/// Scheduler states
///
/// `Suspended → Playing ⇄ Paused/Standby → Suspended`; teardown is
/// terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PlaybackState {
    /// Device opened but not yet started
    Suspended,
    /// Idle but ready; the thread dozes on the standby interval
    Standby,
    /// Temporarily halted by the application
    Paused,
    /// Actively mixing and feeding the device
    Playing,
}

struct Control {
    state: PlaybackState,
    started: bool,
}

struct Shared {
    control: Mutex<Control>,
    cond: Condvar,
}

/// An opened audio device with its real-time mix thread
pub struct Device {
    shared: Arc<Shared>,
    mixer: Arc<Mutex<Mixer>>,
    thread: Option<thread::JoinHandle<Result<(), SinkError>>>,
}

impl Device {
    /// Negotiate a format with `sink` and start the device thread
    ///
    /// The thread starts suspended; call [`play`](Device::play) to begin
    /// rendering. Negotiation failure is fatal for this device instance.
    pub fn open(config: Config, mut sink: Box<dyn DeviceSink>) -> Result<Self, EngineError> {
        let format = sink.negotiate(&config.request())?;
        log::info!(
            "device opened: {} Hz, {} tracks, {} bits, period {} frames, latency {:.1} ms",
            format.rate,
            format.tracks,
            format.bits_per_sample,
            format.period_frames,
            1e3 * sink.query(Param::Latency),
        );
        let mixer = Arc::new(Mutex::new(Mixer::new(&config, &format)?));
        let shared = Arc::new(Shared {
            control: Mutex::new(Control {
                state: PlaybackState::Suspended,
                started: true,
            }),
            cond: Condvar::new(),
        });
        let thread = {
            let shared = shared.clone();
            let mixer = mixer.clone();
            thread::Builder::new()
                .name("resona-mix".into())
                .spawn(move || run(shared, mixer, sink, format))
                .map_err(|e| SinkError::Driver(format!("mix thread spawn failed: {e}")))?
        };
        Ok(Self {
            shared,
            mixer,
            thread: Some(thread),
        })
    }

    /// The mix graph fed to this device
    ///
    /// Lock it to register emitters or adjust parameters; the lock is only
    /// ever held by the scheduler for the duration of one tick.
    pub fn mixer(&self) -> &Arc<Mutex<Mixer>> {
        &self.mixer
    }

    /// Start or resume rendering
    pub fn play(&self) {
        self.set_state(PlaybackState::Playing);
    }

    /// Halt rendering, keeping all sources registered
    pub fn pause(&self) {
        self.set_state(PlaybackState::Paused);
    }

    /// Drop to standby: idle, but ready to resume immediately
    pub fn standby(&self) {
        self.set_state(PlaybackState::Standby);
    }

    /// Current scheduler state
    pub fn state(&self) -> PlaybackState {
        self.shared.control.lock().unwrap().state
    }

    fn set_state(&self, state: PlaybackState) {
        let mut guard = self.shared.control.lock().unwrap();
        guard.state = state;
        self.shared.cond.notify_all();
    }

    /// Stop the device thread and surface any failure it died with
    pub fn close(mut self) -> Result<(), SinkError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), SinkError> {
        {
            let mut guard = self.shared.control.lock().unwrap();
            guard.started = false;
        }
        self.shared.cond.notify_all();
        match self.thread.take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(SinkError::Driver("mix thread panicked".into()))),
            None => Ok(()),
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("device teardown: {e}");
        }
    }
}

fn run(
    shared: Arc<Shared>,
    mixer: Arc<Mutex<Mixer>>,
    mut sink: Box<dyn DeviceSink>,
    format: Format,
) -> Result<(), SinkError> {
    let period = format.period();
    let standby = Duration::from_secs_f32(period.max(0.001));
    let mut pid = Pid::new(period);
    let mut wait = Duration::from_secs_f32(period);
    let mut sink_state = PlaybackState::Suspended;
    sink.set_state(SinkState::Pause);

    loop {
        // Cooperative cancellation, checked under the lock every iteration
        let state = {
            let guard = shared.control.lock().unwrap();
            if !guard.started {
                break;
            }
            guard.state
        };

        if state == PlaybackState::Playing {
            match sink.transport() {
                Transport::Timer => thread::sleep(wait),
                Transport::Interrupt => {
                    // Block on the device-ready signal; a stuck device must
                    // not stall the loop longer than two ticks
                    if let Err(e) = sink.wait_ready(2 * standby) {
                        log::warn!("device wait failed: {e}");
                        recover(sink.as_mut())?;
                    }
                }
            }
        } else {
            let guard = shared.control.lock().unwrap();
            if !guard.started {
                break;
            }
            let _ = shared.cond.wait_timeout(guard, standby).unwrap();
        }

        let state = {
            let guard = shared.control.lock().unwrap();
            if !guard.started {
                break;
            }
            guard.state
        };
        if state != sink_state {
            log::debug!("playback state: {sink_state:?} -> {state:?}");
            sink.set_state(if state == PlaybackState::Playing {
                SinkState::Resume
            } else {
                SinkState::Pause
            });
            sink_state = state;
        }

        if state == PlaybackState::Playing {
            {
                let mut m = mixer.lock().unwrap();
                let frames = m.render_tick();
                match sink.write_frames(m.buffer(), frames, m.master_pitch, m.master_gain) {
                    Ok(_accepted) => {}
                    Err(SinkError::Xrun) => {
                        log::debug!("xrun on write, recovering");
                        recover(sink.as_mut())?;
                    }
                    Err(e) => {
                        sink.report_error(&e.to_string());
                        return Err(e);
                    }
                }
            }
            if sink.transport() == Transport::Timer {
                let level = sink.query(Param::SampleDelay) / format.rate as f32;
                let (w, next) = pid.step(level, period);
                pid = next;
                wait = Duration::from_secs_f32(w);
            }
        }
    }

    sink.set_state(SinkState::Pause);
    Ok(())
}
