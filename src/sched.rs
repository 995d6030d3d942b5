//! Adaptive pacing for timer-driven transports and bounded xrun recovery
//!
//! Timer-driven devices give no ready signal, so the scheduler must guess
//! how long to sleep between ticks and correct the guess from how full the
//! device queue actually is. The controller below implements that
//! correction, plus a slow downward drift that stops the target latency
//! creeping upward over long sessions.

use crate::sink::{DeviceSink, SinkError};

/// Initial queue-fill headroom, in periods, for short-period devices
pub(crate) const FILL_FACTOR: f32 = 1.65;

/// Proportional coefficient; tuned, not load-bearing
const KP: f32 = 1.85;
/// Integral coefficient
const KI: f32 = 0.9;

/// Most prepare-and-restart attempts before an xrun becomes fatal
pub(crate) const XRUN_RETRIES: u32 = 8;

/// Wait-time controller state
///
/// `step` is a pure transition so the controller can be simulated tick by
/// tick without an audio thread; the scheduler threads the returned state
/// through.
#[derive(Debug, Copy, Clone)]
pub struct Pid {
    integral: f32,
    target: f32,
    /// Fill level below which the target is nudged back up
    floor: f32,
    elapsed_ms: f32,
}

impl Pid {
    /// Controller for a transport ticking every `period` seconds
    pub fn new(period: f32) -> Self {
        let floor = if period > 0.02 {
            period + 0.01
        } else {
            period * FILL_FACTOR
        };
        Self {
            integral: 0.0,
            target: floor,
            floor,
            elapsed_ms: 0.0,
        }
    }

    /// Current target queue fill in seconds
    pub fn target(&self) -> f32 {
        self.target
    }

    /// One controller step
    ///
    /// `level` is the device queue fill in seconds after the last write.
    /// Returns the next wait in seconds (always strictly positive) and the
    /// successor state.
    pub fn step(&self, level: f32, period: f32) -> (f32, Pid) {
        let mut next = *self;
        let err = level - self.target;
        next.integral = self.integral + err * period;
        let wait = (period + KP * err + KI * next.integral).max(1e-6);

        next.elapsed_ms += period * 1000.0;
        if level < self.floor {
            // Under-filled: raise the target, gently when it happens rarely
            next.target += 0.001 / next.elapsed_ms.max(1.0);
            next.elapsed_ms = 0.0;
        } else if next.elapsed_ms >= 10_000.0 {
            // Consistently over-filled for ~10 s: let the latency sag
            next.target *= 0.995;
            next.elapsed_ms = 0.0;
        }
        (wait, next)
    }
}

/// Bounded prepare-and-restart protocol after an xrun
///
/// Never loops unboundedly: after [`XRUN_RETRIES`] failed attempts the
/// device is declared unavailable via a fatal driver error.
pub(crate) fn recover(sink: &mut dyn DeviceSink) -> Result<(), SinkError> {
    for attempt in 1..=XRUN_RETRIES {
        match sink.prepare() {
            Ok(()) => {
                if !sink.is_capture() {
                    return Ok(());
                }
                // Capture streams need an explicit restart after prepare
                match sink.start() {
                    Ok(()) => return Ok(()),
                    Err(e) => log::warn!("capture restart failed (attempt {attempt}): {e}"),
                }
            }
            Err(e) => log::warn!("stream prepare failed (attempt {attempt}): {e}"),
        }
    }
    sink.report_error("xrun recovery exhausted");
    Err(SinkError::Driver("xrun recovery exhausted".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{Format, FormatRequest, Param, SinkState, Transport};
    use crate::store::MixBuffer;

    #[test]
    fn wait_stays_positive_and_fill_converges() {
        // Virtual device: drains in real time while the scheduler sleeps
        let period = 1024.0 / 48000.0;
        let mut pid = Pid::new(period);
        let mut fill = period;
        let mut average = 0.0;
        for tick in 0..4000 {
            let (wait, next) = pid.step(fill, period);
            assert!(wait > 0.0, "wait went non-positive at tick {tick}");
            pid = next;
            fill = (fill - wait).max(0.0) + period;
            average = 0.99 * average + 0.01 * fill;
        }
        let err = (average - pid.target()).abs() / pid.target();
        assert!(err < 0.1, "fill {average} never settled near {}", pid.target());
    }

    #[test]
    fn target_sags_when_overfilled() {
        let period = 0.004;
        let mut pid = Pid::new(period);
        let initial = pid.target();
        // Hold the fill well above the floor for more than ten seconds
        for _ in 0..4000 {
            let (_, next) = pid.step(initial * 2.0, period);
            pid = next;
        }
        assert!(pid.target() < initial);
    }

    struct FailingSink {
        prepares: u32,
    }

    impl crate::sink::DeviceSink for FailingSink {
        fn negotiate(&mut self, _: &FormatRequest) -> Result<Format, SinkError> {
            Err(SinkError::Unavailable)
        }
        fn transport(&self) -> Transport {
            Transport::Interrupt
        }
        fn write_frames(
            &mut self,
            _: &MixBuffer,
            _: usize,
            _: f32,
            _: f32,
        ) -> Result<usize, SinkError> {
            Err(SinkError::Xrun)
        }
        fn query(&self, _: Param) -> f32 {
            0.0
        }
        fn set_state(&mut self, _: SinkState) -> bool {
            false
        }
        fn prepare(&mut self) -> Result<(), SinkError> {
            self.prepares += 1;
            Err(SinkError::Driver("persistent fault".into()))
        }
    }

    #[test]
    fn recovery_attempts_are_bounded() {
        let mut sink = FailingSink { prepares: 0 };
        let result = recover(&mut sink);
        assert!(matches!(result, Err(SinkError::Driver(_))));
        assert_eq!(sink.prepares, XRUN_RETRIES);
    }
}
