//! The per-device mix graph and its tick entry point

use crate::{
    dynamics::Dynamics,
    emitter::{Bus, Emitter, EmitterId},
    mix::{mix_emitter, MixOutcome, RenderMode, Scratch},
    sink::{Config, Format},
    spatial::{prepare, Scene, SpeakerLayout},
    store::{AllocationError, MixBuffer},
    Sample,
};

/// Lookahead kept ahead of every ring buffer, in seconds, for time-delay
/// effects and negative head-delay offsets
const PRE_DELAY_TIME: f32 = 0.070;

/// Owns the destination ring buffer and the graph of sources mixed into it
///
/// The scheduler thread drives [`render_tick`](Mixer::render_tick); a
/// control thread reaches the graph through the same mutex the scheduler
/// holds during a tick, so the buffer itself is never shared.
pub struct Mixer {
    buffer: MixBuffer,
    scratch: Scratch,
    dynamics: Dynamics,
    mode: RenderMode,
    layout: SpeakerLayout,
    root: Bus,
    /// Scene-wide propagation parameters
    pub scene: Scene,
    /// Output gain handed to the device sink
    pub master_gain: f32,
    /// Output pitch handed to the device sink
    pub master_pitch: f32,
    /// Dynamics blend between the soft and fully limited curves
    pub dynamics_mix: f32,
    /// Dynamics asymmetry bias
    pub dynamics_asym: f32,
}

impl Mixer {
    /// Build a mixer sized for the granted device format
    pub fn new(config: &Config, format: &Format) -> Result<Self, AllocationError> {
        let pre_delay = (PRE_DELAY_TIME * format.rate as f32).ceil() as usize;
        let buffer = MixBuffer::allocate(
            format.tracks,
            format.rate,
            format.bits_per_sample,
            format.period_frames.max(1),
            pre_delay,
        )?;
        Ok(Self {
            scratch: Scratch::new(buffer.pre_delay(), buffer.capacity()),
            buffer,
            dynamics: Dynamics::new(),
            mode: config.mode,
            layout: SpeakerLayout::stereo(),
            root: Bus::new(),
            scene: Scene::default(),
            master_gain: 1.0,
            master_pitch: 1.0,
            dynamics_mix: 0.5,
            dynamics_asym: 0.0,
        })
    }

    /// Register an emitter on the root bus
    pub fn register(&mut self, emitter: Emitter) -> EmitterId {
        self.root.register(emitter)
    }

    /// Remove an emitter from the root bus
    pub fn deregister(&mut self, id: EmitterId) -> Option<Emitter> {
        self.root.deregister(id)
    }

    /// Access an emitter on the root bus
    pub fn emitter_mut(&mut self, id: EmitterId) -> Option<&mut Emitter> {
        self.root.emitter_mut(id)
    }

    /// Attach a nested bus, allocating its buffer at the device format
    ///
    /// Returns the child's index under the root bus.
    pub fn attach_bus(&mut self, mut bus: Bus) -> Result<usize, AllocationError> {
        bus.buffer = Some(MixBuffer::allocate(
            self.buffer.tracks(),
            self.buffer.rate(),
            self.buffer.bits_per_sample(),
            self.buffer.capacity(),
            self.buffer.pre_delay(),
        )?);
        Ok(self.root.attach(bus))
    }

    /// The root routing node
    pub fn root_mut(&mut self) -> &mut Bus {
        &mut self.root
    }

    /// Replace the speaker geometry
    pub fn set_layout(&mut self, layout: SpeakerLayout) {
        self.layout = layout;
    }

    /// The mixed output of the most recent tick
    pub fn buffer(&self) -> &MixBuffer {
        &self.buffer
    }

    /// Peak magnitude of the last tick, from the dynamics stage
    pub fn peak(&self) -> f32 {
        self.dynamics.peak()
    }

    /// RMS level of the last tick, from the dynamics stage
    pub fn rms(&self) -> f32 {
        self.dynamics.rms()
    }

    /// Reallocate for a changed device format
    ///
    /// Only legal between ticks; existing bus buffers are resized along
    /// with the destination.
    pub fn reformat(&mut self, format: &Format) -> Result<(), AllocationError> {
        let pre_delay = (PRE_DELAY_TIME * format.rate as f32).ceil() as usize;
        self.buffer.resize(
            format.tracks,
            format.rate,
            format.period_frames.max(1),
            pre_delay,
        )?;
        self.scratch = Scratch::new(pre_delay, self.buffer.capacity());
        for child in self.root.children_mut() {
            if let Some(buf) = child.buffer.as_mut() {
                buf.resize(format.tracks, format.rate, format.period_frames.max(1), pre_delay)?;
            }
        }
        Ok(())
    }

    /// Run one mix tick: resample and mix every live source, then shape the
    /// result with the dynamics stage
    ///
    /// Returns the number of frames rendered.
    pub fn render_tick(&mut self) -> usize {
        self.buffer.clear();
        render_bus(
            &mut self.root,
            &mut self.buffer,
            &mut self.scratch,
            self.mode,
            &self.layout,
            &self.scene,
        );
        for t in 0..self.buffer.tracks() {
            let mix = self.dynamics_mix;
            let asym = self.dynamics_asym;
            self.dynamics.process(self.buffer.track_mut(t), mix, asym);
        }
        self.buffer.frames()
    }
}

fn render_bus(
    bus: &mut Bus,
    dest: &mut MixBuffer,
    scratch: &mut Scratch,
    mode: RenderMode,
    layout: &SpeakerLayout,
    scene: &Scene,
) {
    let rate = dest.rate();
    bus.for_each_slot(|em| {
        let placement = prepare(em, layout, mode, scene, rate);
        match mix_emitter(dest, scratch, em, &placement, mode) {
            // A finished buffer hands over to the next queued one; an empty
            // queue retires the emitter
            MixOutcome::Finished => em.advance_queue(),
            _ => true,
        }
    });
    for child in bus.children_mut() {
        let Some(mut buf) = child.buffer.take() else {
            continue;
        };
        buf.clear();
        render_bus(child, &mut buf, scratch, mode, layout, scene);
        if let Some(d) = child.dynamics.as_mut() {
            for t in 0..buf.tracks() {
                d.state.process(buf.track_mut(t), d.mix, d.asym);
            }
        }
        mix_bus_into(dest, &buf, child.gain, &mut child.prev_gain);
        child.buffer = Some(buf);
    }
}

/// Mix a child bus's buffer into its parent under the same click-free ramp
/// emitters get
fn mix_bus_into(dest: &mut MixBuffer, src: &MixBuffer, gain: f32, prev_gain: &mut [f32]) {
    let frames = dest.frames().min(src.frames());
    if frames == 0 {
        return;
    }
    for t in 0..dest.tracks().min(src.tracks()) {
        let vstart = prev_gain[t];
        let vstep = (gain - vstart) / frames as f32;
        let s = src.track(t);
        let mut v = vstart;
        for (d, &x) in dest.track_mut(t).iter_mut().zip(s.iter()).take(frames) {
            *d = d.saturating_add((x as f32 * v) as Sample);
            v += vstep;
        }
        prev_gain[t] = gain;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SampleStore;
    use std::sync::Arc;

    fn test_mixer() -> Mixer {
        let format = Format {
            rate: 8000,
            tracks: 2,
            bits_per_sample: 16,
            period_frames: 64,
        };
        Mixer::new(&Config::default(), &format).unwrap()
    }

    fn dc_emitter(value: Sample, frames: usize) -> Emitter {
        let store = Arc::new(SampleStore::from_frames(8000, &vec![value; frames]));
        let mut em = Emitter::new(store);
        em.play();
        em
    }

    #[test]
    fn renders_registered_emitter() {
        let mut mixer = test_mixer();
        mixer.register(dc_emitter(1 << 16, 8000));
        let frames = mixer.render_tick();
        assert_eq!(frames, 64);
        // Stereo at the origin: both tracks get signal by the end of the
        // onset ramp
        assert!(mixer.buffer().track(0)[63] > 0);
        assert!(mixer.buffer().track(1)[63] > 0);
    }

    #[test]
    fn finished_emitters_retire() {
        let mut mixer = test_mixer();
        let id = mixer.register(dc_emitter(1 << 16, 16));
        for _ in 0..8 {
            mixer.render_tick();
        }
        assert!(mixer.emitter_mut(id).is_none());
    }

    #[test]
    fn queued_buffer_takes_over() {
        let mut mixer = test_mixer();
        let mut em = dc_emitter(1 << 16, 16);
        em.append(Arc::new(SampleStore::from_frames(8000, &[2 << 16; 8000])));
        let id = mixer.register(em);
        for _ in 0..8 {
            mixer.render_tick();
        }
        // First buffer is long gone; the queued one keeps the slot alive
        let em = mixer.emitter_mut(id).expect("queued buffer keeps playing");
        assert_eq!(em.store.track(0)[0], 2 << 16);
    }

    #[test]
    fn nested_bus_mixes_into_parent() {
        let mut mixer = test_mixer();
        let mut bus = Bus::new();
        bus.gain = 0.5;
        bus.register(dc_emitter(1 << 16, 8000));
        mixer.attach_bus(bus).unwrap();
        mixer.render_tick();
        mixer.render_tick();
        assert!(mixer.buffer().track(0)[32] > 0);
    }

    #[test]
    fn metering_follows_output() {
        let mut mixer = test_mixer();
        mixer.register(dc_emitter(1 << 20, 8000));
        mixer.render_tick();
        assert!(mixer.peak() > 0.0);
        assert!(mixer.rms() > 0.0);
    }
}
