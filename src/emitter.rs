//! Sources and the routing graph they are mixed through

use std::collections::VecDeque;
use std::sync::Arc;

use crate::{
    dynamics::Dynamics,
    modulate::{GainChain, PitchChain},
    spatial::{Cone, DistanceParams},
    store::{MixBuffer, SampleStore},
    MAX_TRACKS,
};

/// An independently positioned, pitched, and gained audio stream
///
/// Holds a queue of attached sample buffers, the playback cursor into the
/// current one, and the per-destination-track gain cache that keeps mixing
/// click-free across ticks. Mutated once per scheduler tick while active.
pub struct Emitter {
    pub(crate) store: Arc<SampleStore>,
    queue: VecDeque<Arc<SampleStore>>,
    /// Which source track feeds the mix
    pub(crate) track: usize,
    /// Playback cursor in seconds; negative while a distance delay is still
    /// in flight
    pub(crate) pos_sec: f64,
    pub(crate) playing: bool,
    pub(crate) stopped: bool,
    pub(crate) looping: bool,
    pub(crate) streaming: bool,
    pub(crate) loop_no: u32,
    /// Bounded loop count; `None` loops forever
    pub loop_max: Option<u32>,
    /// Gain each destination track ended the previous tick with
    pub(crate) prev_gain: [f32; MAX_TRACKS],
    /// Remaining release allowance for distance-delayed sources
    pub(crate) delay_sec: f32,
    /// Position in listener space, meters
    pub position: mint::Point3<f32>,
    /// Velocity relative to the listener, m/s
    pub velocity: mint::Vector3<f32>,
    /// Facing direction, used by the audio cone
    pub direction: mint::Vector3<f32>,
    /// Optional directional cone
    pub cone: Option<Cone>,
    /// Distance attenuation settings
    pub distance: DistanceParams,
    /// Pitch modulation chain
    pub pitch: PitchChain,
    /// Gain modulation chain
    pub gain: GainChain,
}

impl Emitter {
    /// Create a stopped emitter playing track 0 of `store`
    pub fn new(store: Arc<SampleStore>) -> Self {
        Self {
            store,
            queue: VecDeque::new(),
            track: 0,
            pos_sec: 0.0,
            playing: false,
            stopped: false,
            looping: false,
            streaming: false,
            loop_no: 0,
            loop_max: None,
            prev_gain: [0.0; MAX_TRACKS],
            delay_sec: 0.0,
            position: [0.0; 3].into(),
            velocity: [0.0; 3].into(),
            direction: [0.0, 0.0, -1.0].into(),
            cone: None,
            distance: DistanceParams::default(),
            pitch: PitchChain::default(),
            gain: GainChain::default(),
        }
    }

    /// Queue another buffer to play after the current one
    pub fn append(&mut self, store: Arc<SampleStore>) {
        self.queue.push_back(store);
        self.streaming = true;
    }

    /// Select which source track feeds the mix
    pub fn set_track(&mut self, track: usize) {
        self.track = track;
    }

    /// Loop the current buffer between its loop points
    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    /// Begin (or resume) playback from the current cursor
    pub fn play(&mut self) {
        self.stopped = false;
    }

    /// Request a stop; the next tick ramps the source out
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Rewind the cursor to the start of the current buffer
    pub fn rewind(&mut self) {
        self.pos_sec = 0.0;
        self.loop_no = 0;
        self.playing = false;
    }

    /// Whether the emitter has produced sound and not yet ramped out
    pub fn is_playing(&self) -> bool {
        self.playing && !self.stopped
    }

    /// Seconds of the current buffer already consumed
    pub fn elapsed(&self) -> f64 {
        self.pos_sec.max(0.0)
    }

    /// Move on to the next queued buffer, if any
    ///
    /// Returns false when the queue is exhausted.
    pub(crate) fn advance_queue(&mut self) -> bool {
        match self.queue.pop_front() {
            Some(next) => {
                self.store = next;
                self.pos_sec = 0.0;
                self.loop_no = 0;
                self.playing = false;
                self.stopped = false;
                self.streaming = !self.queue.is_empty();
                true
            }
            None => false,
        }
    }
}

/// Identifies a registered emitter
///
/// The generation guards against a slot being reused after deregistration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct EmitterId {
    index: u32,
    generation: u32,
}

struct Slot {
    emitter: Option<Emitter>,
    generation: u32,
}

/// Dynamics shaping carried by a bus
pub struct BusDynamics {
    /// Blend between the soft and fully limited curves
    pub mix: f32,
    /// Asymmetry bias
    pub asym: f32,
    pub(crate) state: Dynamics,
}

impl BusDynamics {
    /// Shape a bus with the given curve blend and asymmetry
    pub fn new(mix: f32, asym: f32) -> Self {
        Self {
            mix,
            asym,
            state: Dynamics::new(),
        }
    }
}

/// A routing node aggregating emitters and nested buses
///
/// A bus mixes its members into its own buffer, applies its own dynamics
/// and gain, and is then mixed into its parent like any other source. It
/// may outlive the emitters it aggregates.
pub struct Bus {
    slots: Vec<Slot>,
    free: Vec<usize>,
    children: Vec<Bus>,
    /// Gain applied when this bus is mixed into its parent
    pub gain: f32,
    /// Optional dynamics stage applied to the bus output
    pub dynamics: Option<BusDynamics>,
    pub(crate) prev_gain: [f32; MAX_TRACKS],
    pub(crate) buffer: Option<MixBuffer>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    /// Create an empty bus at unity gain
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            children: Vec::new(),
            gain: 1.0,
            dynamics: None,
            prev_gain: [0.0; MAX_TRACKS],
            buffer: None,
        }
    }

    /// Register `emitter`, returning an id for later control
    pub fn register(&mut self, emitter: Emitter) -> EmitterId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.emitter = Some(emitter);
                EmitterId {
                    index: index as u32,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    emitter: Some(emitter),
                    generation: 0,
                });
                EmitterId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        }
    }

    /// Remove and return the emitter behind `id`, if it is still registered
    pub fn deregister(&mut self, id: EmitterId) -> Option<Emitter> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation || slot.emitter.is_none() {
            return None;
        }
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index as usize);
        slot.emitter.take()
    }

    /// Access a registered emitter
    pub fn emitter_mut(&mut self, id: EmitterId) -> Option<&mut Emitter> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.emitter.as_mut()
    }

    /// Attach a nested bus, returning its index among this bus's children
    pub(crate) fn attach(&mut self, child: Bus) -> usize {
        self.children.push(child);
        self.children.len() - 1
    }

    /// Nested buses
    pub fn children_mut(&mut self) -> &mut [Bus] {
        &mut self.children
    }

    /// Number of live emitters on this bus, nested buses excluded
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.emitter.is_some()).count()
    }

    /// Whether this bus has no live emitters
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn for_each_slot(&mut self, mut f: impl FnMut(&mut Emitter) -> bool) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(em) = slot.emitter.as_mut() {
                if !f(em) {
                    slot.emitter = None;
                    slot.generation = slot.generation.wrapping_add(1);
                    self.free.push(index);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SampleStore;

    fn emitter() -> Emitter {
        Emitter::new(Arc::new(SampleStore::from_frames(8000, &[0; 16])))
    }

    #[test]
    fn ids_survive_unrelated_removals() {
        let mut bus = Bus::new();
        let a = bus.register(emitter());
        let b = bus.register(emitter());
        assert!(bus.deregister(a).is_some());
        assert!(bus.emitter_mut(b).is_some());
        assert!(bus.emitter_mut(a).is_none());
    }

    #[test]
    fn stale_id_misses_reused_slot() {
        let mut bus = Bus::new();
        let a = bus.register(emitter());
        bus.deregister(a);
        let b = bus.register(emitter());
        assert!(bus.emitter_mut(a).is_none());
        assert!(bus.emitter_mut(b).is_some());
        assert!(bus.deregister(a).is_none());
    }

    #[test]
    fn queue_advances_and_exhausts() {
        let mut em = emitter();
        em.append(Arc::new(SampleStore::from_frames(8000, &[1; 16])));
        assert!(em.streaming);
        assert!(em.advance_queue());
        assert!(!em.streaming);
        assert_eq!(em.store.track(0)[0], 1);
        assert!(!em.advance_queue());
    }
}
