//! Read only engine status, published by the render thread for control surfaces.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering},
    Arc,
};

use crate::{
    voice::{Voice, VoiceState},
    watchdog::{CpuLoad, LoadMeter},
    VoiceId,
};

// -------------------------------------------------------------------------------------------------

/// Counters of conditions the engine absorbs instead of failing.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Grains evicted from a full grain pool.
    pub evicted_grains: AtomicU64,
    /// Control events dropped because the event queue was full.
    pub dropped_events: AtomicU64,
    /// Control events postponed to a later callback because of the per callback budget.
    /// Each event is counted once, no matter how many callbacks it waits.
    pub deferred_events: AtomicU64,
    /// Control events which failed to apply.
    pub rejected_events: AtomicU64,
    /// Voice renders which failed and got replaced by silence.
    pub render_faults: AtomicU64,
}

impl EngineStats {
    #[inline]
    pub(crate) fn increment(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }
}

// -------------------------------------------------------------------------------------------------

#[derive(Debug, Default)]
struct VoiceStatusSlot {
    state: AtomicU8,
    pending: AtomicBool,
    active_grains: AtomicUsize,
}

/// Lock free board of atomics the render thread publishes its state to.
///
/// Only the render thread writes to the board. Readers get a consistent enough view for
/// display purposes via [`StatusReader::snapshot`].
#[derive(Debug)]
pub struct StatusBoard {
    bpm: AtomicU64,
    beat_position: AtomicU64,
    beats_per_bar: AtomicU32,
    total_frames: AtomicU64,
    density_scale: AtomicU32,
    active_grains: AtomicUsize,
    grain_capacity: AtomicUsize,
    voice_count: AtomicUsize,
    voices: Box<[VoiceStatusSlot]>,
    load: LoadMeter,
    stats: EngineStats,
}

impl StatusBoard {
    pub(crate) fn new(max_voices: usize, grain_capacity: usize) -> Self {
        Self {
            bpm: AtomicU64::new(0),
            beat_position: AtomicU64::new(0),
            beats_per_bar: AtomicU32::new(4),
            total_frames: AtomicU64::new(0),
            density_scale: AtomicU32::new(1.0_f32.to_bits()),
            active_grains: AtomicUsize::new(0),
            grain_capacity: AtomicUsize::new(grain_capacity),
            voice_count: AtomicUsize::new(0),
            voices: (0..max_voices).map(|_| VoiceStatusSlot::default()).collect(),
            load: LoadMeter::new(),
            stats: EngineStats::default(),
        }
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn load(&self) -> &LoadMeter {
        &self.load
    }

    pub(crate) fn publish_clock(
        &self,
        bpm: f64,
        beat_position: f64,
        beats_per_bar: u32,
        total_frames: u64,
    ) {
        self.bpm.store(bpm.to_bits(), Ordering::Relaxed);
        self.beat_position
            .store(beat_position.to_bits(), Ordering::Relaxed);
        self.beats_per_bar.store(beats_per_bar, Ordering::Relaxed);
        self.total_frames.store(total_frames, Ordering::Relaxed);
    }

    pub(crate) fn publish_grains(&self, active_grains: usize, density_scale: f32) {
        self.active_grains.store(active_grains, Ordering::Relaxed);
        self.density_scale
            .store(density_scale.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn publish_voice(&self, voice: &Voice, active_grains: usize) {
        if let Some(slot) = self.voices.get(voice.id()) {
            slot.state.store(voice.state() as u8, Ordering::Relaxed);
            slot.pending.store(voice.is_pending(), Ordering::Relaxed);
            slot.active_grains.store(active_grains, Ordering::Relaxed);
        }
    }

    pub(crate) fn set_voice_count(&self, count: usize) {
        self.voice_count
            .store(count.min(self.voices.len()), Ordering::Release);
    }
}

// -------------------------------------------------------------------------------------------------

/// Status of a single voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceStatus {
    pub id: VoiceId,
    pub state: VoiceState,
    /// Waits for a quantized start, restart or resync.
    pub pending: bool,
    pub active_grains: usize,
}

/// Owned status snapshot of the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub bpm: f64,
    pub beat_position: f64,
    pub beats_per_bar: u32,
    pub total_frames: u64,
    pub cpu_load: CpuLoad,
    /// Current grain density scale, as set by the watchdog.
    pub density_scale: f32,
    pub active_grains: usize,
    pub grain_capacity: usize,
    pub voices: Vec<VoiceStatus>,
    pub evicted_grains: u64,
    pub dropped_events: u64,
    pub deferred_events: u64,
    pub rejected_events: u64,
    pub render_faults: u64,
}

impl EngineStatus {
    /// True when the watchdog throttles grain density because the render callback is at risk
    /// to miss its deadline.
    pub fn is_throttled(&self) -> bool {
        self.density_scale < 1.0
    }

    /// Current bar, counting from 0.
    pub fn bar(&self) -> u64 {
        (self.beat_position / self.beats_per_bar.max(1) as f64) as u64
    }
}

// -------------------------------------------------------------------------------------------------

/// Cloneable, read only access to the engine's [`StatusBoard`].
#[derive(Debug, Clone)]
pub struct StatusReader {
    board: Arc<StatusBoard>,
}

impl StatusReader {
    pub(crate) fn new(board: Arc<StatusBoard>) -> Self {
        Self { board }
    }

    /// Take a snapshot of the current engine state.
    pub fn snapshot(&self) -> EngineStatus {
        let board = &self.board;
        let voice_count = board.voice_count.load(Ordering::Acquire);
        let voices = board.voices[..voice_count]
            .iter()
            .enumerate()
            .map(|(id, slot)| VoiceStatus {
                id,
                state: VoiceState::from_u8(slot.state.load(Ordering::Relaxed)),
                pending: slot.pending.load(Ordering::Relaxed),
                active_grains: slot.active_grains.load(Ordering::Relaxed),
            })
            .collect();
        let stats = &board.stats;
        EngineStatus {
            bpm: f64::from_bits(board.bpm.load(Ordering::Relaxed)),
            beat_position: f64::from_bits(board.beat_position.load(Ordering::Relaxed)),
            beats_per_bar: board.beats_per_bar.load(Ordering::Relaxed),
            total_frames: board.total_frames.load(Ordering::Relaxed),
            cpu_load: board.load.cpu_load(),
            density_scale: f32::from_bits(board.density_scale.load(Ordering::Relaxed)),
            active_grains: board.active_grains.load(Ordering::Relaxed),
            grain_capacity: board.grain_capacity.load(Ordering::Relaxed),
            voices,
            evicted_grains: stats.evicted_grains.load(Ordering::Relaxed),
            dropped_events: stats.dropped_events.load(Ordering::Relaxed),
            deferred_events: stats.deferred_events.load(Ordering::Relaxed),
            rejected_events: stats.rejected_events.load(Ordering::Relaxed),
            render_faults: stats.render_faults.load(Ordering::Relaxed),
        }
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot() {
        let board = Arc::new(StatusBoard::new(4, 128));
        let reader = StatusReader::new(Arc::clone(&board));
        board.publish_clock(120.0, 9.5, 4, 48000);
        board.publish_grains(12, 0.8);
        board.set_voice_count(2);
        EngineStats::increment(&board.stats().dropped_events, 3);

        let status = reader.snapshot();
        assert_eq!(status.bpm, 120.0);
        assert_eq!(status.bar(), 2);
        assert_eq!(status.total_frames, 48000);
        assert_eq!(status.active_grains, 12);
        assert_eq!(status.grain_capacity, 128);
        assert!(status.is_throttled());
        assert_eq!(status.dropped_events, 3);
        assert_eq!(status.voices.len(), 2);
        assert_eq!(status.voices[1].state, VoiceState::Stopped);

        // voice count gets clamped to the board's capacity
        board.set_voice_count(10);
        assert_eq!(reader.snapshot().voices.len(), 4);
    }
}
