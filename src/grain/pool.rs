//! Fixed capacity grain arena with a free list.

use crate::{
    grain::{Grain, GrainSpawn, GrainState},
    utils::time::SampleTime,
    VoiceId,
};

// -------------------------------------------------------------------------------------------------

/// What to do when a grain gets requested from a full [`GrainPool`].
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, strum::EnumString, strum::Display, strum::VariantNames,
)]
pub enum OverflowPolicy {
    /// Evict the grain with the earliest start frame in its source. Ties are broken by spawn
    /// time.
    #[default]
    DropOldest,
    /// Evict the grain which got spawned first.
    DropFirstSpawned,
    /// Evict the grain with the least remaining audible contribution.
    StealLowestImpact,
}

// -------------------------------------------------------------------------------------------------

/// Opaque index of an acquired grain slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GrainHandle(usize);

impl GrainHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

// -------------------------------------------------------------------------------------------------

/// A fixed size arena of reusable [`Grain`] slots.
///
/// All memory is allocated up front: acquiring and releasing grains only moves slot indices
/// between a free list and an active list, which both are preallocated with the pool's
/// capacity. When the pool is full, the configured [`OverflowPolicy`] picks an active grain
/// to evict; evictions are counted, not reported as errors.
pub struct GrainPool {
    grains: Box<[Grain]>,
    /// Indices of free slots. Popped from the back.
    free: Vec<usize>,
    /// Indices of active or finishing slots.
    active: Vec<usize>,
    evictions: u64,
}

impl GrainPool {
    /// Create a new pool with the given number of grain slots.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Need at least one grain slot");
        let grains = vec![Grain::new(); capacity].into_boxed_slice();
        // reversed, so the first slots are handed out first
        let free = (0..capacity).rev().collect::<Vec<_>>();
        let active = Vec::with_capacity(capacity);
        Self {
            grains,
            free,
            active,
            evictions: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.grains.len()
    }

    /// Number of slots in the active or finishing state.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Total number of evicted grains since the pool got created.
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Acquire a free slot without evicting anything. Returns `None` when the pool is full.
    pub fn try_acquire(&mut self) -> Option<GrainHandle> {
        let index = self.free.pop()?;
        debug_assert_eq!(self.grains[index].state(), GrainState::Free);
        self.active.push(index);
        Some(GrainHandle(index))
    }

    /// Acquire a slot, evicting an active grain with the given overflow policy when full.
    pub fn acquire(&mut self, policy: OverflowPolicy) -> GrainHandle {
        if let Some(handle) = self.try_acquire() {
            return handle;
        }
        let victim = self.select_victim(policy);
        self.evictions += 1;
        // the evicted slot gets reused in place and stays in the active list
        self.grains[victim].deactivate();
        GrainHandle(victim)
    }

    /// Acquire a slot and activate its grain with the given spawn request.
    pub fn spawn(
        &mut self,
        policy: OverflowPolicy,
        voice: VoiceId,
        spawn_frame: SampleTime,
        spawn: &GrainSpawn,
    ) -> GrainHandle {
        let handle = self.acquire(policy);
        self.grains[handle.0].activate(voice, spawn_frame, spawn);
        handle
    }

    /// Return a slot to the free list.
    pub fn release(&mut self, handle: GrainHandle) {
        if let Some(position) = self.active.iter().position(|&index| index == handle.0) {
            self.active.swap_remove(position);
            self.grains[handle.0].deactivate();
            self.free.push(handle.0);
        }
    }

    /// Release all slots which are no longer playing.
    pub fn release_finished(&mut self) -> usize {
        let mut released = 0;
        let mut position = 0;
        while position < self.active.len() {
            let index = self.active[position];
            if self.grains[index].state() == GrainState::Active {
                position += 1;
            } else {
                self.active.swap_remove(position);
                self.grains[index].deactivate();
                self.free.push(index);
                released += 1;
            }
        }
        released
    }

    /// Immediately release all grains which belong to the given voice.
    pub fn release_voice(&mut self, voice: VoiceId) {
        for &index in &self.active {
            if self.grains[index].voice() == voice {
                self.grains[index].finish();
            }
        }
        self.release_finished();
    }

    /// Number of active grains of the given voice.
    pub fn active_count_of(&self, voice: VoiceId) -> usize {
        self.active
            .iter()
            .filter(|&&index| {
                let grain = &self.grains[index];
                grain.is_active() && grain.voice() == voice
            })
            .count()
    }

    pub fn get(&self, handle: GrainHandle) -> &Grain {
        &self.grains[handle.0]
    }

    pub fn get_mut(&mut self, handle: GrainHandle) -> &mut Grain {
        &mut self.grains[handle.0]
    }

    /// Iterate over handles of all active or finishing grains.
    pub fn active_handles(&self) -> impl Iterator<Item = GrainHandle> + '_ {
        self.active.iter().map(|&index| GrainHandle(index))
    }

    /// Mutable access to all active grains of the given voice.
    pub(crate) fn for_each_active_of<F>(&mut self, voice: VoiceId, mut f: F)
    where
        F: FnMut(&mut Grain),
    {
        for &index in &self.active {
            let grain = &mut self.grains[index];
            if grain.is_active() && grain.voice() == voice {
                f(grain);
            }
        }
    }

    fn select_victim(&self, policy: OverflowPolicy) -> usize {
        debug_assert!(!self.active.is_empty(), "Pool is full but has no active grains");
        let grains = &self.grains;
        let victim = match policy {
            OverflowPolicy::DropOldest => self.active.iter().copied().min_by(|&a, &b| {
                let (a, b) = (&grains[a], &grains[b]);
                a.start_frame()
                    .total_cmp(&b.start_frame())
                    .then(a.spawn_frame().cmp(&b.spawn_frame()))
            }),
            OverflowPolicy::DropFirstSpawned => self.active.iter().copied().min_by(|&a, &b| {
                let (a, b) = (&grains[a], &grains[b]);
                a.spawn_frame()
                    .cmp(&b.spawn_frame())
                    .then(a.start_frame().total_cmp(&b.start_frame()))
            }),
            OverflowPolicy::StealLowestImpact => self
                .active
                .iter()
                .copied()
                .min_by(|&a, &b| grains[a].remaining_impact().total_cmp(&grains[b].remaining_impact())),
        };
        victim.unwrap_or(self.active[0])
    }
}

// -------------------------------------------------------------------------------------------------
