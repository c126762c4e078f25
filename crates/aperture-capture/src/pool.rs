//! Fixed arena of frame-buffer slots.
//!
//! Every slot moves through `Free -> Filling -> Ready -> CheckedOut -> Free`.
//! Under [`GrabPolicy::Latest`] a `Ready` slot may also be recycled straight
//! back to `Filling`/`Free` when a newer frame supersedes it. Handles carry a
//! generation so a stale or duplicated check-in is rejected without touching
//! the slot.

use std::mem;

use aperture_types::{config::GrabPolicy, frame::Frame, status::PoolOccupancy};
use chrono::Utc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHandle {
    index: usize,
    generation: u64,
}

impl SlotHandle {
    pub fn index(&self) -> usize {
        self.index
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("slot {0} does not exist")]
    UnknownSlot(usize),
    #[error("slot {0} is not checked out")]
    NotCheckedOut(usize),
    #[error("slot {0} is not being filled")]
    NotFilling(usize),
    #[error("handle for slot {0} is stale")]
    StaleHandle(usize),
}

enum SlotState {
    Free(Vec<u8>),
    Filling,
    Ready(Frame),
    CheckedOut,
}

struct Slot {
    state: SlotState,
    generation: u64,
}

pub struct SlotPool {
    slots: Vec<Slot>,
    policy: GrabPolicy,
    next_sequence: u64,
    dropped: u64,
}

impl SlotPool {
    pub fn new(capacity: usize, policy: GrabPolicy, buffer_hint: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                state: SlotState::Free(Vec::with_capacity(buffer_hint)),
                generation: 0,
            })
            .collect();
        Self {
            slots,
            policy,
            next_sequence: 1,
            dropped: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn policy(&self) -> GrabPolicy {
        self.policy
    }

    /// Frames recycled before any consumer saw them.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn outstanding(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.state, SlotState::CheckedOut))
            .count()
    }

    pub fn occupancy(&self) -> PoolOccupancy {
        let mut occupancy = PoolOccupancy {
            capacity: self.slots.len(),
            ..Default::default()
        };
        for slot in &self.slots {
            match slot.state {
                SlotState::Free(_) => occupancy.free += 1,
                SlotState::Filling => occupancy.filling += 1,
                SlotState::Ready(_) => occupancy.ready += 1,
                SlotState::CheckedOut => occupancy.checked_out += 1,
            }
        }
        occupancy
    }

    /// Claim a slot for the next capture.
    ///
    /// Prefers a free slot. Under `Latest`, the oldest unconsumed frame is
    /// sacrificed when nothing is free.
    pub fn begin_fill(&mut self) -> Option<(SlotHandle, Vec<u8>)> {
        let index = match self.position(|state| matches!(state, SlotState::Free(_))) {
            Some(index) => index,
            None if self.policy == GrabPolicy::Latest => {
                let index = self.oldest_ready()?;
                self.dropped += 1;
                index
            }
            None => return None,
        };

        let slot = &mut self.slots[index];
        let buffer = match mem::replace(&mut slot.state, SlotState::Filling) {
            SlotState::Free(buffer) => buffer,
            SlotState::Ready(frame) => frame.into_buffer(),
            SlotState::Filling | SlotState::CheckedOut => unreachable!("slot chosen from free or ready"),
        };
        slot.generation += 1;
        Some((
            SlotHandle {
                index,
                generation: slot.generation,
            },
            buffer,
        ))
    }

    /// Publish a finished capture and return its sequence number.
    pub fn complete_fill(&mut self, handle: SlotHandle, buffer: Vec<u8>) -> Result<u64, PoolError> {
        let slot = self.slot_for(handle)?;
        if !matches!(slot.state, SlotState::Filling) {
            return Err(PoolError::NotFilling(handle.index));
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.slots[handle.index].state =
            SlotState::Ready(Frame::new(buffer, sequence, Utc::now()));
        Ok(sequence)
    }

    /// Return a slot whose capture failed.
    pub fn abort_fill(&mut self, handle: SlotHandle, mut buffer: Vec<u8>) -> Result<(), PoolError> {
        let slot = self.slot_for(handle)?;
        if !matches!(slot.state, SlotState::Filling) {
            return Err(PoolError::NotFilling(handle.index));
        }
        buffer.clear();
        self.slots[handle.index].state = SlotState::Free(buffer);
        Ok(())
    }

    /// Hand a completed frame to a consumer according to the grab policy.
    pub fn check_out(&mut self) -> Option<(SlotHandle, Frame)> {
        let index = match self.policy {
            GrabPolicy::WhenEmpty => self.oldest_ready()?,
            GrabPolicy::Latest => {
                let newest = self.newest_ready()?;
                self.recycle_ready_except(newest);
                newest
            }
        };

        let slot = &mut self.slots[index];
        let SlotState::Ready(frame) = mem::replace(&mut slot.state, SlotState::CheckedOut) else {
            unreachable!("slot chosen from ready set");
        };
        slot.generation += 1;
        Some((
            SlotHandle {
                index,
                generation: slot.generation,
            },
            frame,
        ))
    }

    /// Return a checked-out slot. Stray or repeated check-ins leave the pool untouched.
    pub fn check_in(&mut self, handle: SlotHandle, mut buffer: Vec<u8>) -> Result<(), PoolError> {
        let slot = self.slot_for(handle)?;
        if !matches!(slot.state, SlotState::CheckedOut) {
            return Err(PoolError::NotCheckedOut(handle.index));
        }
        buffer.clear();
        let slot = &mut self.slots[handle.index];
        slot.state = SlotState::Free(buffer);
        slot.generation += 1;
        Ok(())
    }

    fn slot_for(&self, handle: SlotHandle) -> Result<&Slot, PoolError> {
        let slot = self
            .slots
            .get(handle.index)
            .ok_or(PoolError::UnknownSlot(handle.index))?;
        if slot.generation != handle.generation {
            return Err(PoolError::StaleHandle(handle.index));
        }
        Ok(slot)
    }

    fn position(&self, predicate: impl Fn(&SlotState) -> bool) -> Option<usize> {
        self.slots.iter().position(|slot| predicate(&slot.state))
    }

    fn ready_sequences(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match &slot.state {
                SlotState::Ready(frame) => Some((index, frame.sequence())),
                _ => None,
            })
    }

    fn oldest_ready(&self) -> Option<usize> {
        self.ready_sequences()
            .min_by_key(|(_, sequence)| *sequence)
            .map(|(index, _)| index)
    }

    fn newest_ready(&self) -> Option<usize> {
        self.ready_sequences()
            .max_by_key(|(_, sequence)| *sequence)
            .map(|(index, _)| index)
    }

    fn recycle_ready_except(&mut self, keep: usize) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if index == keep || !matches!(slot.state, SlotState::Ready(_)) {
                continue;
            }
            if let SlotState::Ready(frame) = mem::replace(&mut slot.state, SlotState::Filling) {
                let mut buffer = frame.into_buffer();
                buffer.clear();
                slot.state = SlotState::Free(buffer);
                slot.generation += 1;
                self.dropped += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fill(pool: &mut SlotPool, bytes: &[u8]) -> Option<u64> {
        let (handle, mut buffer) = pool.begin_fill()?;
        buffer.extend_from_slice(bytes);
        Some(pool.complete_fill(handle, buffer).expect("complete fill"))
    }

    #[test]
    fn when_empty_delivers_in_capture_order() {
        let mut pool = SlotPool::new(2, GrabPolicy::WhenEmpty, 16);
        assert_eq!(fill(&mut pool, b"a"), Some(1));
        assert_eq!(fill(&mut pool, b"b"), Some(2));
        assert_eq!(fill(&mut pool, b"c"), None, "capture stalls when every slot is full");

        let (first, frame) = pool.check_out().expect("first frame");
        assert_eq!(frame.sequence(), 1);
        assert_eq!(frame.bytes(), b"a");
        pool.check_in(first, frame.into_buffer()).unwrap();
        assert_eq!(pool.check_out().map(|(_, f)| f.sequence()), Some(2));
        assert_eq!(pool.dropped(), 0);
    }

    #[test]
    fn latest_recycles_unconsumed_frames() {
        let mut pool = SlotPool::new(2, GrabPolicy::Latest, 16);
        fill(&mut pool, b"a");
        fill(&mut pool, b"b");
        assert_eq!(fill(&mut pool, b"c"), Some(3), "oldest ready slot is overwritten");
        assert_eq!(pool.dropped(), 1);

        let (_, frame) = pool.check_out().expect("newest frame");
        assert_eq!(frame.sequence(), 3);
        assert_eq!(pool.dropped(), 2, "frame 2 is discarded at checkout");
        assert_eq!(pool.occupancy().free, 1);
    }

    #[test]
    fn latest_never_steals_checked_out_slots() {
        let mut pool = SlotPool::new(1, GrabPolicy::Latest, 16);
        fill(&mut pool, b"a");
        let (handle, frame) = pool.check_out().unwrap();
        assert!(pool.begin_fill().is_none());
        pool.check_in(handle, frame.into_buffer()).unwrap();
        assert!(pool.begin_fill().is_some());
    }

    #[test]
    fn double_check_in_is_rejected() {
        let mut pool = SlotPool::new(1, GrabPolicy::WhenEmpty, 16);
        fill(&mut pool, b"a");
        let (handle, frame) = pool.check_out().unwrap();
        pool.check_in(handle, frame.into_buffer()).unwrap();
        let before = pool.occupancy();
        assert_eq!(
            pool.check_in(handle, Vec::new()),
            Err(PoolError::StaleHandle(0))
        );
        assert_eq!(pool.occupancy(), before);
    }

    #[test]
    fn check_in_of_ready_slot_is_rejected() {
        let mut pool = SlotPool::new(1, GrabPolicy::WhenEmpty, 16);
        let (handle, buffer) = pool.begin_fill().unwrap();
        pool.complete_fill(handle, buffer).unwrap();
        assert_eq!(
            pool.check_in(handle, Vec::new()),
            Err(PoolError::NotCheckedOut(0))
        );
        assert_eq!(pool.occupancy().ready, 1);
    }

    #[test]
    fn aborted_fill_returns_slot() {
        let mut pool = SlotPool::new(1, GrabPolicy::WhenEmpty, 16);
        let (handle, buffer) = pool.begin_fill().unwrap();
        pool.abort_fill(handle, buffer).unwrap();
        assert_eq!(pool.occupancy().free, 1);
        assert!(pool.check_out().is_none());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Fill,
        Acquire,
        Release(usize),
        StrayRelease(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Fill),
            Just(Op::Acquire),
            (0usize..8).prop_map(Op::Release),
            (0usize..8).prop_map(Op::StrayRelease),
        ]
    }

    fn policy() -> impl Strategy<Value = GrabPolicy> {
        prop_oneof![Just(GrabPolicy::WhenEmpty), Just(GrabPolicy::Latest)]
    }

    proptest! {
        #[test]
        fn every_slot_has_exactly_one_owner(
            capacity in 1usize..4,
            policy in policy(),
            ops in prop::collection::vec(op(), 0..64),
        ) {
            let mut pool = SlotPool::new(capacity, policy, 8);
            let mut held: Vec<(SlotHandle, Frame)> = Vec::new();
            let mut released: Vec<SlotHandle> = Vec::new();
            let mut last_sequence = 0u64;

            for op in ops {
                match op {
                    Op::Fill => {
                        fill(&mut pool, b"jpeg");
                    }
                    Op::Acquire => {
                        if let Some((handle, frame)) = pool.check_out() {
                            prop_assert!(frame.sequence() > last_sequence);
                            if policy == GrabPolicy::WhenEmpty {
                                prop_assert_eq!(frame.sequence(), last_sequence + 1);
                            }
                            last_sequence = frame.sequence();
                            held.push((handle, frame));
                        }
                    }
                    Op::Release(pick) => {
                        if !held.is_empty() {
                            let (handle, frame) = held.remove(pick % held.len());
                            prop_assert!(pool.check_in(handle, frame.into_buffer()).is_ok());
                            released.push(handle);
                        }
                    }
                    Op::StrayRelease(pick) => {
                        if !released.is_empty() {
                            let handle = released[pick % released.len()];
                            let before = pool.occupancy();
                            prop_assert!(pool.check_in(handle, Vec::new()).is_err());
                            prop_assert_eq!(pool.occupancy(), before);
                        }
                    }
                }

                let occupancy = pool.occupancy();
                prop_assert!(pool.outstanding() <= capacity);
                prop_assert_eq!(pool.outstanding(), held.len());
                prop_assert_eq!(
                    occupancy.free + occupancy.filling + occupancy.ready + occupancy.checked_out,
                    capacity
                );
            }
        }
    }
}
