// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::HashMap;

use base::sync::Mutex;
use base::sync::MutexGuard;

/// Identifies one client feeding events into a device.
pub type SourceId = u32;

/// Highest `ABS_MT_SLOT` value a touch device advertises unless configured otherwise.
pub const DEFAULT_MAX_SLOT: i32 = 10;

/// Multi-touch slot bookkeeping for a single touch device.
///
/// Slots are shared by every source on the device, keyed by `(source, contact id)`, and range from
/// 0 to `max_slot`. Tracking ids are handed out from a counter that starts at 1 and wraps back to 1
/// after `i32::MAX`.
#[derive(Debug)]
pub struct SlotMap {
    slots: HashMap<(SourceId, i32), i32>,
    used: Vec<u64>,
    max_slot: i32,
    next_tracking_id: i32,
}

impl Default for SlotMap {
    fn default() -> Self {
        SlotMap::new(DEFAULT_MAX_SLOT)
    }
}

impl SlotMap {
    pub fn new(max_slot: i32) -> Self {
        SlotMap {
            slots: HashMap::new(),
            used: Vec::new(),
            max_slot,
            next_tracking_id: 1,
        }
    }

    pub fn has_slot(&self, source: SourceId, id: i32) -> bool {
        self.slots.contains_key(&(source, id))
    }

    /// Returns the slot for the contact, acquiring the lowest free one if needed. A freshly
    /// acquired slot also comes with its new tracking id. Returns `None` when every slot up to
    /// `max_slot` is taken.
    pub fn get_or_acquire_slot(&mut self, source: SourceId, id: i32) -> Option<(i32, Option<i32>)> {
        if let Some(&slot) = self.slots.get(&(source, id)) {
            return Some((slot, None));
        }
        let slot = self.take_free_slot()?;
        self.slots.insert((source, id), slot);
        Some((slot, Some(self.new_tracking_id())))
    }

    pub fn release_slot(&mut self, source: SourceId, id: i32) -> Option<i32> {
        let slot = self.slots.remove(&(source, id))?;
        self.clear_bit(slot);
        Some(slot)
    }

    pub fn num_active_slots(&self) -> usize {
        self.slots.len()
    }

    /// Forgets every slot owned by `source` without emitting anything.
    pub fn on_disconnected_source(&mut self, source: SourceId) {
        let owned: Vec<(SourceId, i32)> = self
            .slots
            .keys()
            .filter(|(src, _)| *src == source)
            .copied()
            .collect();
        for key in owned {
            if let Some(slot) = self.slots.remove(&key) {
                self.clear_bit(slot);
            }
        }
    }

    fn take_free_slot(&mut self) -> Option<i32> {
        let word = self
            .used
            .iter()
            .position(|w| *w != u64::MAX)
            .unwrap_or(self.used.len());
        let bit = self.used.get(word).map_or(0, |w| w.trailing_ones() as usize);
        let slot = word * 64 + bit;
        if self.max_slot < 0 || slot > self.max_slot as usize {
            return None;
        }
        if word == self.used.len() {
            self.used.push(0);
        }
        self.used[word] |= 1u64 << bit;
        Some(slot as i32)
    }

    fn clear_bit(&mut self, slot: i32) {
        let slot = slot as usize;
        if let Some(word) = self.used.get_mut(slot / 64) {
            *word &= !(1u64 << (slot % 64));
        }
    }

    fn new_tracking_id(&mut self) -> i32 {
        let id = self.next_tracking_id;
        self.next_tracking_id = if id == i32::MAX { 1 } else { id + 1 };
        id
    }
}

/// Thread-safe wrapper around a device's [`SlotMap`].
#[derive(Default)]
pub struct TouchSlotTracker {
    inner: Mutex<SlotMap>,
}

impl TouchSlotTracker {
    pub fn new(max_slot: i32) -> Self {
        TouchSlotTracker {
            inner: Mutex::new(SlotMap::new(max_slot)),
        }
    }

    /// Locks the map so that a whole batch of contacts is processed atomically.
    pub fn lock(&self) -> MutexGuard<SlotMap> {
        self.inner.lock()
    }

    pub fn has_slot(&self, source: SourceId, id: i32) -> bool {
        self.lock().has_slot(source, id)
    }

    pub fn get_or_acquire_slot(&self, source: SourceId, id: i32) -> Option<(i32, Option<i32>)> {
        self.lock().get_or_acquire_slot(source, id)
    }

    pub fn release_slot(&self, source: SourceId, id: i32) -> Option<i32> {
        self.lock().release_slot(source, id)
    }

    pub fn num_active_slots(&self) -> usize {
        self.lock().num_active_slots()
    }

    pub fn on_disconnected_source(&self, source: SourceId) {
        self.lock().on_disconnected_source(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_contact_keeps_its_slot() {
        let tracker = TouchSlotTracker::default();
        assert_eq!(tracker.get_or_acquire_slot(1, 7), Some((0, Some(1))));
        assert_eq!(tracker.get_or_acquire_slot(1, 7), Some((0, None)));
        assert!(tracker.has_slot(1, 7));
        assert_eq!(tracker.num_active_slots(), 1);
    }

    #[test]
    fn lowest_free_slot_is_reused() {
        let tracker = TouchSlotTracker::default();
        assert_eq!(tracker.get_or_acquire_slot(1, 1).unwrap().0, 0);
        assert_eq!(tracker.get_or_acquire_slot(1, 2).unwrap().0, 1);
        assert_eq!(tracker.get_or_acquire_slot(2, 1).unwrap().0, 2);
        assert_eq!(tracker.release_slot(1, 2), Some(1));
        assert_eq!(tracker.release_slot(1, 2), None);
        assert_eq!(tracker.get_or_acquire_slot(2, 9), Some((1, Some(4))));
    }

    #[test]
    fn slots_beyond_one_word() {
        let mut map = SlotMap::new(127);
        for id in 0..70 {
            assert_eq!(map.get_or_acquire_slot(0, id).unwrap().0, id);
        }
        map.release_slot(0, 65);
        assert_eq!(map.get_or_acquire_slot(1, 0).unwrap().0, 65);
    }

    #[test]
    fn disconnect_releases_only_that_source() {
        let tracker = TouchSlotTracker::default();
        tracker.get_or_acquire_slot(1, 1);
        tracker.get_or_acquire_slot(2, 1);
        tracker.get_or_acquire_slot(1, 2);
        tracker.on_disconnected_source(1);
        assert_eq!(tracker.num_active_slots(), 1);
        assert!(tracker.has_slot(2, 1));
        assert_eq!(tracker.get_or_acquire_slot(3, 1).unwrap().0, 0);
    }

    #[test]
    fn tracking_id_wraps_to_one() {
        let mut map = SlotMap::default();
        map.next_tracking_id = i32::MAX;
        assert_eq!(map.get_or_acquire_slot(0, 0).unwrap().1, Some(i32::MAX));
        assert_eq!(map.get_or_acquire_slot(0, 1).unwrap().1, Some(1));
    }

    #[test]
    fn no_slot_beyond_the_advertised_maximum() {
        let tracker = TouchSlotTracker::new(1);
        assert_eq!(tracker.get_or_acquire_slot(1, 1).unwrap().0, 0);
        assert_eq!(tracker.get_or_acquire_slot(1, 2).unwrap().0, 1);
        assert_eq!(tracker.get_or_acquire_slot(1, 3), None);
        assert!(!tracker.has_slot(1, 3));
        assert_eq!(tracker.num_active_slots(), 2);
        tracker.release_slot(1, 1);
        assert_eq!(tracker.get_or_acquire_slot(1, 3).unwrap().0, 0);

        let mut full_word = SlotMap::new(63);
        for id in 0..64 {
            assert_eq!(full_word.get_or_acquire_slot(0, id).unwrap().0, id);
        }
        assert_eq!(full_word.get_or_acquire_slot(0, 64), None);
        assert_eq!(SlotMap::default().max_slot, DEFAULT_MAX_SLOT);
    }
}
