// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Table of commands currently owned by the IOC, indexed by request index.

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("request index {0} is out of range")]
    OutOfRange(u16),
    #[error("request index {0} already in use")]
    InUse(u16),
}

/// Maps request indexes to in-flight commands.
///
/// A slot is occupied exactly while the IOC owns the frame with that index.
/// Completion claims a slot with [`LookupTable::take`], so a command can only
/// be completed once.
pub struct LookupTable<T> {
    slots: Mutex<Box<[Option<Arc<T>>]>>,
}

impl<T> LookupTable<T> {
    pub fn new(depth: u16) -> Self {
        Self {
            slots: Mutex::new((0..depth).map(|_| None).collect()),
        }
    }

    pub fn depth(&self) -> u16 {
        self.slots.lock().len() as u16
    }

    pub fn get(&self, index: u16) -> Option<Arc<T>> {
        self.slots.lock().get(index as usize)?.clone()
    }

    /// Returns and clears the slot.
    pub fn take(&self, index: u16) -> Option<Arc<T>> {
        self.slots.lock().get_mut(index as usize)?.take()
    }

    /// Stores `item` in an empty slot. An occupied slot is left as is.
    pub fn set(&self, index: u16, item: Arc<T>) -> Result<(), LookupError> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(index as usize)
            .ok_or(LookupError::OutOfRange(index))?;
        if slot.is_some() {
            return Err(LookupError::InUse(index));
        }
        *slot = Some(item);
        Ok(())
    }

    /// Finds the slot holding `item`.
    pub fn position(&self, item: &Arc<T>) -> Option<u16> {
        self.slots
            .lock()
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, item)))
            .map(|i| i as u16)
    }

    /// Clears and returns every entry matching `f`, in index order.
    pub fn take_matching(&self, mut f: impl FnMut(u16, &T) -> bool) -> Vec<(u16, Arc<T>)> {
        let mut slots = self.slots.lock();
        let mut taken = Vec::new();
        for (i, slot) in slots.iter_mut().enumerate() {
            if slot.as_ref().is_some_and(|s| f(i as u16, s)) {
                if let Some(item) = slot.take() {
                    taken.push((i as u16, item));
                }
            }
        }
        taken
    }

    pub fn outstanding(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }
}
