//! Generational slot map for object handles.
//!
//! Handles are `(index, generation)` pairs.  A slot's generation advances on
//! every removal, so a stale handle dereference fails cleanly with
//! [`Error::InvalidHandle`] instead of reaching a recycled object.

use crate::error::{Error, Result};

/// An opaque handle into a [`SlotMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

struct Slot<T> {
    generation: u32,
    data: Option<T>,
}

/// Arena owning its objects; everyone else holds [`Handle`]s.
pub struct SlotMap<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for SlotMap<T> {
    fn default() -> Self {
        SlotMap { slots: Vec::new(), free: Vec::new(), len: 0 }
    }
}

impl<T> SlotMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, data: T) -> Handle {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.data = Some(data);
            Handle { index, generation: slot.generation }
        } else {
            let index = u32::try_from(self.slots.len()).expect("slot map index overflow");
            self.slots.push(Slot { generation: 0, data: Some(data) });
            Handle { index, generation: 0 }
        }
    }

    fn slot(&self, handle: Handle) -> Result<&Slot<T>> {
        let slot = self.slots.get(handle.index as usize).ok_or(Error::InvalidHandle)?;
        if slot.generation != handle.generation || slot.data.is_none() {
            return Err(Error::InvalidHandle);
        }
        Ok(slot)
    }

    pub fn get(&self, handle: Handle) -> Result<&T> {
        Ok(self.slot(handle)?.data.as_ref().unwrap())
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut T> {
        self.slot(handle)?;
        Ok(self.slots[handle.index as usize].data.as_mut().unwrap())
    }

    pub fn remove(&mut self, handle: Handle) -> Result<T> {
        self.slot(handle)?;
        let slot = &mut self.slots[handle.index as usize];
        let data = slot.data.take().unwrap();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Ok(data)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.data.as_ref().map(|d| {
                (Handle { index: i as u32, generation: slot.generation }, d)
            })
        })
    }

    /// Remove every object, invalidating all outstanding handles.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if let Some(data) = slot.data.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(i as u32);
                out.push(data);
            }
        }
        self.len = 0;
        out
    }
}
