//! Ids, id registers, and terminal identifiers.

use crate::WireError;
use crate::varint::{self, Reader};
use std::fmt;
use std::num::NonZeroU64;

// ---------------------------------------------------------------------------
// Id
// ---------------------------------------------------------------------------

/// Identifies terminals, bindings, operations, and subscriptions.
///
/// Ids are always greater than zero; the wire value zero is the "invalid"
/// sentinel and is rejected on decode.  Absence is expressed as
/// `Option<Id>` in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(NonZeroU64);

impl Id {
    pub fn new(number: u64) -> Option<Id> {
        NonZeroU64::new(number).map(Id)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }

    pub fn put(self, out: &mut Vec<u8>) {
        varint::put_u64(out, self.get());
    }

    pub fn read(r: &mut Reader<'_>) -> Result<Id, WireError> {
        Id::new(r.u64()?).ok_or(WireError::ZeroId)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// IdRegister
// ---------------------------------------------------------------------------

/// A collection of elements addressed by [`Id`].
///
/// Freed ids are reused from a free-list, so id values stay small.  Reuse is
/// safe at the protocol level because removal is two-phase: an id returns to
/// the free-list only after the peer has acknowledged the removal.
#[derive(Debug)]
pub struct IdRegister<T> {
    slots: Vec<Option<T>>,
    free: Vec<Id>,
}

impl<T> Default for IdRegister<T> {
    fn default() -> Self {
        IdRegister { slots: Vec::new(), free: Vec::new() }
    }
}

impl<T> IdRegister<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, data: T) -> Id {
        if let Some(id) = self.free.pop() {
            self.slots[id.get() as usize - 1] = Some(data);
            id
        } else {
            self.slots.push(Some(data));
            Id::new(self.slots.len() as u64).unwrap()
        }
    }

    pub fn remove(&mut self, id: Id) -> Option<T> {
        let slot = self.slots.get_mut(id.get() as usize - 1)?;
        let data = slot.take()?;
        self.free.push(id);
        Some(data)
    }

    pub fn get(&self, id: Id) -> Option<&T> {
        self.slots.get(id.get() as usize - 1)?.as_ref()
    }

    pub fn get_mut(&mut self, id: Id) -> Option<&mut T> {
        self.slots.get_mut(id.get() as usize - 1)?.as_mut()
    }

    pub fn contains(&self, id: Id) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|d| (Id::new(i as u64 + 1).unwrap(), d)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Id, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_mut().map(|d| (Id::new(i as u64 + 1).unwrap(), d)))
    }
}

// ---------------------------------------------------------------------------
// Identifier
// ---------------------------------------------------------------------------

/// Names a terminal or binding.
///
/// Two identifiers match only if signature, name, and hidden flag are all
/// equal.  Hidden identifiers are excluded from wildcard discovery queries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier {
    pub signature: u64,
    pub name: String,
    pub hidden: bool,
}

impl Identifier {
    pub fn new(signature: u64, name: impl Into<String>, hidden: bool) -> Self {
        Identifier { signature, name: name.into(), hidden }
    }

    pub fn put(&self, out: &mut Vec<u8>) {
        varint::put_u64(out, self.signature);
        varint::put_bool(out, self.hidden);
        varint::put_str(out, &self.name);
    }

    pub fn read(r: &mut Reader<'_>) -> Result<Identifier, WireError> {
        let signature = r.u64()?;
        let hidden = r.bool()?;
        let name = r.str()?;
        Ok(Identifier { signature, name, hidden })
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hidden {
            write!(f, "({}, {}, hidden)", self.signature, self.name)
        } else {
            write!(f, "({}, {})", self.signature, self.name)
        }
    }
}
