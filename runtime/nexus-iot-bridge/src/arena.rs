//! Resource arena and reference counting.
//!
//! Every native struct backing a script object lives in a slot of a
//! [`ResourceArena`]. A slot is freed once both sides are done with it:
//! the script side has released every reference it acquired, and the
//! native side has reported completion. Slots are addressed by a
//! generational [`WrapId`], so an id outliving its slot is detected
//! instead of aliasing a newer occupant.

use std::fmt;

/// Generational index of a wrap inside an arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WrapId {
    index: u32,
    generation: u32,
}

impl WrapId {
    /// Build an id from its parts
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Slot generation at the time the id was issued
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for WrapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Report a lifetime bug: use of a destroyed wrap, double free, or
/// inconsistent back-pointers.
///
/// Debug builds abort. Release builds log the violation and the caller
/// turns the offending operation into a no-op.
#[track_caller]
pub fn lifetime_violation(what: &str, id: WrapId) {
    tracing::error!(wrap = %id, "lifetime violation: {}", what);
    if cfg!(debug_assertions) {
        panic!("lifetime violation: {} ({})", what, id);
    }
}

struct Entry<T> {
    value: T,
    script_refs: u32,
    native_done: bool,
}

struct Slot<T> {
    generation: u32,
    entry: Option<Entry<T>>,
}

/// Slot storage with two-sided release
pub struct ResourceArena<T> {
    name: &'static str,
    slots: Vec<Slot<T>>,
    free_list: Vec<u32>,
    live: usize,
    freed: u64,
}

impl<T> ResourceArena<T> {
    /// Create an empty arena; `name` tags log output
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: Vec::new(),
            free_list: Vec::new(),
            live: 0,
            freed: 0,
        }
    }

    /// Store a native struct. The new slot has no script references and
    /// the native side is not yet done.
    pub fn attach(&mut self, value: T) -> WrapId {
        let entry = Entry {
            value,
            script_refs: 0,
            native_done: false,
        };
        self.live += 1;

        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            return WrapId::new(index, slot.generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        WrapId::new(index, 0)
    }

    /// Add a script-side reference
    pub fn acquire(&mut self, id: WrapId) {
        match self.entry_mut(id) {
            Some(entry) => entry.script_refs += 1,
            None => lifetime_violation("acquire on freed wrap", id),
        }
    }

    /// Drop a script-side reference. Returns the value if this freed it.
    pub fn release(&mut self, id: WrapId) -> Option<T> {
        let Some(entry) = self.entry_mut(id) else {
            lifetime_violation("release on freed wrap", id);
            return None;
        };
        if entry.script_refs == 0 {
            lifetime_violation("release without matching acquire", id);
            return None;
        }
        entry.script_refs -= 1;
        self.try_free(id)
    }

    /// Record native-side completion. Returns the value if this freed it.
    pub fn complete(&mut self, id: WrapId) -> Option<T> {
        let Some(entry) = self.entry_mut(id) else {
            lifetime_violation("completion on freed wrap", id);
            return None;
        };
        if entry.native_done {
            lifetime_violation("native side completed twice", id);
            return None;
        }
        entry.native_done = true;
        self.try_free(id)
    }

    fn try_free(&mut self, id: WrapId) -> Option<T> {
        let slot = &mut self.slots[id.index as usize];
        let ready = matches!(
            &slot.entry,
            Some(entry) if entry.script_refs == 0 && entry.native_done
        );
        if !ready {
            return None;
        }

        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(id.index);
        self.live -= 1;
        self.freed += 1;
        tracing::trace!(arena = self.name, wrap = %id, "freed");
        Some(entry.value)
    }

    fn entry_mut(&mut self, id: WrapId) -> Option<&mut Entry<T>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Borrow a live value
    pub fn get(&self, id: WrapId) -> Option<&T> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref().map(|e| &e.value)
    }

    /// Borrow a live value mutably
    pub fn get_mut(&mut self, id: WrapId) -> Option<&mut T> {
        self.entry_mut(id).map(|e| &mut e.value)
    }

    /// Whether `id` still names a live slot
    pub fn contains(&self, id: WrapId) -> bool {
        self.get(id).is_some()
    }

    /// Outstanding script references on a live slot
    pub fn script_refs(&self, id: WrapId) -> Option<u32> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref().map(|e| e.script_refs)
    }

    /// Ids of every live slot, in slot order
    pub fn ids(&self) -> Vec<WrapId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.entry.is_some())
            .map(|(index, slot)| WrapId::new(index as u32, slot.generation))
            .collect()
    }

    /// Number of live slots
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether no slot is live
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Total slots freed over the arena's life
    pub fn freed_count(&self) -> u64 {
        self.freed
    }
}

impl<T> fmt::Debug for ResourceArena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceArena")
            .field("name", &self.name)
            .field("live", &self.live)
            .field("freed", &self.freed)
            .finish()
    }
}
