/// Opaque handle into the buffer arena, standing in for the source's
/// kernel pointer to a `struct binder_buffer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferHandle(u32);

/// Metadata for one buffer record: either a free hole or a live allocation.
#[derive(Debug, Clone)]
pub(crate) struct BufferRecord {
    pub(crate) user_data: usize,
    pub(crate) data_size: usize,
    pub(crate) offsets_size: usize,
    pub(crate) free: bool,
    pub(crate) allow_user_free: bool,
    pub(crate) has_transaction: bool,
    pub(crate) async_transaction: bool,
    pub(crate) clear_on_free: bool,
    pub(crate) prev: Option<BufferHandle>,
    pub(crate) next: Option<BufferHandle>,
}

impl BufferRecord {
    pub(crate) fn hole(user_data: usize) -> Self {
        BufferRecord {
            user_data,
            data_size: 0,
            offsets_size: 0,
            free: true,
            allow_user_free: false,
            has_transaction: false,
            async_transaction: false,
            clear_on_free: false,
            prev: None,
            next: None,
        }
    }
}

/// Arena of buffer records addressed by stable integer handle.
///
/// A `Vec`-backed pool with a free-index recycling list replaces the
/// source's doubly-linked intrusive nodes, so no two live handles can ever
/// alias the same record through separate mutable references.
#[derive(Default)]
pub(crate) struct BufferArena {
    slots: Vec<Option<BufferRecord>>,
    free_indices: Vec<u32>,
}

impl BufferArena {
    pub(crate) fn insert(&mut self, record: BufferRecord) -> BufferHandle {
        if let Some(idx) = self.free_indices.pop() {
            self.slots[idx as usize] = Some(record);
            BufferHandle(idx)
        } else {
            self.slots.push(Some(record));
            BufferHandle((self.slots.len() - 1) as u32)
        }
    }

    pub(crate) fn remove(&mut self, handle: BufferHandle) -> BufferRecord {
        let rec = self.slots[handle.0 as usize].take().expect("double-remove of buffer handle");
        self.free_indices.push(handle.0);
        rec
    }

    pub(crate) fn get(&self, handle: BufferHandle) -> &BufferRecord {
        self.slots[handle.0 as usize].as_ref().expect("use of stale buffer handle")
    }

    pub(crate) fn get_mut(&mut self, handle: BufferHandle) -> &mut BufferRecord {
        self.slots[handle.0 as usize].as_mut().expect("use of stale buffer handle")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_recycles_handles() {
        let mut arena = BufferArena::default();
        let a = arena.insert(BufferRecord::hole(0));
        let b = arena.insert(BufferRecord::hole(8));
        arena.remove(a);
        let c = arena.insert(BufferRecord::hole(16));
        assert_eq!(c, a, "freed slot should be recycled before growing the arena");
        assert_eq!(arena.get(b).user_data, 8);
        assert_eq!(arena.get(c).user_data, 16);
    }

    #[test]
    #[should_panic(expected = "stale buffer handle")]
    fn using_a_removed_handle_panics() {
        let mut arena = BufferArena::default();
        let a = arena.insert(BufferRecord::hole(0));
        arena.remove(a);
        arena.get(a);
    }
}
