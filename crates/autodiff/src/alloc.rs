use indexmap::IndexSet;
use rewind::id;

/// Index of a payload in the capture record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Slot(usize);

impl Slot {
    pub fn slot(self) -> usize {
        self.0
    }
}

/// Hands out one slot per program point, shared by the forward and reverse programs.
#[derive(Debug, Default)]
pub struct SlotAllocator {
    points: IndexSet<id::Var>,
}

impl SlotAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot_for(&mut self, point: id::Var) -> Slot {
        let (i, _) = self.points.insert_full(point);
        Slot(i)
    }

    pub fn point(&self, slot: Slot) -> Option<id::Var> {
        self.points.get_index(slot.0).copied()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_point_same_slot() {
        let mut alloc = SlotAllocator::new();
        let a = alloc.slot_for(id::var(7));
        let b = alloc.slot_for(id::var(3));
        assert_eq!(alloc.slot_for(id::var(7)), a);
        assert_eq!((a.slot(), b.slot()), (0, 1));
        assert_eq!(alloc.len(), 2);
        assert_eq!(alloc.point(b), Some(id::var(3)));
    }
}
