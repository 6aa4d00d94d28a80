use crate::{tangent::Tangent, Error, Pullback};
use rewind::id;
use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
    sync::atomic::{AtomicU64, Ordering},
};

pub type TangentCell = Rc<RefCell<Tangent>>;

/// A LIFO that remembers how many items ever went in and came out.
pub struct Stack<T> {
    items: Vec<T>,
    pushed: usize,
    popped: usize,
}

impl<T> Default for Stack<T> {
    fn default() -> Self {
        Stack {
            items: vec![],
            pushed: 0,
            popped: 0,
        }
    }
}

impl<T> fmt::Debug for Stack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("len", &self.items.len())
            .field("pushed", &self.pushed)
            .field("popped", &self.popped)
            .finish()
    }
}

impl<T> Stack<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
        self.pushed += 1;
    }

    pub fn pop(&mut self) -> Result<T, Error> {
        let item = self.items.pop().ok_or(Error::StackUnderflow)?;
        self.popped += 1;
        Ok(item)
    }

    pub fn top(&self) -> Option<&T> {
        self.items.last()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn pushed(&self) -> usize {
        self.pushed
    }

    pub fn popped(&self) -> usize {
        self.popped
    }
}

impl Stack<TangentCell> {
    /// Push a new cell holding `t` and return it so the caller can accumulate into it.
    pub fn push_tangent(&mut self, t: Tangent) -> TangentCell {
        let cell = Rc::new(RefCell::new(t));
        self.push(Rc::clone(&cell));
        cell
    }

    pub fn top_ref(&self) -> Option<TangentCell> {
        self.top().map(Rc::clone)
    }
}

pub type TangentStack = Stack<TangentCell>;

/// References to argument tangents, `None` where the argument was a constant.
pub type RefStack = Stack<Option<TangentCell>>;

pub type WeakRefStack = Stack<Weak<RefCell<Tangent>>>;

pub type PullbackStack = Stack<Pullback>;

/// An entry of the block-visitation stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockTag {
    /// Marks the bottom of one invocation's visits; never equal to any block.
    Sentinel(u64),
    Block(id::Block),
}

impl BlockTag {
    /// A sentinel distinct from every other sentinel in this process.
    pub fn sentinel() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        BlockTag::Sentinel(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

pub type BlockStack = Stack<BlockTag>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts() {
        let mut s = Stack::new();
        s.push(1);
        s.push(2);
        assert_eq!(s.pop().unwrap(), 2);
        assert_eq!((s.pushed(), s.popped(), s.len()), (2, 1, 1));
        assert_eq!(s.pop().unwrap(), 1);
        assert!(matches!(s.pop(), Err(Error::StackUnderflow)));
        assert_eq!(s.popped(), 2);
    }

    #[test]
    fn test_top_ref_aliases() {
        let mut s = TangentStack::new();
        let cell = s.push_tangent(Tangent::F64(0.));
        if let Some(top) = s.top_ref() {
            *top.borrow_mut() = Tangent::F64(3.);
        }
        assert_eq!(*cell.borrow(), Tangent::F64(3.));
    }

    #[test]
    fn test_sentinels_are_unique() {
        assert_ne!(BlockTag::sentinel(), BlockTag::sentinel());
        assert_ne!(BlockTag::sentinel(), BlockTag::Block(id::block(0)));
    }
}
