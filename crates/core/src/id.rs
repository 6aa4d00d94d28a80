#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Index of an argument in a function signature.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Arg(usize);

pub const fn arg(id: usize) -> Arg {
    Arg(id)
}

impl Arg {
    pub fn arg(self) -> usize {
        self.0
    }
}

/// Index of a program point in a function body.
///
/// Every statement is exactly one program point, so this also names the value the statement
/// defines, if any.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Var(usize);

pub const fn var(id: usize) -> Var {
    Var(id)
}

impl Var {
    pub fn var(self) -> usize {
        self.0
    }
}

/// Index of a basic block in a function body.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(usize);

pub const fn block(id: usize) -> Block {
    Block(id)
}

impl Block {
    pub fn block(self) -> usize {
        self.0
    }
}
