//! Per-invocation storage shared by the forward and reverse programs.

use crate::{
    ir::{CaptureShape, PayloadSpec},
    stack::{BlockStack, PullbackStack, RefStack, TangentStack, WeakRefStack},
    tangent::CoDual,
    Error, RuleRef, Slot,
};
use std::rc::Rc;

pub(crate) enum Payload {
    Call {
        rule: RuleRef,
        pullbacks: PullbackStack,
        result: TangentStack,
        args: Vec<RefStack>,
    },
    Const {
        codual: CoDual,
        stack: TangentStack,
    },
    Pi {
        sharpened: TangentStack,
        refs: WeakRefStack,
    },
}

impl Payload {
    fn new(spec: &PayloadSpec) -> Self {
        match spec {
            PayloadSpec::Call { rule, sig } => Payload::Call {
                rule: Rc::clone(rule),
                pullbacks: PullbackStack::new(),
                result: TangentStack::new(),
                args: sig.args.iter().map(|_| RefStack::new()).collect(),
            },
            PayloadSpec::Const { codual } => Payload::Const {
                codual: codual.clone(),
                stack: TangentStack::new(),
            },
            PayloadSpec::Pi { .. } => Payload::Pi {
                sharpened: TangentStack::new(),
                refs: WeakRefStack::new(),
            },
        }
    }
}

pub(crate) struct Capture {
    pub(crate) blocks: BlockStack,
    pub(crate) slots: Vec<Payload>,
}

impl Capture {
    pub(crate) fn new(shape: &CaptureShape) -> Self {
        Capture {
            blocks: BlockStack::new(),
            slots: shape.slots.iter().map(Payload::new).collect(),
        }
    }

    pub(crate) fn payload(&mut self, slot: Slot) -> Result<&mut Payload, Error> {
        self.slots
            .get_mut(slot.slot())
            .ok_or_else(|| Error::Malformed(format!("slot {} does not exist", slot.slot())))
    }

    /// Push and pop counts of every stack, by name.
    fn balance(&self) -> Vec<(String, usize, usize)> {
        let mut counts = vec![(
            "block stack".to_string(),
            self.blocks.pushed(),
            self.blocks.popped(),
        )];
        for (i, payload) in self.slots.iter().enumerate() {
            match payload {
                Payload::Call {
                    pullbacks,
                    result,
                    args,
                    ..
                } => {
                    counts.push((
                        format!("pullbacks of slot {i}"),
                        pullbacks.pushed(),
                        pullbacks.popped(),
                    ));
                    counts.push((
                        format!("results of slot {i}"),
                        result.pushed(),
                        result.popped(),
                    ));
                    for (j, refs) in args.iter().enumerate() {
                        counts.push((
                            format!("argument {j} of slot {i}"),
                            refs.pushed(),
                            refs.popped(),
                        ));
                    }
                }
                Payload::Const { stack, .. } => {
                    counts.push((
                        format!("constant in slot {i}"),
                        stack.pushed(),
                        stack.popped(),
                    ));
                }
                Payload::Pi { sharpened, refs } => {
                    counts.push((
                        format!("sharpened values of slot {i}"),
                        sharpened.pushed(),
                        sharpened.popped(),
                    ));
                    counts.push((
                        format!("references of slot {i}"),
                        refs.pushed(),
                        refs.popped(),
                    ));
                }
            }
        }
        counts
    }

    /// Every stack must have been popped exactly as often as it was pushed.
    pub(crate) fn assert_drained(&self) -> Result<(), Error> {
        match self
            .balance()
            .into_iter()
            .find(|&(_, pushed, popped)| pushed != popped)
        {
            Some((stack, pushed, popped)) => Err(Error::StackImbalance {
                stack,
                pushed,
                popped,
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::BlockTag;
    use rewind::Val;

    #[test]
    fn test_imbalance_is_reported() {
        let shape = CaptureShape {
            slots: vec![PayloadSpec::Const {
                codual: CoDual::zero(Val::F64(1.)),
            }],
        };
        let mut capture = Capture::new(&shape);
        capture.blocks.push(BlockTag::sentinel());
        capture.blocks.pop().unwrap();
        assert!(capture.assert_drained().is_ok());

        if let Payload::Const { stack, .. } = &mut capture.slots[0] {
            stack.push_tangent(crate::Tangent::F64(0.));
        }
        assert!(matches!(
            capture.assert_drained(),
            Err(Error::StackImbalance {
                pushed: 1,
                popped: 0,
                ..
            })
        ));
    }
}
