use crate::{
    compile::{ForwardUnit, ReverseUnit},
    context::Context,
    glue::DerivedRule,
    safe::SafeRule,
    translate::translate_function,
    CoDual, Error, Pullback, Registry, Rule, RuleRef,
};
use indexmap::IndexMap;
use log::{debug, trace, warn};
use rewind::{cfg, Provider, Signature};
use std::{
    cell::{OnceCell, RefCell},
    rc::Rc,
};

#[derive(Clone, Copy, Debug)]
pub struct BuildConfig {
    /// Wrap every derived rule in a [`SafeRule`].
    pub safe: bool,
    /// Validate IR before translating it.
    pub validate: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            safe: true,
            validate: true,
        }
    }
}

/// Stands in for a rule whose build is still running, so that recursive calls can refer to it.
struct LazyRule {
    sig: Signature,
    rule: OnceCell<RuleRef>,
}

impl Rule for LazyRule {
    fn call(&self, args: &[CoDual]) -> Result<(CoDual, Pullback), Error> {
        self.rule
            .get()
            .ok_or_else(|| Error::UnfinishedRule(self.sig.to_string()))?
            .call(args)
    }
}

enum Entry {
    Building(Rc<LazyRule>),
    Ready(RuleRef),
}

/// Builds a rule for each signature at most once.
pub struct RuleCache {
    provider: Rc<dyn Provider>,
    registry: Rc<dyn Registry>,
    config: BuildConfig,
    entries: RefCell<IndexMap<Signature, Entry>>,
    builds: RefCell<IndexMap<Signature, usize>>,
}

impl RuleCache {
    pub fn new(provider: Rc<dyn Provider>, registry: Rc<dyn Registry>) -> Self {
        Self::with_config(provider, registry, BuildConfig::default())
    }

    pub fn with_config(
        provider: Rc<dyn Provider>,
        registry: Rc<dyn Registry>,
        config: BuildConfig,
    ) -> Self {
        RuleCache {
            provider,
            registry,
            config,
            entries: RefCell::new(IndexMap::new()),
            builds: RefCell::new(IndexMap::new()),
        }
    }

    pub fn config(&self) -> BuildConfig {
        self.config
    }

    pub(crate) fn provider(&self) -> &dyn Provider {
        &*self.provider
    }

    /// How many times a rule for `sig` has been built, successfully or not.
    pub fn builds(&self, sig: &Signature) -> usize {
        self.builds.borrow().get(sig).copied().unwrap_or(0)
    }

    pub fn contains(&self, sig: &Signature) -> bool {
        self.entries.borrow().contains_key(sig)
    }

    fn cached(&self, sig: &Signature) -> Option<RuleRef> {
        match self.entries.borrow().get(sig)? {
            Entry::Building(lazy) => Some(Rc::clone(lazy) as RuleRef),
            Entry::Ready(rule) => Some(Rc::clone(rule)),
        }
    }

    /// The rule to use for a call with signature `sig`: a hand-written one if the registry has
    /// it, otherwise one derived from the IR of `sig`.
    ///
    /// If `sig` is already being built further up the stack, the returned rule refers to that
    /// build and fails with [`Error::UnfinishedRule`] if called before it completes.
    pub fn rule_for(&self, sig: &Signature) -> Result<RuleRef, Error> {
        if let Some(rule) = self.registry.lookup(sig) {
            return Ok(rule);
        }
        if let Some(rule) = self.cached(sig) {
            debug!("reusing rule for {sig}");
            return Ok(rule);
        }

        let lazy = Rc::new(LazyRule {
            sig: sig.clone(),
            rule: OnceCell::new(),
        });
        let (index, _) = self
            .entries
            .borrow_mut()
            .insert_full(sig.clone(), Entry::Building(Rc::clone(&lazy)));
        *self.builds.borrow_mut().entry(sig.clone()).or_default() += 1;

        debug!("building rule for {sig}");
        match self.build(sig) {
            Ok(rule) => {
                if lazy.rule.set(Rc::clone(&rule)).is_err() {
                    warn!("rule for {sig} was filled twice");
                }
                if let Some(entry) = self.entries.borrow_mut().get_mut(sig) {
                    *entry = Entry::Ready(Rc::clone(&rule));
                }
                debug!("finished rule for {sig}");
                Ok(rule)
            }
            Err(e) => {
                // everything inserted since this build started depends on it
                self.entries.borrow_mut().truncate(index);
                warn!("dropping rule for {sig}: {e}");
                Err(e)
            }
        }
    }

    fn build(&self, sig: &Signature) -> Result<RuleRef, Error> {
        let (ir, _) = self.provider.typed_ir(sig).map_err(|source| Error::Provider {
            sig: sig.to_string(),
            source,
        })?;
        let f = cfg::normalize(&ir).map_err(|source| Error::Provider {
            sig: sig.to_string(),
            source,
        })?;
        if self.config.validate {
            rewind_validate::validate(&f).map_err(|source| Error::Invalid {
                sig: sig.to_string(),
                source,
            })?;
        }

        let mut ctx = Context::new(self, &f);
        let (fwd, rev, shape) = translate_function(&mut ctx, &f)?;
        trace!("forward program for {sig}:\n{fwd}");
        trace!("reverse program for {sig}:\n{rev}");

        let rule = DerivedRule::new(
            sig.clone(),
            f.params.clone(),
            ForwardUnit::new(&fwd),
            ReverseUnit::new(&rev),
            shape,
            ctx.sentinel,
        );
        let rule: RuleRef = if self.config.safe {
            Rc::new(SafeRule::new(Rc::new(rule), sig.clone()))
        } else {
            Rc::new(rule)
        };
        Ok(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{testing::cache, value_and_gradient, Tangent};
    use rewind::{
        build::FunctionBuilder, id, Builtin, Callee, Expr, Function, Operand, Type, Val,
    };
    use rewind_interp::Module;

    fn square() -> Function {
        let mut b = FunctionBuilder::new(vec![Type::F64], Type::F64);
        let y = b.call(Type::F64, Callee::Builtin(Builtin::Mul), vec![b.arg(0), b.arg(0)]);
        b.ret(y);
        b.finish()
    }

    /// `x^n` by repeated multiplication in a loop.
    fn power() -> Function {
        let mut b = FunctionBuilder::new(vec![Type::F64, Type::Int], Type::F64);
        let head = b.block();
        let body = b.block();
        let done = b.block();
        b.goto(head);

        b.switch_to(head);
        let i = b.phi(Type::Int);
        let acc = b.phi(Type::F64);
        let more = b.call(
            Type::Bool,
            Callee::Builtin(Builtin::Lt),
            vec![Operand::Var(i), b.arg(1)],
        );
        b.goto_if_not(more, done);

        b.switch_to(body);
        let acc2 = b.call(
            Type::F64,
            Callee::Builtin(Builtin::Mul),
            vec![Operand::Var(acc), b.arg(0)],
        );
        let i2 = b.call(
            Type::Int,
            Callee::Builtin(Builtin::AddInt),
            vec![Operand::Var(i), Operand::int(1)],
        );
        b.goto(head);

        b.switch_to(done);
        b.ret(Operand::Var(acc));

        let entry = id::block(0);
        b.set_edges(i, vec![(entry, Operand::int(0)), (body, i2)]);
        b.set_edges(acc, vec![(entry, Operand::f64(1.)), (body, acc2)]);
        b.finish()
    }

    #[test]
    fn test_square() {
        let mut module = Module::new();
        module.define("square", square());
        let rules = cache(module);
        let rule = rules
            .rule_for(&Signature::func("square", vec![Type::F64]))
            .unwrap();
        let (y, grad) = value_and_gradient(&*rule, &[Val::F64(3.)]).unwrap();
        assert_eq!(y, 9.);
        assert_eq!(grad, vec![Tangent::F64(6.)]);

        // a second invocation gets a capture of its own
        let (y, grad) = value_and_gradient(&*rule, &[Val::F64(-2.)]).unwrap();
        assert_eq!(y, 4.);
        assert_eq!(grad, vec![Tangent::F64(-4.)]);
    }

    #[test]
    fn test_loop() {
        let mut module = Module::new();
        module.define("power", power());
        let rules = cache(module);
        let sig = Signature::func("power", vec![Type::F64, Type::Int]);
        let rule = rules.rule_for(&sig).unwrap();
        let (y, grad) = value_and_gradient(&*rule, &[Val::F64(2.), Val::Int(3)]).unwrap();
        assert_eq!(y, 8.);
        assert_eq!(grad, vec![Tangent::F64(12.), Tangent::NoTangent]);

        let (y, grad) = value_and_gradient(&*rule, &[Val::F64(5.), Val::Int(0)]).unwrap();
        assert_eq!(y, 1.);
        assert_eq!(grad, vec![Tangent::F64(0.), Tangent::NoTangent]);
        assert_eq!(rules.builds(&sig), 1);
    }

    #[test]
    fn test_cache_reuses_rules() {
        let mut module = Module::new();
        module.define("square", square());
        let rules = cache(module);
        let sig = Signature::func("square", vec![Type::F64]);
        let a = rules.rule_for(&sig).unwrap();
        let b = rules.rule_for(&sig).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(rules.builds(&sig), 1);
    }

    #[test]
    fn test_failed_build_leaves_no_entries() {
        let mut module = Module::new();
        module.define("square", square());
        let mut b = FunctionBuilder::new(vec![Type::F64], Type::F64);
        let y = b.call(
            Type::F64,
            Callee::Func("square".into()),
            vec![b.arg(0)],
        );
        b.push(
            Type::Nothing,
            Expr::Unsupported {
                name: "ccall".into(),
            },
        );
        b.ret(y);
        module.define("broken", b.finish());
        let rules = cache(module);

        let broken = Signature::func("broken", vec![Type::F64]);
        let res = rules.rule_for(&broken);
        assert!(matches!(res, Err(Error::UnsupportedStmt { .. })));
        assert!(!rules.contains(&broken));
        assert!(!rules.contains(&Signature::func("square", vec![Type::F64])));

        assert!(rules.rule_for(&broken).is_err());
        assert_eq!(rules.builds(&broken), 2);
    }

    #[test]
    fn test_missing_method() {
        let rules = cache(Module::new());
        let res = rules.rule_for(&Signature::func("nowhere", vec![Type::F64]));
        assert!(matches!(res, Err(Error::Provider { .. })));
    }
}
