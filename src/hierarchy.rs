use std::collections::{BTreeMap, BTreeSet};

use crate::policy::UntrackedCallPolicy;

/// Class name to a set of class names or method signatures.
pub(crate) type ClassTable = BTreeMap<String, BTreeSet<String>>;

/// Expand direct deriving classes into all transitively deriving classes.
///
/// Only classes with at least one declared deriving class get an entry.
/// A class never appears in its own set, and cycles in the input stop at
/// the first revisit.
pub(crate) fn transitive_subclasses(deriving: &ClassTable) -> ClassTable {
    let mut result = ClassTable::new();
    for (class, direct) in deriving {
        if direct.is_empty() {
            continue;
        }
        let mut collected = BTreeSet::new();
        let mut pending: Vec<&String> = direct.iter().collect();
        while let Some(sub) = pending.pop() {
            if sub == class || !collected.insert(sub.clone()) {
                continue;
            }
            if let Some(next) = deriving.get(sub) {
                pending.extend(next.iter());
            }
        }
        result.insert(class.clone(), collected);
    }
    result
}

/// Methods declared by a class and not redeclared by any class deriving it.
pub(crate) fn locally_final_methods(methods: &ClassTable, transitive: &ClassTable) -> ClassTable {
    let mut result = ClassTable::new();
    for (class, declared) in methods {
        let mut remaining = declared.clone();
        if let Some(subs) = transitive.get(class) {
            for sub in subs {
                if remaining.is_empty() {
                    break;
                }
                if let Some(overriding) = methods.get(sub) {
                    remaining.retain(|m| !overriding.contains(m));
                }
            }
        }
        result.insert(class.clone(), remaining);
    }
    result
}

/// Read-only whole-program facts consulted when resolving virtual calls.
pub(crate) struct ClassHierarchy {
    methods: ClassTable,
    deriving: ClassTable,
    locally_final: ClassTable,
    untracked: Box<dyn UntrackedCallPolicy>,
}

impl ClassHierarchy {
    pub(crate) fn new(
        methods: ClassTable,
        deriving: ClassTable,
        untracked: Box<dyn UntrackedCallPolicy>,
    ) -> Self {
        let transitive = transitive_subclasses(&deriving);
        let locally_final = locally_final_methods(&methods, &transitive);
        Self {
            methods,
            deriving,
            locally_final,
            untracked,
        }
    }

    pub(crate) fn class_count(&self) -> usize {
        self.methods.len()
    }

    pub(crate) fn is_untracked(&self, class: Option<&str>, method: &str) -> bool {
        self.untracked.is_untracked(class, method)
    }

    /// Narrow the receiver class of a virtual or interface call.
    ///
    /// Classes outside the analyzed program are assumed to have no
    /// overriders inside it. Known classes resolve when the receiver is
    /// `this` and the method is locally final, or when nothing derives
    /// from the class and it declares the method.
    pub(crate) fn resolve_dynamic(
        &self,
        class: Option<&str>,
        method: &str,
        receiver_is_this: bool,
    ) -> Option<String> {
        let class = class?;
        let Some(declared) = self.methods.get(class) else {
            return Some(class.to_string());
        };
        let locally_final = self
            .locally_final
            .get(class)
            .is_some_and(|methods| methods.contains(method));
        let has_deriving = self
            .deriving
            .get(class)
            .is_some_and(|subs| !subs.is_empty());
        if (receiver_is_this && locally_final) || (!has_deriving && declared.contains(method)) {
            Some(class.to_string())
        } else {
            None
        }
    }
}
