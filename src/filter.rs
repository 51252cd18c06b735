use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::hierarchy::ClassTable;
use crate::ir::{MethodBody, MethodKey};
use crate::signature::is_constructor;

/// Method bodies addressed by signature, then class.
pub(crate) type MethodTable = BTreeMap<String, BTreeMap<String, MethodBody>>;

pub(crate) fn method_table(bodies: BTreeMap<MethodKey, MethodBody>) -> MethodTable {
    let mut table = MethodTable::new();
    for (key, body) in bodies {
        table.entry(key.method).or_default().insert(key.class, body);
    }
    table
}

/// Declared method signatures per class.
pub(crate) fn declared_methods(table: &MethodTable) -> ClassTable {
    let mut declared = ClassTable::new();
    for (method, classes) in table {
        for class in classes.keys() {
            declared
                .entry(class.clone())
                .or_default()
                .insert(method.clone());
        }
    }
    declared
}

/// Iterate `(class.method, body)` pairs ordered by signature, then class.
pub(crate) fn bodies(table: &MethodTable) -> impl Iterator<Item = (MethodKey, &MethodBody)> {
    table.iter().flat_map(|(method, classes)| {
        classes
            .iter()
            .map(move |(class, body)| (MethodKey::new(class.as_str(), method.as_str()), body))
    })
}

/// Class name patterns: exact names, or `pkg/sub/*` for every class in a package.
#[derive(Clone, Debug, Default)]
pub(crate) struct ClassPatterns {
    classes: BTreeSet<String>,
    packages: BTreeSet<String>,
}

impl ClassPatterns {
    pub(crate) fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let mut result = Self::default();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            match pattern.strip_suffix("/*") {
                Some(package) => result.packages.insert(format!("{package}/")),
                None => result.classes.insert(pattern.to_string()),
            };
        }
        result
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.classes.is_empty() && self.packages.is_empty()
    }

    pub(crate) fn matches(&self, class: &str) -> bool {
        if self.classes.contains(class) {
            return true;
        }
        class
            .rfind('/')
            .is_some_and(|pos| self.packages.contains(&class[..=pos]))
    }
}

/// Drop every method of the matching classes; returns the removed classes.
pub(crate) fn exclude_classes(table: &mut MethodTable, patterns: &ClassPatterns) -> BTreeSet<String> {
    let mut removed = BTreeSet::new();
    if patterns.is_empty() {
        return removed;
    }
    table.retain(|_, classes| {
        classes.retain(|class, _| {
            let excluded = patterns.matches(class);
            if excluded {
                removed.insert(class.clone());
            }
            !excluded
        });
        !classes.is_empty()
    });
    debug!(classes = removed.len(), "excluded classes");
    removed
}

/// Drop constructors and synthetic accessors; returns the removed signatures.
pub(crate) fn exclude_ctors(table: &mut MethodTable) -> Vec<String> {
    let removed: Vec<String> = table
        .keys()
        .filter(|method| is_constructor(method))
        .cloned()
        .collect();
    for method in &removed {
        table.remove(method);
    }
    debug!(signatures = removed.len(), "excluded constructors");
    removed
}

/// Drop signatures defined by more than `max` classes.
pub(crate) fn remove_over_defined(table: &mut MethodTable, max: usize) -> Vec<String> {
    let removed: Vec<String> = table
        .iter()
        .filter(|(_, classes)| classes.len() > max)
        .map(|(method, _)| method.clone())
        .collect();
    for method in &removed {
        table.remove(method);
    }
    debug!(signatures = removed.len(), max, "removed over-defined methods");
    removed
}

/// Starting methods sorted by class then signature, and the number of
/// starting methods per class.
pub(crate) fn select_targets(
    table: &MethodTable,
    entry: &ClassPatterns,
) -> (Vec<MethodKey>, BTreeMap<String, usize>) {
    let mut targets: Vec<MethodKey> = bodies(table)
        .map(|(key, _)| key)
        .filter(|key| entry.is_empty() || entry.matches(&key.class))
        .collect();
    targets.sort();
    let mut per_class = BTreeMap::new();
    for key in &targets {
        *per_class.entry(key.class.clone()).or_insert(0) += 1;
    }
    (targets, per_class)
}

/// Signatures with at least `min` definitions, most defined first.
pub(crate) fn widely_defined(table: &MethodTable, min: usize) -> Vec<(String, usize)> {
    let mut result: Vec<(String, usize)> = table
        .iter()
        .filter(|(_, classes)| classes.len() >= min)
        .map(|(method, classes)| (method.clone(), classes.len()))
        .collect();
    result.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(entries: &[(&str, &str)]) -> MethodTable {
        let bodies = entries
            .iter()
            .map(|(class, method)| (MethodKey::new(*class, *method), MethodBody::default()))
            .collect();
        method_table(bodies)
    }

    fn keys(table: &MethodTable) -> Vec<String> {
        bodies(table).map(|(key, _)| key.to_string()).collect()
    }

    #[test]
    fn class_patterns_match_names_and_packages() {
        let patterns = ClassPatterns::new(&["a/b/*", "c/D"]);

        assert!(patterns.matches("a/b/C"));
        assert!(!patterns.matches("a/b/c/E"));
        assert!(patterns.matches("c/D"));
        assert!(!patterns.matches("c/DD"));
    }

    #[test]
    fn class_patterns_only_treat_slash_star_as_wildcard() {
        let patterns = ClassPatterns::new(&["a/Foo*", "*"]);

        assert!(patterns.matches("a/Foo*"));
        assert!(!patterns.matches("a/Foo/Bar"));
        assert!(!patterns.matches("a/FooBar"));
        assert!(!patterns.matches("Top"));
    }

    #[test]
    fn exclude_classes_drops_emptied_signatures() {
        let mut table = table(&[("a/b/C", "run:()V"), ("x/Y", "run:()V"), ("a/b/C", "only:()V")]);

        let removed = exclude_classes(&mut table, &ClassPatterns::new(&["a/b/*"]));

        assert_eq!(BTreeSet::from(["a/b/C".to_string()]), removed);
        assert_eq!(vec!["x/Y.run:()V"], keys(&table));
    }

    #[test]
    fn exclude_ctors_removes_init_and_accessors() {
        let mut table = table(&[
            ("a/B", "\"<init>\":()V"),
            ("a/B", "access$000:(La/B;)I"),
            ("a/B", "run:()V"),
        ]);

        let removed = exclude_ctors(&mut table);

        assert_eq!(2, removed.len());
        assert_eq!(vec!["a/B.run:()V"], keys(&table));
    }

    #[test]
    fn remove_over_defined_uses_class_count() {
        let mut table = table(&[
            ("a/A", "toString:()Ljava/lang/String;"),
            ("a/B", "toString:()Ljava/lang/String;"),
            ("a/C", "toString:()Ljava/lang/String;"),
            ("a/A", "run:()V"),
        ]);

        let removed = remove_over_defined(&mut table, 2);

        assert_eq!(vec!["toString:()Ljava/lang/String;".to_string()], removed);
        assert_eq!(vec!["a/A.run:()V"], keys(&table));
    }

    #[test]
    fn select_targets_orders_by_class_and_counts() {
        let table = table(&[("b/B", "a:()V"), ("a/A", "z:()V"), ("a/A", "b:()V"), ("c/C", "x:()V")]);

        let (targets, per_class) = select_targets(&table, &ClassPatterns::new(&["a/*", "b/B"]));

        let names: Vec<String> = targets.iter().map(ToString::to_string).collect();
        assert_eq!(vec!["a/A.b:()V", "a/A.z:()V", "b/B.a:()V"], names);
        assert_eq!(Some(&2), per_class.get("a/A"));
        assert_eq!(None, per_class.get("c/C"));
    }

    #[test]
    fn declared_methods_and_widely_defined_signatures() {
        let table = table(&[("a/A", "m:()V"), ("a/B", "m:()V"), ("a/A", "n:()V")]);

        let declared = declared_methods(&table);

        assert_eq!(2, declared["a/A"].len());
        assert_eq!(vec![("m:()V".to_string(), 2)], widely_defined(&table, 2));
    }
}
