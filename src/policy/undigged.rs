use crate::policy::{DigPolicy, PolicyMetadata};

const UNDIGGED_METHODS: &[&str] = &[
    "getClass:()Ljava/lang/Class;",
    "equals:(Ljava/lang/Object;)Z",
    "hashCode:()I",
    "compareTo:(Ljava/lang/Object;)I",
    "toString:()Ljava/lang/String;",
    "get:(Ljava/lang/Object;)Ljava/lang/Object;",
    "put:(Ljava/lang/Object;Ljava/lang/Object;)Ljava/lang/Object;",
    "getProperty:(Ljava/lang/Object;)Ljava/lang/Object;",
];

/// Keeps the search out of `Object` protocol methods and map accessors,
/// which have too many overriders to be worth expanding.
pub(crate) struct CommonObjectMethods;

impl DigPolicy for CommonObjectMethods {
    fn metadata(&self) -> PolicyMetadata {
        PolicyMetadata {
            id: "UNDIGGED_OBJECT_PROTOCOL",
            description: "equals/hashCode/toString and map accessors",
        }
    }

    fn is_undigged(&self, method: &str) -> bool {
        UNDIGGED_METHODS.contains(&method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_protocol_is_undigged() {
        assert!(CommonObjectMethods.is_undigged("hashCode:()I"));
        assert!(CommonObjectMethods.is_undigged("equals:(Ljava/lang/Object;)Z"));
        assert!(!CommonObjectMethods.is_undigged("equals:(La/B;)Z"));
    }
}
