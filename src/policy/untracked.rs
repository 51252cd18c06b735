use crate::policy::{PolicyMetadata, UntrackedCallPolicy};

/// Drops calls on library builder/iterator classes and synthetic accessors.
pub(crate) struct LibraryHelperCalls;

impl UntrackedCallPolicy for LibraryHelperCalls {
    fn metadata(&self) -> PolicyMetadata {
        PolicyMetadata {
            id: "UNTRACKED_LIBRARY_HELPERS",
            description: "Calls on StringBuilder/Iterator and access$ accessors",
        }
    }

    fn is_untracked(&self, class: Option<&str>, method: &str) -> bool {
        matches!(class, Some("java/lang/StringBuilder" | "java/util/Iterator"))
            || method.contains("access$")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_helper_calls_are_untracked() {
        let policy = LibraryHelperCalls;

        assert!(policy.is_untracked(
            Some("java/lang/StringBuilder"),
            "append:(Ljava/lang/String;)Ljava/lang/StringBuilder;"
        ));
        assert!(policy.is_untracked(Some("java/util/Iterator"), "next:()Ljava/lang/Object;"));
        assert!(policy.is_untracked(None, "access$000:(La/B;)I"));
    }

    #[test]
    fn application_calls_are_tracked() {
        let policy = LibraryHelperCalls;

        assert!(!policy.is_untracked(None, "next:()Ljava/lang/Object;"));
        assert!(!policy.is_untracked(Some("java/util/List"), "size:()I"));
    }
}
