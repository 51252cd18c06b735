pub(crate) mod undigged;
pub(crate) mod untracked;

/// Metadata describing a traversal policy.
#[derive(Clone, Debug)]
pub(crate) struct PolicyMetadata {
    pub(crate) id: &'static str,
    pub(crate) description: &'static str,
}

/// Decides which call sites the control-flow compiler drops entirely.
pub(crate) trait UntrackedCallPolicy {
    fn metadata(&self) -> PolicyMetadata;
    fn is_untracked(&self, class: Option<&str>, method: &str) -> bool;
}

/// Decides which callees the n-gram search never expands into.
pub(crate) trait DigPolicy {
    fn metadata(&self) -> PolicyMetadata;
    fn is_undigged(&self, method: &str) -> bool;
}

/// Policy that tracks every call.
#[cfg(test)]
pub(crate) struct TrackEverything;

#[cfg(test)]
impl UntrackedCallPolicy for TrackEverything {
    fn metadata(&self) -> PolicyMetadata {
        PolicyMetadata {
            id: "TRACK_ALL",
            description: "Every call site is kept",
        }
    }

    fn is_untracked(&self, _class: Option<&str>, _method: &str) -> bool {
        false
    }
}
