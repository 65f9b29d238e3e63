/// Priority of a request; the group forwards the highest priority of its members to the
/// network source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RequestPriority {
    Throttled,
    Idle,
    #[default]
    Lowest,
    Low,
    Medium,
    Highest,
}

impl RequestPriority {
    pub const MINIMUM: RequestPriority = RequestPriority::Throttled;
    pub const MAXIMUM: RequestPriority = RequestPriority::Highest;
}
