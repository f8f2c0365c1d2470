use std::fmt;

use compact_str::CompactString;

use crate::geo::slug;

/// A named broadcast group.
///
/// Connections join channels at registration time; the router and the
/// matcher address channels instead of individual connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Country(CompactString),
    State(CompactString),
    City(CompactString),
    /// Every connection registered under one user id.
    User(CompactString),
}

impl Channel {
    pub fn country(name: &str) -> Option<Self> {
        slug(name).map(Channel::Country)
    }

    pub fn state(name: &str) -> Option<Self> {
        slug(name).map(Channel::State)
    }

    pub fn city(name: &str) -> Option<Self> {
        slug(name).map(Channel::City)
    }

    /// User channels keep the id verbatim.
    pub fn user(user_id: &str) -> Self {
        Channel::User(CompactString::from(user_id))
    }

    pub const fn scope(&self) -> &'static str {
        match self {
            Channel::Country(_) => "country",
            Channel::State(_) => "state",
            Channel::City(_) => "city",
            Channel::User(_) => "user",
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Channel::Country(n) | Channel::State(n) | Channel::City(n) | Channel::User(n) => n,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope(), self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names_are_slugged() {
        assert_eq!(Channel::city("Navi Mumbai").unwrap().to_string(), "city:navi-mumbai");
        assert_eq!(Channel::state("MAHARASHTRA").unwrap().to_string(), "state:maharashtra");
        assert_eq!(Channel::country("India").unwrap().to_string(), "country:india");
        assert!(Channel::city("  ").is_none());
    }

    #[test]
    fn test_user_channel_keeps_id() {
        assert_eq!(Channel::user("User-42").to_string(), "user:User-42");
    }
}
