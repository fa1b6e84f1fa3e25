//! Newtypes for Scaleway lifecycle values to avoid stringly-typed code.

use std::ops::Deref;

use crate::provider::InstanceState;

macro_rules! newtype {
    ($name:ident) => {
        #[derive(Clone, Debug, Eq, PartialEq)]
        pub(crate) struct $name(String);

        impl $name {
            pub(crate) const fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }
    };
}

newtype!(ServerState);
newtype!(Action);

impl ServerState {
    /// Maps the Scaleway server state onto the provider-neutral lifecycle.
    pub(crate) fn lifecycle(&self) -> InstanceState {
        match self.as_str() {
            "running" => InstanceState::Running,
            "locked" => InstanceState::Failed,
            _ => InstanceState::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("running", InstanceState::Running)]
    #[case("starting", InstanceState::Pending)]
    #[case("stopped", InstanceState::Pending)]
    #[case("stopped in place", InstanceState::Pending)]
    #[case("stopping", InstanceState::Pending)]
    #[case("locked", InstanceState::Failed)]
    fn maps_server_states(#[case] raw: &str, #[case] expected: InstanceState) {
        assert_eq!(ServerState::from(raw).lifecycle(), expected);
    }
}
