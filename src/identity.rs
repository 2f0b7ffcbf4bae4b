//! Identity-provider collaborator.
//!
//! The controller does not authenticate anyone; it only needs to know who
//! the current caller is and whether one principal holds the privileges of
//! another. Both come from an [`IdentityProvider`] supplied by the host.

/// An opaque principal name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal(String);

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Supplies the caller's principal and the privilege-comparison predicate.
pub trait IdentityProvider: Send + Sync {
    /// The principal on whose behalf controller operations run.
    fn current(&self) -> Principal;

    /// Whether `caller` holds the privileges of `owner`.
    fn has_privileges_of(&self, caller: &Principal, owner: &Principal) -> bool;
}

/// Session-local identity: a fixed principal, optionally with superuser
/// rights over every owner.
pub struct SessionIdentity {
    principal: Principal,
    superuser: bool,
}

impl SessionIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            principal: Principal::new(name),
            superuser: false,
        }
    }

    pub fn superuser(name: impl Into<String>) -> Self {
        Self {
            principal: Principal::new(name),
            superuser: true,
        }
    }
}

impl IdentityProvider for SessionIdentity {
    fn current(&self) -> Principal {
        self.principal.clone()
    }

    fn has_privileges_of(&self, caller: &Principal, owner: &Principal) -> bool {
        self.superuser || caller == owner
    }
}
