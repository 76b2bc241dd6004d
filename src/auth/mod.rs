//! Authorization seam.
//!
//! Statements compute the privileges they require; an [`Authorizer`]
//! decides whether a credential set holds them. Authorization failures
//! abort the request before planning.

use crate::errors::{Error, Result};

/// An action on a keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Write,
    Admin,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Write => "write",
            Action::Admin => "admin",
        }
    }

    /// Whether holding `self` satisfies a requirement of `required`.
    fn satisfies(&self, required: Action) -> bool {
        match (self, required) {
            (Action::Admin, _) => true,
            (Action::Write, Action::Read) | (Action::Write, Action::Write) => true,
            (Action::Read, Action::Read) => true,
            _ => false,
        }
    }
}

/// The set of privileges a statement requires, or a credential holds.
#[derive(Debug, Clone, Default)]
pub struct Privileges {
    pairs: Vec<(String, Action)>,
}

impl Privileges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, keyspace: impl Into<String>, action: Action) {
        let keyspace = keyspace.into();
        if !self
            .pairs
            .iter()
            .any(|(k, a)| *k == keyspace && *a == action)
        {
            self.pairs.push((keyspace, action));
        }
    }

    /// Union of two privilege sets.
    pub fn add_all(&mut self, other: &Privileges) {
        for (k, a) in &other.pairs {
            self.add(k.clone(), *a);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Action)> {
        self.pairs.iter().map(|(k, a)| (k.as_str(), *a))
    }

    /// Whether this (held) set satisfies `keyspace`/`action`.
    pub fn implies(&self, keyspace: &str, action: Action) -> bool {
        self.pairs
            .iter()
            .any(|(k, a)| k == keyspace && a.satisfies(action))
    }
}

/// Credentials presented with a request.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub users: Vec<String>,
}

impl Credentials {
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            users: vec![name.into()],
        }
    }
}

/// Authorization hook. Implementations typically consult an external
/// directory; the default allows everything.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, required: &Privileges, credentials: &Credentials) -> Result<()>;
}

/// Allows every request. Used by embedded deployments and tests.
#[derive(Debug, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _required: &Privileges, _credentials: &Credentials) -> Result<()> {
        Ok(())
    }
}

/// Grants each named user a fixed privilege set.
#[derive(Debug, Default)]
pub struct StaticAuthorizer {
    grants: std::collections::HashMap<String, Privileges>,
}

impl StaticAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&mut self, user: impl Into<String>, keyspace: impl Into<String>, action: Action) {
        self.grants
            .entry(user.into())
            .or_default()
            .add(keyspace, action);
    }
}

impl Authorizer for StaticAuthorizer {
    fn authorize(&self, required: &Privileges, credentials: &Credentials) -> Result<()> {
        for (keyspace, action) in required.iter() {
            let held = credentials.users.iter().any(|u| {
                self.grants
                    .get(u)
                    .map_or(false, |p| p.implies(keyspace, action))
            });
            if !held {
                return Err(Error::auth(format!(
                    "user is not authorized to {} {}",
                    action.as_str(),
                    keyspace
                )));
            }
        }
        Ok(())
    }
}
