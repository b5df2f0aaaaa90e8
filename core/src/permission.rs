//! Authorisation oracle.
//!
//! RULE: The core never authenticates. Every entry point receives a resolved
//! actor and asks the oracle whether that actor may act.

use crate::{
    error::{DispatchError, DispatchResult},
    types::ActorId,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ControlTime,
    ManageTime,
    ManageTimetables,
    ManageTrains,
    ManageStations,
}

pub trait PermissionOracle: Send + Sync {
    /// `scope` narrows the question to one resource (e.g. a train id).
    fn has_permission(&self, actor: &str, permission: Permission, scope: Option<&str>) -> bool;

    fn check_permission(&self, actor: &str, permission: Permission) -> DispatchResult<()> {
        if self.has_permission(actor, permission, None) {
            Ok(())
        } else {
            Err(DispatchError::PermissionDenied {
                actor: actor.to_string(),
                permission,
            })
        }
    }
}

/// In-memory grant table. Scoped grants take precedence only in the
/// positive direction: a global grant always satisfies a scoped question.
#[derive(Debug, Clone, Default)]
pub struct StaticPermissions {
    global: HashMap<ActorId, HashSet<Permission>>,
    scoped: HashMap<(ActorId, String), HashSet<Permission>>,
}

impl StaticPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&mut self, actor: &str, permission: Permission) -> &mut Self {
        self.global.entry(actor.to_string()).or_default().insert(permission);
        self
    }

    pub fn grant_all(&mut self, actor: &str) -> &mut Self {
        for p in [
            Permission::ControlTime,
            Permission::ManageTime,
            Permission::ManageTimetables,
            Permission::ManageTrains,
            Permission::ManageStations,
        ] {
            self.grant(actor, p);
        }
        self
    }

    pub fn grant_scoped(&mut self, actor: &str, permission: Permission, scope: &str) -> &mut Self {
        self.scoped
            .entry((actor.to_string(), scope.to_string()))
            .or_default()
            .insert(permission);
        self
    }

    pub fn revoke(&mut self, actor: &str, permission: Permission) {
        if let Some(set) = self.global.get_mut(actor) {
            set.remove(&permission);
        }
    }
}

impl PermissionOracle for StaticPermissions {
    fn has_permission(&self, actor: &str, permission: Permission, scope: Option<&str>) -> bool {
        if self.global.get(actor).is_some_and(|s| s.contains(&permission)) {
            return true;
        }
        match scope {
            Some(scope) => self
                .scoped
                .get(&(actor.to_string(), scope.to_string()))
                .is_some_and(|s| s.contains(&permission)),
            None => false,
        }
    }
}
