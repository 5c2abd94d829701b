use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{EngineError, EngineResult};

/// Caller role resolved by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Tenant,
}

/// Resolved authentication context handed to the engine by transports.
///
/// Credential lookup happens upstream; the engine only decides whether the
/// resolved identity may touch a given tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    /// Tenants this caller may operate on. Ignored for `Role::Admin`.
    pub tenants: HashSet<String>,
    pub role: Role,
}

impl AuthContext {
    pub fn admin() -> Self {
        Self {
            tenants: HashSet::new(),
            role: Role::Admin,
        }
    }

    pub fn for_tenant(tenant: impl Into<String>) -> Self {
        let mut tenants = HashSet::new();
        tenants.insert(tenant.into());
        Self {
            tenants,
            role: Role::Tenant,
        }
    }

    pub fn allows(&self, tenant: &str) -> bool {
        self.role == Role::Admin || self.tenants.contains(tenant)
    }

    /// Raise `forbidden` when the context does not cover `tenant`.
    pub fn ensure_tenant(&self, tenant: &str) -> EngineResult<()> {
        if self.allows(tenant) {
            Ok(())
        } else {
            Err(EngineError::Forbidden(format!(
                "token is not authorized for tenant '{tenant}'"
            )))
        }
    }
}
