//! Role-based policy resolution.
//!
//! Access to a connection is granted iff the caller's role set intersects the
//! spec's allowed roles — plain set intersection, order-independent. Whether
//! an operation then needs external approval is a property of the spec,
//! unless the caller holds a role the spec marks approval-exempt.

use std::sync::Arc;

use tracing::debug;

use crate::generation::{Catalog, ConnectionSpec};
use crate::{Error, Result};

/// Outcome of a successful policy resolution.
#[derive(Debug, Clone)]
pub struct ResolvedAccess {
    /// The matched connection spec.
    pub spec: Arc<ConnectionSpec>,
    /// Whether this caller's operations go through the approval gate.
    pub approval_required: bool,
}

/// Resolve a role set against a named connection.
///
/// # Errors
///
/// [`Error::ConnectionNotFound`] for an unknown name,
/// [`Error::Forbidden`] when the role sets do not intersect.
pub fn resolve(catalog: &Catalog, roles: &[String], name: &str) -> Result<ResolvedAccess> {
    let spec = catalog
        .get(name)
        .ok_or_else(|| Error::ConnectionNotFound(name.to_string()))?;

    if !intersects(roles, &spec.allowed_roles) {
        debug!(connection = %name, "No role overlap");
        return Err(Error::Forbidden(format!(
            "no role grants access to connection '{name}'"
        )));
    }

    let approval_required =
        spec.approval_required && !intersects(roles, &spec.approval_exempt_roles);

    Ok(ResolvedAccess {
        spec,
        approval_required,
    })
}

/// The specs a role set may address, for connection listing.
#[must_use]
pub fn visible_specs(catalog: &Catalog, roles: &[String]) -> Vec<Arc<ConnectionSpec>> {
    let mut specs: Vec<Arc<ConnectionSpec>> = catalog
        .iter()
        .filter(|spec| intersects(roles, &spec.allowed_roles))
        .map(Arc::clone)
        .collect();
    specs.sort_by(|a, b| a.name.cmp(&b.name));
    specs
}

/// Set intersection on role lists.
fn intersects(a: &[String], b: &[String]) -> bool {
    a.iter().any(|role| b.contains(role))
}
