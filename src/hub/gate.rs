use crate::{doc_id, Document, Error, Result, Role};

/// Roles allowed to invoke privileged operations unless configured otherwise.
pub const DEFAULT_PRIVILEGED_ROLES: &[Role] = &[Role::Admin];

/// Policy check for privileged operations.
///
/// The transport carries no trusted identity, so the caller names an account
/// id and the gate resolves it against the live Account collection.
#[derive(Debug, Clone)]
pub struct Gate {
    allowed: Vec<Role>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new(DEFAULT_PRIVILEGED_ROLES.to_vec())
    }
}

impl Gate {
    pub fn new(allowed: Vec<Role>) -> Self {
        Self { allowed }
    }

    /// Returns the requester's role if it is on the allow-list.
    pub fn authorize(&self, accounts: &[Document], requester_id: &str) -> Result<Role> {
        let account = accounts
            .iter()
            .find(|a| doc_id(a) == Some(requester_id))
            .ok_or_else(|| Error::Unauthorized(format!("unknown requester {}", requester_id)))?;

        match Role::of(account) {
            Some(role) if self.allowed.contains(&role) => Ok(role),
            Some(role) => Err(Error::Unauthorized(format!("role {:?} may not perform this operation", role))),
            None => Err(Error::Unauthorized(format!("requester {} has no recognised role", requester_id))),
        }
    }
}
