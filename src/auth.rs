// Authorization model for ledger operations.
//
// The authentication collaborator (token issuance, password checks) lives
// outside this crate; it hands every request an already-authenticated
// principal. The ledger core trusts that input and enforces only the
// ownership rule: an agent may touch the candidates assigned to them.

use serde::{Deserialize, Serialize};

use crate::db::Candidate;
use crate::error::{LedgerError, Result};

/// Staff roles, closed set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SuperAdmin,
    Admin,
    Agent,
    Accountant,
    DataEntry,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::SuperAdmin => "super_admin",
            Role::Admin => "admin",
            Role::Agent => "agent",
            Role::Accountant => "accountant",
            Role::DataEntry => "data_entry",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "super_admin" => Some(Role::SuperAdmin),
            "admin" => Some(Role::Admin),
            "agent" => Some(Role::Agent),
            "accountant" => Some(Role::Accountant),
            "data_entry" => Some(Role::DataEntry),
            _ => None,
        }
    }

    /// Data-entry operators manage candidate files, not money.
    pub fn may_record_payments(&self) -> bool {
        matches!(
            self,
            Role::SuperAdmin | Role::Admin | Role::Accountant | Role::Agent
        )
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authenticated caller of a ledger operation
#[derive(Debug, Clone, Copy)]
pub struct Principal {
    pub id: i64,
    pub role: Role,
}

impl Principal {
    pub fn new(id: i64, role: Role) -> Self {
        Self { id, role }
    }

    /// Agents see only their own candidates; every other role sees all.
    pub fn may_access_candidate(&self, candidate: &Candidate) -> bool {
        match self.role {
            Role::Agent => candidate.agent_id == self.id,
            _ => true,
        }
    }

    pub fn ensure_may_access(&self, candidate: &Candidate) -> Result<()> {
        if self.may_access_candidate(candidate) {
            Ok(())
        } else {
            Err(LedgerError::Forbidden(
                "You can only access payments for your own candidates".to_string(),
            ))
        }
    }

    pub fn ensure_may_record_payments(&self) -> Result<()> {
        if self.role.may_record_payments() {
            Ok(())
        } else {
            Err(LedgerError::Forbidden(format!(
                "Role {} may not record payments",
                self.role
            )))
        }
    }
}
