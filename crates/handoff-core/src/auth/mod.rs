//! Access guard and membership registry.
//!
//! Every public operation names a required role set; the guard resolves the
//! ambient caller identity, validates project membership, and produces the
//! [`AuthContext`] the handler works with. Handlers never accept a caller
//! identity from request parameters — any handler that did would let a
//! client claim or render as anyone.
//!
//! Owner is a superset of every role. Cross-project lookups are rejected as
//! `NotFound`, not `Forbidden`, so existence does not leak across projects.


use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::core::Core;
use crate::error::CoreError;
use crate::events::Scope;

/// A project membership role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Full control, superset of all roles.
    Owner,
    /// Human operator: claims and renders decisions.
    Operator,
    /// Read-only access.
    Viewer,
    /// Automated worker: admits commands, reports artifacts, requests
    /// decisions.
    Bot,
}

impl Role {
    /// Returns the string representation of this role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Operator => "operator",
            Self::Viewer => "viewer",
            Self::Bot => "bot",
        }
    }

    /// Parses a role from its string representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Self::Owner),
            "operator" => Some(Self::Operator),
            "viewer" => Some(Self::Viewer),
            "bot" => Some(Self::Bot),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The ambient caller identity, resolved by the adapter from its session or
/// token — never from request parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// The authenticated user (or bot principal).
    pub user_id: String,
    /// The tenant the session belongs to.
    pub tenant_id: String,
}

impl Identity {
    /// Creates an identity.
    #[must_use]
    pub fn new(user_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_id: tenant_id.into(),
        }
    }
}

/// The resolved authorization context handed to handlers.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// The caller's user id.
    pub user_id: String,
    /// The caller's tenant.
    pub tenant_id: String,
    /// The project the call is scoped to.
    pub project_id: String,
    /// The caller's role in that project.
    pub role: Role,
}

impl AuthContext {
    /// This context's scope.
    #[must_use]
    pub fn scope(&self) -> Scope {
        Scope::new(&self.tenant_id, &self.project_id)
    }
}

/// A project member row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    /// The member's user id.
    pub user_id: String,
    /// The member's role.
    pub role: Role,
}

fn member_role(
    conn: &Connection,
    tenant_id: &str,
    project_id: &str,
    user_id: &str,
) -> Result<Option<Role>, CoreError> {
    let role: Option<String> = conn
        .query_row(
            "SELECT role FROM members WHERE tenant_id = ?1 AND project_id = ?2 AND user_id = ?3",
            params![tenant_id, project_id, user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(role.and_then(|r| Role::parse(&r)))
}

fn owner_count(conn: &Connection, tenant_id: &str, project_id: &str) -> Result<i64, CoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM members WHERE tenant_id = ?1 AND project_id = ?2 AND role = 'owner'",
        params![tenant_id, project_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

impl Core {
    /// Resolves the caller and enforces the required role set.
    ///
    /// Accepts the call when the caller's role is `owner` or is in
    /// `required`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Unauthenticated`] when the identity is empty.
    /// - [`CoreError::NotAMember`] when the caller has no membership.
    /// - [`CoreError::InsufficientPermissions`] when the role is not
    ///   permitted.
    pub(crate) fn guard(
        &self,
        ident: &Identity,
        project_id: &str,
        required: &[Role],
    ) -> Result<AuthContext, CoreError> {
        if ident.user_id.is_empty() {
            return Err(CoreError::Unauthenticated);
        }
        let role = self
            .store()
            .with_conn(|conn| member_role(conn, &ident.tenant_id, project_id, &ident.user_id))?
            .ok_or_else(|| CoreError::NotAMember {
                user_id: ident.user_id.clone(),
                project_id: project_id.to_string(),
            })?;
        if role != Role::Owner && !required.contains(&role) {
            return Err(CoreError::InsufficientPermissions {
                required: required.to_vec(),
                actual: role,
            });
        }
        Ok(AuthContext {
            user_id: ident.user_id.clone(),
            tenant_id: ident.tenant_id.clone(),
            project_id: project_id.to_string(),
            role,
        })
    }

    /// Creates a project and makes the caller its first owner.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Unauthenticated`] when the identity is empty.
    /// - [`CoreError::ProjectExists`] on duplicate initialization.
    pub fn init_project(
        &self,
        ident: &Identity,
        project_id: &str,
        name: &str,
    ) -> Result<(), CoreError> {
        if ident.user_id.is_empty() {
            return Err(CoreError::Unauthenticated);
        }
        self.store().with_tx(|tx| {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO projects (tenant_id, project_id, name, created_at, \
                 created_by) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    ident.tenant_id,
                    project_id,
                    name,
                    Self::now_ms(),
                    ident.user_id
                ],
            )?;
            if inserted == 0 {
                return Err(CoreError::ProjectExists {
                    project_id: project_id.to_string(),
                });
            }
            tx.execute(
                "INSERT INTO members (tenant_id, project_id, user_id, role) \
                 VALUES (?1, ?2, ?3, 'owner')",
                params![ident.tenant_id, project_id, ident.user_id],
            )?;
            tracing::info!(project_id, created_by = %ident.user_id, "project initialized");
            Ok(())
        })
    }

    /// Adds a member to a project. Owner only.
    ///
    /// # Errors
    ///
    /// [`CoreError::DuplicateMember`] when the user already has a role.
    pub fn add_member(
        &self,
        ident: &Identity,
        project_id: &str,
        user_id: &str,
        role: Role,
    ) -> Result<(), CoreError> {
        let ctx = self.guard(ident, project_id, &[Role::Owner])?;
        self.store().with_tx(|tx| {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO members (tenant_id, project_id, user_id, role) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![ctx.tenant_id, ctx.project_id, user_id, role.as_str()],
            )?;
            if inserted == 0 {
                return Err(CoreError::DuplicateMember {
                    user_id: user_id.to_string(),
                });
            }
            Ok(())
        })
    }

    /// Removes a member from a project. Owner only; the last owner cannot be
    /// removed.
    ///
    /// # Errors
    ///
    /// - [`CoreError::NotAMember`] when the user has no membership.
    /// - [`CoreError::CannotRemoveLastOwner`] when removal would leave the
    ///   project ownerless.
    pub fn remove_member(
        &self,
        ident: &Identity,
        project_id: &str,
        user_id: &str,
    ) -> Result<(), CoreError> {
        let ctx = self.guard(ident, project_id, &[Role::Owner])?;
        self.store().with_tx(|tx| {
            let role = member_role(tx, &ctx.tenant_id, &ctx.project_id, user_id)?.ok_or_else(
                || CoreError::NotAMember {
                    user_id: user_id.to_string(),
                    project_id: ctx.project_id.clone(),
                },
            )?;
            if role == Role::Owner && owner_count(tx, &ctx.tenant_id, &ctx.project_id)? <= 1 {
                return Err(CoreError::CannotRemoveLastOwner);
            }
            tx.execute(
                "DELETE FROM members WHERE tenant_id = ?1 AND project_id = ?2 AND user_id = ?3",
                params![ctx.tenant_id, ctx.project_id, user_id],
            )?;
            Ok(())
        })
    }

    /// Lists a project's members. Any member.
    ///
    /// # Errors
    ///
    /// Returns an error when the caller is not a member or the query fails.
    pub fn list_members(
        &self,
        ident: &Identity,
        project_id: &str,
    ) -> Result<Vec<Member>, CoreError> {
        let ctx = self.guard(
            ident,
            project_id,
            &[Role::Owner, Role::Operator, Role::Viewer, Role::Bot],
        )?;
        self.store().with_conn(|conn| {
            let members = conn
                .prepare(
                    "SELECT user_id, role FROM members WHERE tenant_id = ?1 AND project_id = ?2 \
                     ORDER BY user_id ASC",
                )?
                .query_map(params![ctx.tenant_id, ctx.project_id], |row| {
                    let role: String = row.get(1)?;
                    Ok((row.get::<_, String>(0)?, role))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(members
                .into_iter()
                .filter_map(|(user_id, role)| {
                    Role::parse(&role).map(|role| Member { user_id, role })
                })
                .collect())
        })
    }

    /// Returns the caller's own role in a project. Any member.
    ///
    /// # Errors
    ///
    /// Returns an error when the caller is not a member.
    pub fn my_role(&self, ident: &Identity, project_id: &str) -> Result<Role, CoreError> {
        let ctx = self.guard(
            ident,
            project_id,
            &[Role::Owner, Role::Operator, Role::Viewer, Role::Bot],
        )?;
        Ok(ctx.role)
    }
}
