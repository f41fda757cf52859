//! Identity collaborator boundary.
//!
//! Credentials are issued elsewhere; this crate only consumes the user id and
//! role carried by a verified token, and looks roles up when ordering
//! conversation lists.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    User,
    Seller,
    Admin,
}

impl Role {
    /// Conversations with a privileged participant are listed first.
    pub fn is_privileged(&self) -> bool {
        matches!(self, Role::Admin)
    }

    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "admin" => Role::Admin,
            "seller" => Role::Seller,
            _ => Role::User,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub role: Role,
}

#[async_trait]
pub trait RoleDirectory: Send + Sync {
    /// Users missing from the result are treated as `Role::User`.
    async fn roles_of(&self, user_ids: &[Uuid]) -> Result<HashMap<Uuid, Role>>;

    /// Called with every verified identity.
    async fn observe(&self, _identity: Identity) -> Result<()> {
        Ok(())
    }
}

/// Reads roles from the identity provider's `users` table.
#[derive(Clone)]
pub struct PgRoleDirectory {
    pool: PgPool,
}

impl PgRoleDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoleDirectory for PgRoleDirectory {
    async fn roles_of(&self, user_ids: &[Uuid]) -> Result<HashMap<Uuid, Role>> {
        let rows: Vec<(Uuid, String)> =
            sqlx::query_as("SELECT id, role FROM users WHERE id = ANY($1)")
                .bind(user_ids.to_vec())
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(id, role)| (id, Role::parse(&role)))
            .collect())
    }
}

/// Role map kept in memory, filled from verified tokens or set directly.
#[derive(Default)]
pub struct StaticRoleDirectory {
    roles: DashMap<Uuid, Role>,
}

impl StaticRoleDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, user_id: Uuid, role: Role) {
        self.roles.insert(user_id, role);
    }
}

#[async_trait]
impl RoleDirectory for StaticRoleDirectory {
    async fn roles_of(&self, user_ids: &[Uuid]) -> Result<HashMap<Uuid, Role>> {
        Ok(user_ids
            .iter()
            .filter_map(|id| self.roles.get(id).map(|role| (*id, *role)))
            .collect())
    }

    async fn observe(&self, identity: Identity) -> Result<()> {
        self.grant(identity.user_id, identity.role);
        Ok(())
    }
}
