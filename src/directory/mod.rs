//! Organization membership lookup.
//!
//! The surrounding product owns membership; the engine only needs to know
//! which users to copy on org-level notices.

use dashmap::DashMap;

use crate::types::{OrgId, UserId};

#[async_trait::async_trait]
pub trait OrgDirectory: Send + Sync {
    /// Users holding owner or admin role in the organization.
    async fn admins(&self, org_id: OrgId) -> Vec<UserId>;
}

/// In-memory directory for tests and single-instance deployments.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    admins: DashMap<OrgId, Vec<UserId>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_admin(&self, org_id: OrgId, user_id: UserId) {
        let mut entry = self.admins.entry(org_id).or_default();
        if !entry.contains(&user_id) {
            entry.push(user_id);
        }
    }

    pub fn remove_admin(&self, org_id: OrgId, user_id: UserId) {
        if let Some(mut entry) = self.admins.get_mut(&org_id) {
            entry.retain(|u| *u != user_id);
        }
    }
}

#[async_trait::async_trait]
impl OrgDirectory for MemoryDirectory {
    async fn admins(&self, org_id: OrgId) -> Vec<UserId> {
        self.admins
            .get(&org_id)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_admins_deduplicated() {
        let directory = MemoryDirectory::new();
        let org = OrgId::new();
        let user = UserId::new();

        directory.add_admin(org, user);
        directory.add_admin(org, user);

        assert_eq!(directory.admins(org).await, vec![user]);
        assert!(directory.admins(OrgId::new()).await.is_empty());
    }
}
