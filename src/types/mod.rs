//! Core identifiers and the actor context passed into every engine call.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Credit amount in cents. One credit is one cent of markup-priced revenue.
pub type Credits = i64;

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrgId(pub Uuid);

impl OrgId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OrgId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OrgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OrgId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for OrgId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Reserved id for engine-originated entries (grants, resets).
    pub fn system() -> Self {
        Self(Uuid::nil())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for UserId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UsageFactId(pub Uuid);

impl UsageFactId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UsageFactId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UsageFactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Product feature a member allocation is scoped to (e.g. `content_generation`).
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Feature(String);

impl Feature {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Feature {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Feature {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Role the acting user holds, as resolved by the caller.
///
/// The engine never re-derives roles from ambient session state; every call
/// receives an explicit [`ActorContext`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Member,
    Admin,
    Owner,
    SuperAdmin,
}

impl ActorRole {
    /// Owners and admins (and platform super-admins) spend the org pool directly.
    pub fn spends_org_pool(&self) -> bool {
        matches!(self, Self::Admin | Self::Owner | Self::SuperAdmin)
    }

    pub fn is_super_admin(&self) -> bool {
        matches!(self, Self::SuperAdmin)
    }
}

/// Who is acting, on behalf of which organization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorContext {
    pub org_id: OrgId,
    pub user_id: UserId,
    pub role: ActorRole,
}

impl ActorContext {
    pub fn new(org_id: OrgId, user_id: UserId, role: ActorRole) -> Self {
        Self {
            org_id,
            user_id,
            role,
        }
    }

    pub fn member(org_id: OrgId, user_id: UserId) -> Self {
        Self::new(org_id, user_id, ActorRole::Member)
    }

    pub fn admin(org_id: OrgId, user_id: UserId) -> Self {
        Self::new(org_id, user_id, ActorRole::Admin)
    }

    pub fn owner(org_id: OrgId, user_id: UserId) -> Self {
        Self::new(org_id, user_id, ActorRole::Owner)
    }

    pub fn super_admin(org_id: OrgId, user_id: UserId) -> Self {
        Self::new(org_id, user_id, ActorRole::SuperAdmin)
    }
}

/// Half-open time range `[start, end)` for ledger and usage queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The `days` leading up to now.
    pub fn last_days(days: i64) -> Self {
        let end = Utc::now();
        Self {
            start: end - chrono::Duration::days(days),
            end,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}
