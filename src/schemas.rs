use bson::DateTime;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub type UserId = String;

/// One user record per resolved external identity. `username_lower` is the
/// lookup key and carries the unique index; `username` keeps the original
/// casing for display.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub auth_id: String,
    pub username: String,
    pub username_lower: String,
    pub display_name: String,
    pub email: String,
    pub photo_url: Option<String>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

/// Subset of a User safe to embed in responses about other people.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPublic {
    pub auth_id: String,
    pub username: String,
    pub display_name: String,
    pub photo_url: Option<String>,
}

impl From<&User> for UserPublic {
    fn from(user: &User) -> Self {
        UserPublic {
            auth_id: user.auth_id.clone(),
            username: user.username.clone(),
            display_name: user.display_name.clone(),
            photo_url: user.photo_url.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Member,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub user_id: UserId,
    pub role: Role,
    pub joined_at: DateTime,
}

/// Membership is unique per `user_id`; the owner is always present as the
/// first member and the list never shrinks.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub name: String,
    pub owner_id: UserId,
    pub members: Vec<Member>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BetStatus {
    Proposed,
    Active,
    Completed,
    Cancelled,
}

impl BetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BetStatus::Proposed => "proposed",
            BetStatus::Active => "active",
            BetStatus::Completed => "completed",
            BetStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BetStatus::Completed | BetStatus::Cancelled)
    }
}

/// A group member's standing within one bet. `accepted_at` is set exactly
/// once, on the first acceptance, and feeds the winner tie-break.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: UserId,
    pub accepted: bool,
    pub accepted_at: Option<DateTime>,
    pub spending: f64,
}

/// Immutable spending entry, embedded in the bet that owns it.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub user_id: UserId,
    pub amount: f64,
    pub merchant: String,
    pub category: Option<String>,
    pub occurred_on: NaiveDate,
    pub created_at: DateTime,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bet {
    pub id: String,
    pub group_id: String,
    pub created_by: UserId,
    pub title: String,
    pub description: Option<String>,
    pub budget_limit: f64,
    pub deadline: NaiveDate,
    pub status: BetStatus,
    pub participants: Vec<Participant>,
    pub transactions: Vec<Transaction>,
    pub winner_id: Option<UserId>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
    pub activated_at: Option<DateTime>,
    pub completed_at: Option<DateTime>,
}

pub fn new_id() -> String {
    bson::oid::ObjectId::new().to_hex()
}

/// Cent precision for monetary values. Posted amounts are rounded before
/// they are written; accumulated spending is rounded again wherever it is
/// compared, since a sum of cent amounts can carry float dust.
pub(crate) fn round2(n: f64) -> f64 {
    (n * 100.0).round() / 100.0
}
