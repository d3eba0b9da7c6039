use actix_web::{get, post, web, HttpResponse};
use bson::{doc, DateTime};
use futures::TryStreamExt;
use mongodb::options::FindOptions;
use serde::Deserialize;

use crate::error::ApiError;
use crate::identity;
use crate::schemas::{new_id, Group, Member, Role, User, UserId};
use crate::store::Store;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroup {
    pub name: String,
    pub owner_id: UserId,
}

#[derive(Debug, Deserialize)]
pub struct AddMember {
    pub username: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupsQuery {
    pub member_id: UserId,
}

pub fn validate_group_name(name: &str) -> Result<String, ApiError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ApiError::validation("Group name must not be empty"));
    }
    Ok(trimmed.to_owned())
}

/// A fresh group always has its owner as the sole initial member, so the
/// at-least-one-member invariant holds from the first write on.
pub fn new_group(name: String, owner_id: UserId, now: DateTime) -> Group {
    Group {
        id: new_id(),
        name,
        owner_id: owner_id.clone(),
        members: vec![Member {
            user_id: owner_id,
            role: Role::Owner,
            joined_at: now,
        }],
        created_at: now,
        updated_at: now,
    }
}

pub fn is_member(group: &Group, user_id: &str) -> bool {
    group.members.iter().any(|m| m.user_id == user_id)
}

/// Appends a member unless already present. Returns whether the list
/// changed; membership stays duplicate-free either way.
pub fn apply_add_member(group: &mut Group, user_id: &str, now: DateTime) -> bool {
    if is_member(group, user_id) {
        return false;
    }
    group.members.push(Member {
        user_id: user_id.to_owned(),
        role: Role::Member,
        joined_at: now,
    });
    group.updated_at = now;
    true
}

async fn find_user_by_id(store: &Store, user_id: &str) -> Result<Option<User>, ApiError> {
    store
        .run(store.users().find_one(doc! { "id": user_id }, None))
        .await
}

pub async fn require_group(store: &Store, group_id: &str) -> Result<Group, ApiError> {
    store
        .run(store.groups().find_one(doc! { "id": group_id }, None))
        .await?
        .ok_or_else(|| ApiError::not_found("Group not found"))
}

pub async fn groups_for_user(store: &Store, user_id: &str) -> Result<Vec<Group>, ApiError> {
    let options = FindOptions::builder()
        .sort(doc! { "updatedAt": -1 })
        .limit(50)
        .build();
    let cursor = store
        .run(
            store
                .groups()
                .find(doc! { "members.userId": user_id }, options),
        )
        .await?;
    store.run(cursor.try_collect()).await
}

#[post("/groups")]
pub async fn create_group(
    store: web::Data<Store>,
    payload: web::Json<CreateGroup>,
) -> Result<HttpResponse, ApiError> {
    let name = validate_group_name(&payload.name)?;
    let owner = find_user_by_id(&store, &payload.owner_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Owner user not found"))?;

    let group = new_group(name, owner.id, DateTime::now());
    store.run(store.groups().insert_one(&group, None)).await?;
    tracing::info!(group = %group.id, owner = %group.owner_id, "created group");
    Ok(HttpResponse::Ok().json(group))
}

#[get("/groups")]
pub async fn list_groups(
    store: web::Data<Store>,
    query: web::Query<GroupsQuery>,
) -> Result<HttpResponse, ApiError> {
    let groups = groups_for_user(&store, &query.member_id).await?;
    Ok(HttpResponse::Ok().json(groups))
}

#[get("/groups/{group_id}")]
pub async fn get_group(
    store: web::Data<Store>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let group = require_group(&store, &path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(group))
}

/// Resolves the username through the identity lookup path (never creating)
/// and appends the user as a member. Re-adding an existing member is a
/// silent no-op returning the unchanged group.
#[post("/groups/{group_id}/members")]
pub async fn add_member(
    store: web::Data<Store>,
    path: web::Path<String>,
    payload: web::Json<AddMember>,
) -> Result<HttpResponse, ApiError> {
    let group_id = path.into_inner();
    let user = identity::find_by_username(&store, &payload.username)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    let mut group = require_group(&store, &group_id).await?;

    let now = DateTime::now();
    if !apply_add_member(&mut group, &user.id, now) {
        return Ok(HttpResponse::Ok().json(group));
    }
    let member = group
        .members
        .last()
        .cloned()
        .expect("member was just appended");

    // The filter re-checks absence so a concurrent add of the same user
    // cannot produce a duplicate entry.
    store
        .run(store.groups().update_one(
            doc! { "id": &group_id, "members.userId": { "$ne": &user.id } },
            doc! {
                "$push": { "members": bson::to_bson(&member)? },
                "$set": { "updatedAt": now },
            },
            None,
        ))
        .await?;

    let group = require_group(&store, &group_id).await?;
    Ok(HttpResponse::Ok().json(group))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_names_must_not_be_blank() {
        assert!(validate_group_name("   ").is_err());
        assert_eq!(validate_group_name("  Groceries ").unwrap(), "Groceries");
    }

    #[test]
    fn new_group_starts_with_owner_as_sole_member() {
        let group = new_group("Roommates".into(), "owner-1".into(), DateTime::now());
        assert_eq!(group.members.len(), 1);
        assert_eq!(group.members[0].user_id, "owner-1");
        assert_eq!(group.members[0].role, Role::Owner);
        assert!(is_member(&group, "owner-1"));
    }

    #[test]
    fn adding_a_member_appends_with_member_role() {
        let mut group = new_group("Roommates".into(), "owner-1".into(), DateTime::now());
        let added = apply_add_member(&mut group, "user-2", DateTime::now());
        assert!(added);
        assert_eq!(group.members.len(), 2);
        assert_eq!(group.members[1].role, Role::Member);
    }

    #[test]
    fn re_adding_a_member_is_a_no_op() {
        let mut group = new_group("Roommates".into(), "owner-1".into(), DateTime::now());
        apply_add_member(&mut group, "user-2", DateTime::now());
        let added_again = apply_add_member(&mut group, "user-2", DateTime::now());
        assert!(!added_again);
        assert!(!apply_add_member(&mut group, "owner-1", DateTime::now()));

        let mut seen: Vec<&str> = group.members.iter().map(|m| m.user_id.as_str()).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), group.members.len());
    }
}
