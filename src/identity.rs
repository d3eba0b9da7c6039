use actix_web::{get, patch, post, web, HttpResponse};
use bson::{doc, DateTime};
use futures::TryStreamExt;
use mongodb::options::{FindOneAndUpdateOptions, FindOptions, ReturnDocument};
use rand::distr::{Alphanumeric, SampleString};
use serde::Deserialize;

use crate::error::ApiError;
use crate::schemas::{new_id, User, UserPublic};
use crate::store::Store;

/// External identity as delivered by the auth layer. The engine never reads
/// ambient auth state; callers pass the resolved identity explicitly.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub auth_id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
}

fn scrub(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect()
}

fn tail(raw: &str, n: usize) -> String {
    let chars: Vec<char> = raw.chars().collect();
    chars[chars.len().saturating_sub(n)..].iter().collect()
}

/// Candidate username for a fresh identity: display name if present, else
/// the email local part, else `user-` plus the end of the external id.
/// Anything outside `[A-Za-z0-9._-]` is stripped; too-short results are
/// rebuilt from the email local part and the external id, and as a last
/// resort from a random suffix. Always 3..=20 characters.
pub fn derive_username(display_name: Option<&str>, email: &str, auth_id: &str) -> String {
    let local = email.split('@').next().unwrap_or("").trim();
    let base = match display_name.map(str::trim).filter(|s| !s.is_empty()) {
        Some(name) => name.to_owned(),
        None if !local.is_empty() => local.to_owned(),
        None => format!("user-{}", tail(auth_id, 6)),
    };

    let mut cleaned = scrub(&base);
    if cleaned.len() < 3 {
        let stem = if local.is_empty() { "user" } else { local };
        cleaned = scrub(&format!("{}-{}", stem, tail(auth_id, 4)));
    }
    if cleaned.len() < 3 {
        let suffix = Alphanumeric.sample_string(&mut rand::rng(), 6).to_lowercase();
        cleaned = format!("user-{}", suffix);
    }
    cleaned.truncate(20);
    cleaned
}

/// Normalized form usernames are looked up by. Two usernames differing
/// only in case resolve to the same user.
pub fn lookup_key(username: &str) -> String {
    username.trim().to_lowercase()
}

/// Normalized search input, or `None` when nothing searchable remains.
/// Only an effectively empty query short-circuits; a single usable
/// character is still a valid prefix.
pub fn search_needle(query: &str) -> Option<String> {
    let needle = scrub(&query.trim().to_lowercase());
    if needle.is_empty() {
        return None;
    }
    Some(needle)
}

pub fn valid_username(username: &str) -> bool {
    (3..=20).contains(&username.len())
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

pub async fn find_by_username(store: &Store, username: &str) -> Result<Option<User>, ApiError> {
    let key = lookup_key(username);
    store
        .run(store.users().find_one(doc! { "usernameLower": key }, None))
        .await
}

pub async fn find_by_email(store: &Store, email: &str) -> Result<Option<User>, ApiError> {
    let key = email.trim().to_lowercase();
    store
        .run(store.users().find_one(doc! { "email": key }, None))
        .await
}

pub async fn find_by_auth_id(store: &Store, auth_id: &str) -> Result<Option<User>, ApiError> {
    store
        .run(store.users().find_one(doc! { "authId": auth_id }, None))
        .await
}

pub async fn require_by_auth_id(store: &Store, auth_id: &str) -> Result<User, ApiError> {
    find_by_auth_id(store, auth_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("User {} not found", auth_id)))
}

/// Read-or-create resolution of an external identity. Safe to call
/// repeatedly for the same identity: lookups go by derived username, then
/// email, and a create that loses the uniqueness race falls back to the
/// email lookup instead of surfacing the conflict.
pub async fn resolve_or_create(store: &Store, identity: &Identity) -> Result<User, ApiError> {
    let email = identity.email.trim().to_lowercase();
    if email.is_empty() {
        return Err(ApiError::validation("Email is required"));
    }

    let desired = derive_username(identity.display_name.as_deref(), &email, &identity.auth_id);
    if let Some(user) = find_by_username(store, &desired).await? {
        return Ok(user);
    }
    if let Some(user) = find_by_email(store, &email).await? {
        return Ok(user);
    }

    let now = DateTime::now();
    let display_name = identity
        .display_name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(&desired)
        .to_owned();
    let user = User {
        id: new_id(),
        auth_id: identity.auth_id.clone(),
        username: desired.clone(),
        username_lower: lookup_key(&desired),
        display_name,
        email: email.clone(),
        photo_url: identity.photo_url.clone(),
        created_at: now,
        updated_at: now,
    };

    match store.run(store.users().insert_one(&user, None)).await {
        Ok(_) => {
            tracing::info!(username = %user.username, "created user");
            Ok(user)
        }
        Err(err) if err.is_duplicate_key() => find_by_email(store, &email)
            .await?
            .ok_or_else(|| ApiError::conflict("Username or email already in use")),
        Err(err) => Err(err),
    }
}

#[post("/users/sync")]
pub async fn sync_user(
    store: web::Data<Store>,
    payload: web::Json<Identity>,
) -> Result<HttpResponse, ApiError> {
    let user = resolve_or_create(&store, &payload).await?;
    Ok(HttpResponse::Ok().json(user))
}

/// Case-insensitive prefix search over usernames. An empty (or
/// whitespace-only) query returns an empty list without touching the
/// store.
#[get("/users/search")]
pub async fn search_users(
    store: web::Data<Store>,
    query: web::Query<SearchQuery>,
) -> Result<HttpResponse, ApiError> {
    let Some(needle) = search_needle(&query.q) else {
        return Ok(HttpResponse::Ok().json(Vec::<UserPublic>::new()));
    };

    let pattern = format!("^{}", needle.replace('.', "\\."));
    let options = FindOptions::builder()
        .sort(doc! { "usernameLower": 1 })
        .limit(10)
        .build();
    let cursor = store
        .run(
            store
                .users()
                .find(doc! { "usernameLower": { "$regex": pattern } }, options),
        )
        .await?;
    let users: Vec<User> = store.run(cursor.try_collect()).await?;
    let results: Vec<UserPublic> = users.iter().map(UserPublic::from).collect();
    Ok(HttpResponse::Ok().json(results))
}

#[get("/users/by-username/{username}")]
pub async fn get_user_by_username(
    store: web::Data<Store>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let user = find_by_username(&store, &path.into_inner())
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    Ok(HttpResponse::Ok().json(user))
}

#[get("/users/by-email/{email}")]
pub async fn get_user_by_email(
    store: web::Data<Store>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let user = find_by_email(&store, &path.into_inner())
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    Ok(HttpResponse::Ok().json(user))
}

#[get("/users/{auth_id}")]
pub async fn get_user(
    store: web::Data<Store>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let user = require_by_auth_id(&store, &path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(user))
}

#[patch("/users/{auth_id}")]
pub async fn update_user(
    store: web::Data<Store>,
    path: web::Path<String>,
    payload: web::Json<ProfileUpdate>,
) -> Result<HttpResponse, ApiError> {
    let auth_id = path.into_inner();
    if payload.username.is_none() && payload.display_name.is_none() && payload.photo_url.is_none() {
        return Err(ApiError::validation("No updates provided"));
    }

    let mut updates = doc! { "updatedAt": DateTime::now() };
    if let Some(username) = payload.username.as_deref() {
        let username = username.trim();
        if !valid_username(username) {
            return Err(ApiError::validation(
                "Username must be 3-20 characters from A-Za-z0-9._-",
            ));
        }
        let taken = store
            .run(store.users().find_one(
                doc! { "usernameLower": lookup_key(username), "authId": { "$ne": &auth_id } },
                None,
            ))
            .await?;
        if taken.is_some() {
            return Err(ApiError::conflict("Username already taken"));
        }
        updates.insert("username", username);
        updates.insert("usernameLower", lookup_key(username));
    }
    if let Some(display_name) = payload.display_name.as_deref() {
        updates.insert("displayName", display_name.trim());
    }
    if let Some(photo_url) = payload.photo_url.as_deref() {
        updates.insert("photoUrl", photo_url);
    }

    let options = FindOneAndUpdateOptions::builder()
        .return_document(ReturnDocument::After)
        .build();
    // The availability check above can lose a race to the unique index.
    let updated = store
        .run(store.users().find_one_and_update(
            doc! { "authId": &auth_id },
            doc! { "$set": updates },
            options,
        ))
        .await
        .map_err(|err| err.conflict_on_duplicate("Username already taken"))?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    Ok(HttpResponse::Ok().json(updated))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_from_display_name_stripping_forbidden_characters() {
        let username = derive_username(Some("Bob!!123"), "bob@example.com", "xyzabcdef");
        assert_eq!(username, "Bob123");
        assert!(valid_username(&username));
    }

    #[test]
    fn falls_back_to_email_local_part() {
        let username = derive_username(None, "charlie.day@example.com", "uid123");
        assert_eq!(username, "charlie.day");
    }

    #[test]
    fn rebuilds_short_names_from_email_and_external_id() {
        let username = derive_username(Some("!!"), "ab@example.com", "xyzabcdef");
        assert_eq!(username, "ab-cdef");
    }

    #[test]
    fn uses_external_id_when_email_has_no_local_part() {
        let username = derive_username(None, "", "xyzabcdef");
        assert_eq!(username, "user-abcdef");
    }

    #[test]
    fn random_suffix_when_nothing_usable_remains() {
        let username = derive_username(None, "é@example.com", "");
        assert!(username.starts_with("user-"));
        assert_eq!(username.len(), 11);
        assert!(valid_username(&username));
    }

    #[test]
    fn truncates_to_twenty_characters() {
        let long = "a-very-long-display-name-that-keeps-going";
        let username = derive_username(Some(long), "x@example.com", "uid");
        assert_eq!(username.len(), 20);
        assert!(valid_username(&username));
    }

    #[test]
    fn lookup_key_is_case_insensitive() {
        assert_eq!(lookup_key("Alice"), lookup_key("ALICE"));
        assert_eq!(lookup_key("  Bob "), "bob");
    }

    #[test]
    fn single_character_queries_are_searchable() {
        assert_eq!(search_needle("a"), Some("a".into()));
        assert_eq!(search_needle("  A "), Some("a".into()));
    }

    #[test]
    fn empty_and_unusable_queries_yield_no_needle() {
        assert_eq!(search_needle(""), None);
        assert_eq!(search_needle("   "), None);
        assert_eq!(search_needle("é"), None);
    }

    #[test]
    fn username_validity_bounds() {
        assert!(valid_username("ab.c"));
        assert!(valid_username("A_b-3"));
        assert!(!valid_username("ab"));
        assert!(!valid_username("has space"));
        assert!(!valid_username("way-too-long-for-a-username"));
    }
}
