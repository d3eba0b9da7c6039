use actix_web::{get, web, HttpResponse};
use bson::doc;
use futures::TryStreamExt;
use mongodb::options::FindOptions;
use serde::Serialize;

use crate::error::ApiError;
use crate::groups;
use crate::identity;
use crate::schemas::{Bet, BetStatus, Group, UserPublic};
use crate::store::Store;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
    pub user: UserPublic,
    pub groups: Vec<Group>,
    pub active_bets: Vec<Bet>,
    pub completed_bets: Vec<Bet>,
}

async fn bets_for_participant(
    store: &Store,
    user_id: &str,
    status: BetStatus,
    sort: bson::Document,
) -> Result<Vec<Bet>, ApiError> {
    let options = FindOptions::builder().sort(sort).build();
    let cursor = store
        .run(store.bets().find(
            doc! { "participants.userId": user_id, "status": status.as_str() },
            options,
        ))
        .await?;
    store.run(cursor.try_collect()).await
}

/// Read-only projection of everything a user sees on their home screen.
/// Performs no writes; every dependent lookup runs under the store's
/// deadline, so a hung dependency fails the whole aggregation instead of
/// returning a stale partial result.
#[get("/dashboard/{auth_id}")]
pub async fn get_dashboard(
    store: web::Data<Store>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let user = identity::require_by_auth_id(&store, &path.into_inner()).await?;
    let groups = groups::groups_for_user(&store, &user.id).await?;
    let active_bets =
        bets_for_participant(&store, &user.id, BetStatus::Active, doc! { "deadline": 1 }).await?;
    let completed_bets = bets_for_participant(
        &store,
        &user.id,
        BetStatus::Completed,
        doc! { "completedAt": -1 },
    )
    .await?;

    Ok(HttpResponse::Ok().json(Dashboard {
        user: UserPublic::from(&user),
        groups,
        active_bets,
        completed_bets,
    }))
}
