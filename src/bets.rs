use actix_web::{get, post, web, HttpResponse};
use bson::{doc, DateTime};
use chrono::NaiveDate;
use futures::TryStreamExt;
use mongodb::options::{FindOneAndUpdateOptions, FindOptions, ReturnDocument, UpdateOptions};
use serde::Deserialize;

use crate::error::ApiError;
use crate::groups;
use crate::schemas::{new_id, round2, Bet, BetStatus, Group, Participant, UserId};
use crate::store::Store;

/// Attempts before a finalize gives up on a bet whose state keeps moving.
const FINALIZE_RETRIES: usize = 3;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBet {
    pub group_id: String,
    pub created_by: UserId,
    pub title: String,
    pub description: Option<String>,
    pub budget_limit: f64,
    pub deadline: NaiveDate,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptBet {
    pub user_id: UserId,
}

pub fn validate_bet_input(title: &str, budget_limit: f64) -> Result<String, ApiError> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(ApiError::validation("Bet title must not be empty"));
    }
    if !budget_limit.is_finite() || budget_limit <= 0.0 {
        return Err(ApiError::validation("Budget limit must be positive"));
    }
    Ok(trimmed.to_owned())
}

/// Participants are frozen from the group's membership at creation time:
/// every current member appears exactly once, unaccepted and with zero
/// spending. Later membership changes do not touch existing bets.
pub fn seed_participants(group: &Group) -> Vec<Participant> {
    group
        .members
        .iter()
        .map(|member| Participant {
            user_id: member.user_id.clone(),
            accepted: false,
            accepted_at: None,
            spending: 0.0,
        })
        .collect()
}

pub fn all_accepted(participants: &[Participant]) -> bool {
    !participants.is_empty() && participants.iter().all(|p| p.accepted)
}

pub fn ensure_open(bet: &Bet) -> Result<(), ApiError> {
    if bet.status.is_terminal() {
        return Err(ApiError::invalid_state(format!(
            "Bet is already {}",
            bet.status.as_str()
        )));
    }
    Ok(())
}

/// In-memory form of the accept transition. Returns whether anything
/// changed; accepting twice is a no-op and keeps the original
/// `accepted_at`. Flips the bet to active once the last participant
/// accepts.
pub fn apply_accept(bet: &mut Bet, user_id: &str, now: DateTime) -> Result<bool, ApiError> {
    ensure_open(bet)?;
    let participant = bet
        .participants
        .iter_mut()
        .find(|p| p.user_id == user_id)
        .ok_or_else(|| ApiError::not_found("Participant not found"))?;

    let mut changed = false;
    if !participant.accepted {
        participant.accepted = true;
        participant.accepted_at = Some(now);
        changed = true;
    }
    if bet.status == BetStatus::Proposed && all_accepted(&bet.participants) {
        bet.status = BetStatus::Active;
        bet.activated_at = Some(now);
        changed = true;
    }
    if changed {
        bet.updated_at = now;
    }
    Ok(changed)
}

/// Winner selection: lowest spending among accepted participants, ties
/// broken by earliest acceptance, then by user id. The order is total, so
/// the result is deterministic for any participant list. Spending is
/// compared at cent precision; the stored total is an atomic `$inc` sum
/// and may carry float dust below a cent. A bet nobody accepted has no
/// winner.
pub fn winner_of(participants: &[Participant]) -> Option<UserId> {
    participants
        .iter()
        .filter(|p| p.accepted)
        .min_by(|a, b| {
            round2(a.spending)
                .total_cmp(&round2(b.spending))
                .then_with(|| {
                    let a_at = a.accepted_at.unwrap_or(DateTime::MAX);
                    let b_at = b.accepted_at.unwrap_or(DateTime::MAX);
                    a_at.cmp(&b_at)
                })
                .then_with(|| a.user_id.cmp(&b.user_id))
        })
        .map(|p| p.user_id.clone())
}

/// In-memory form of the terminal transition: status, completion time and
/// winner land together, so a completed bet with accepted participants is
/// never observable without its winner.
pub fn apply_finalize(bet: &mut Bet, now: DateTime) -> Result<(), ApiError> {
    ensure_open(bet)?;
    bet.winner_id = winner_of(&bet.participants);
    bet.status = BetStatus::Completed;
    bet.completed_at = Some(now);
    bet.updated_at = now;
    Ok(())
}

pub async fn require_bet(store: &Store, bet_id: &str) -> Result<Bet, ApiError> {
    store
        .run(store.bets().find_one(doc! { "id": bet_id }, None))
        .await?
        .ok_or_else(|| ApiError::not_found("Bet not found"))
}

pub(crate) fn open_statuses() -> bson::Bson {
    let open = vec![BetStatus::Proposed.as_str(), BetStatus::Active.as_str()];
    bson::bson!({ "$in": open })
}

#[post("/bets")]
pub async fn create_bet(
    store: web::Data<Store>,
    payload: web::Json<CreateBet>,
) -> Result<HttpResponse, ApiError> {
    let title = validate_bet_input(&payload.title, payload.budget_limit)?;
    let group = groups::require_group(&store, &payload.group_id).await?;
    if !groups::is_member(&group, &payload.created_by) {
        return Err(ApiError::validation("Creator must be a group member"));
    }

    let now = DateTime::now();
    let bet = Bet {
        id: new_id(),
        group_id: group.id.clone(),
        created_by: payload.created_by.clone(),
        title,
        description: payload.description.clone(),
        budget_limit: payload.budget_limit,
        deadline: payload.deadline,
        status: BetStatus::Proposed,
        participants: seed_participants(&group),
        transactions: Vec::new(),
        winner_id: None,
        created_at: now,
        updated_at: now,
        activated_at: None,
        completed_at: None,
    };
    store.run(store.bets().insert_one(&bet, None)).await?;
    tracing::info!(bet = %bet.id, group = %bet.group_id, "created bet");
    Ok(HttpResponse::Ok().json(bet))
}

#[get("/bets/{bet_id}")]
pub async fn get_bet(
    store: web::Data<Store>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let bet = require_bet(&store, &path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(bet))
}

#[get("/groups/{group_id}/bets")]
pub async fn list_group_bets(
    store: web::Data<Store>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let options = FindOptions::builder()
        .sort(doc! { "createdAt": -1 })
        .limit(100)
        .build();
    let cursor = store
        .run(
            store
                .bets()
                .find(doc! { "groupId": path.into_inner() }, options),
        )
        .await?;
    let bets: Vec<Bet> = store.run(cursor.try_collect()).await?;
    Ok(HttpResponse::Ok().json(bets))
}

#[post("/bets/{bet_id}/accept")]
pub async fn accept_bet(
    store: web::Data<Store>,
    path: web::Path<String>,
    payload: web::Json<AcceptBet>,
) -> Result<HttpResponse, ApiError> {
    let bet_id = path.into_inner();
    let now = DateTime::now();

    // Validate against the current state before touching the store; the
    // guarded writes below re-check everything that can race.
    let mut preview = require_bet(&store, &bet_id).await?;
    apply_accept(&mut preview, &payload.user_id, now)?;

    let options = UpdateOptions::builder()
        .array_filters(vec![
            doc! { "p.userId": &payload.user_id, "p.accepted": false },
        ])
        .build();
    let result = store
        .run(store.bets().update_one(
            doc! { "id": &bet_id, "status": open_statuses() },
            doc! { "$set": {
                "participants.$[p].accepted": true,
                "participants.$[p].acceptedAt": now,
                "updatedAt": now,
            }},
            options,
        ))
        .await?;
    if result.matched_count == 0 {
        // The bet reached a terminal state between the read and the write.
        let current = require_bet(&store, &bet_id).await?;
        ensure_open(&current)?;
    }

    // Activation is decided by the store, not by the snapshot: the filter
    // only matches a proposed bet with no unaccepted participant left, so
    // two concurrent accepts cannot double-activate.
    let activated = store
        .run(store.bets().update_one(
            doc! {
                "id": &bet_id,
                "status": BetStatus::Proposed.as_str(),
                "participants": { "$not": { "$elemMatch": { "accepted": false } } },
            },
            doc! { "$set": {
                "status": BetStatus::Active.as_str(),
                "activatedAt": now,
                "updatedAt": now,
            }},
            None,
        ))
        .await?;
    if activated.modified_count > 0 {
        tracing::info!(bet = %bet_id, "all participants accepted, bet active");
    }

    let bet = require_bet(&store, &bet_id).await?;
    Ok(HttpResponse::Ok().json(bet))
}

#[post("/bets/{bet_id}/finalize")]
pub async fn finalize_bet(
    store: web::Data<Store>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let bet_id = path.into_inner();

    // The winner is computed from a snapshot and written by the same
    // guarded update that flips the status, so readers never see a
    // completed bet whose winner is still pending. The `updatedAt` token
    // in the filter catches any accept or posting that landed after the
    // snapshot; a guard miss re-reads and tries again.
    for _ in 0..FINALIZE_RETRIES {
        let snapshot = require_bet(&store, &bet_id).await?;
        let now = DateTime::now();
        let mut finalized = snapshot.clone();
        apply_finalize(&mut finalized, now)?;

        let mut set = doc! {
            "status": BetStatus::Completed.as_str(),
            "completedAt": now,
            "updatedAt": now,
        };
        if let Some(winner_id) = &finalized.winner_id {
            set.insert("winnerId", winner_id);
        }
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        let updated = store
            .run(store.bets().find_one_and_update(
                doc! {
                    "id": &bet_id,
                    "status": open_statuses(),
                    "updatedAt": snapshot.updated_at,
                },
                doc! { "$set": set },
                options,
            ))
            .await?;
        if let Some(bet) = updated {
            match &bet.winner_id {
                Some(winner_id) => {
                    tracing::info!(bet = %bet_id, winner = %winner_id, "bet finalized")
                }
                None => {
                    tracing::info!(bet = %bet_id, "bet finalized with no accepted participants")
                }
            }
            return Ok(HttpResponse::Ok().json(bet));
        }
        // State moved underneath the snapshot; the re-read surfaces
        // InvalidStateError if a competing finalize or cancel won.
    }
    Err(ApiError::invalid_state("Bet changed while finalizing, retry"))
}

#[post("/bets/{bet_id}/cancel")]
pub async fn cancel_bet(
    store: web::Data<Store>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let bet_id = path.into_inner();
    let now = DateTime::now();

    let result = store
        .run(store.bets().update_one(
            doc! { "id": &bet_id, "status": open_statuses() },
            doc! { "$set": {
                "status": BetStatus::Cancelled.as_str(),
                "updatedAt": now,
            }},
            None,
        ))
        .await?;
    if result.matched_count == 0 {
        let current = require_bet(&store, &bet_id).await?;
        return Err(ApiError::invalid_state(format!(
            "Bet is already {}",
            current.status.as_str()
        )));
    }

    let bet = require_bet(&store, &bet_id).await?;
    Ok(HttpResponse::Ok().json(bet))
}
