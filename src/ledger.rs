use actix_web::{get, post, web, HttpResponse};
use bson::{doc, DateTime};
use chrono::NaiveDate;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};

use crate::bets::{ensure_open, open_statuses, require_bet};
use crate::error::ApiError;
use crate::identity;
use crate::schemas::{new_id, round2, Bet, Transaction, UserId};
use crate::store::Store;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostTransaction {
    pub user_id: UserId,
    pub amount: f64,
    pub merchant: String,
    pub category: Option<String>,
    pub occurred_on: NaiveDate,
}

/// One ledger entry in the per-user spending feed, carrying the owning
/// bet's identity alongside the embedded transaction.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedEntry {
    pub bet_id: String,
    pub bet_title: String,
    #[serde(flatten)]
    pub transaction: Transaction,
}

pub fn validate_transaction(amount: f64, merchant: &str) -> Result<String, ApiError> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(ApiError::validation("Amount must be positive"));
    }
    let trimmed = merchant.trim();
    if trimmed.is_empty() {
        return Err(ApiError::validation("Merchant must not be empty"));
    }
    Ok(trimmed.to_owned())
}

/// In-memory form of the ledger post: the append and the spending
/// increment happen together or not at all. Only accepted participants
/// may log spending. The stored total is the raw sum of cent-rounded
/// amounts, matching the atomic `$inc`; rounding happens where totals are
/// compared, not here.
pub fn apply_transaction(bet: &mut Bet, transaction: Transaction) -> Result<(), ApiError> {
    ensure_open(bet)?;
    let participant = bet
        .participants
        .iter_mut()
        .find(|p| p.user_id == transaction.user_id)
        .ok_or_else(|| ApiError::not_found("Participant not part of this bet"))?;
    if !participant.accepted {
        return Err(ApiError::not_found(
            "Participant has not accepted this bet",
        ));
    }

    participant.spending += transaction.amount;
    bet.updated_at = transaction.created_at;
    bet.transactions.push(transaction);
    Ok(())
}

/// Flattened view of a user's transactions across all bets, newest
/// purchase first.
pub fn feed_for_user(bets: &[Bet], user_id: &str) -> Vec<FeedEntry> {
    let mut entries: Vec<FeedEntry> = bets
        .iter()
        .flat_map(|bet| {
            bet.transactions
                .iter()
                .filter(|t| t.user_id == user_id)
                .map(|t| FeedEntry {
                    bet_id: bet.id.clone(),
                    bet_title: bet.title.clone(),
                    transaction: t.clone(),
                })
        })
        .collect();
    entries.sort_by(|a, b| {
        b.transaction
            .occurred_on
            .cmp(&a.transaction.occurred_on)
            .then_with(|| b.transaction.created_at.cmp(&a.transaction.created_at))
    });
    entries
}

#[post("/bets/{bet_id}/transactions")]
pub async fn add_transaction(
    store: web::Data<Store>,
    path: web::Path<String>,
    payload: web::Json<PostTransaction>,
) -> Result<HttpResponse, ApiError> {
    let bet_id = path.into_inner();
    let merchant = validate_transaction(payload.amount, &payload.merchant)?;
    let now = DateTime::now();
    let transaction = Transaction {
        id: new_id(),
        user_id: payload.user_id.clone(),
        amount: round2(payload.amount),
        merchant,
        category: payload.category.clone(),
        occurred_on: payload.occurred_on,
        created_at: now,
    };

    // Surface eligibility errors from the current state before writing.
    let mut preview = require_bet(&store, &bet_id).await?;
    apply_transaction(&mut preview, transaction.clone())?;

    // Single-document write: the embedded append and the spending $inc
    // land together, and the filter re-checks status and acceptance so the
    // post cannot race a finalize or slip past an unaccepted participant.
    let result = store
        .run(store.bets().update_one(
            doc! {
                "id": &bet_id,
                "status": open_statuses(),
                "participants": {
                    "$elemMatch": { "userId": &payload.user_id, "accepted": true },
                },
            },
            doc! {
                "$push": { "transactions": bson::to_bson(&transaction)? },
                "$inc": { "participants.$.spending": transaction.amount },
                "$set": { "updatedAt": now },
            },
            None,
        ))
        .await?;
    if result.matched_count == 0 {
        let current = require_bet(&store, &bet_id).await?;
        ensure_open(&current)?;
        return Err(ApiError::not_found(
            "Participant has not accepted this bet",
        ));
    }
    tracing::info!(bet = %bet_id, user = %payload.user_id, amount = transaction.amount, "logged transaction");

    let bet = require_bet(&store, &bet_id).await?;
    Ok(HttpResponse::Ok().json(bet))
}

#[get("/transactions/{auth_id}")]
pub async fn list_user_transactions(
    store: web::Data<Store>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let user = identity::require_by_auth_id(&store, &path.into_inner()).await?;
    let cursor = store
        .run(
            store
                .bets()
                .find(doc! { "transactions.userId": &user.id }, None),
        )
        .await?;
    let bets: Vec<Bet> = store.run(cursor.try_collect()).await?;
    Ok(HttpResponse::Ok().json(feed_for_user(&bets, &user.id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bets::{apply_accept, seed_participants};
    use crate::groups::{apply_add_member, new_group};
    use crate::schemas::BetStatus;

    fn at(millis: i64) -> DateTime {
        DateTime::from_millis(millis)
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 9, d).unwrap()
    }

    fn tx(user_id: &str, amount: f64, occurred: u32, created: i64) -> Transaction {
        Transaction {
            id: new_id(),
            user_id: user_id.into(),
            amount,
            merchant: "Corner Deli".into(),
            category: Some("food".into()),
            occurred_on: day(occurred),
            created_at: at(created),
        }
    }

    fn accepted_two_person_bet() -> Bet {
        let mut group = new_group("Roommates".into(), "a".into(), at(0));
        apply_add_member(&mut group, "b", at(1));
        let mut bet = Bet {
            id: "bet-1".into(),
            group_id: group.id.clone(),
            created_by: "a".into(),
            title: "No takeout September".into(),
            description: None,
            budget_limit: 200.0,
            deadline: day(30),
            status: BetStatus::Proposed,
            participants: seed_participants(&group),
            transactions: Vec::new(),
            winner_id: None,
            created_at: at(0),
            updated_at: at(0),
            activated_at: None,
            completed_at: None,
        };
        apply_accept(&mut bet, "a", at(5)).unwrap();
        bet
    }

    #[test]
    fn rejects_bad_amounts_and_blank_merchants() {
        assert!(validate_transaction(0.0, "Deli").is_err());
        assert!(validate_transaction(-3.0, "Deli").is_err());
        assert!(validate_transaction(f64::INFINITY, "Deli").is_err());
        assert!(validate_transaction(12.5, "  ").is_err());
        assert_eq!(validate_transaction(12.5, " Deli ").unwrap(), "Deli");
    }

    #[test]
    fn rounds_to_cents() {
        assert_eq!(round2(33.333), 33.33);
        assert_eq!(round2(10.0), 10.0);
    }

    #[test]
    fn accumulates_spending_and_keeps_both_records() {
        let mut bet = accepted_two_person_bet();
        apply_transaction(&mut bet, tx("a", 25.0, 3, 100)).unwrap();
        apply_transaction(&mut bet, tx("a", 10.0, 4, 200)).unwrap();

        let p = bet.participants.iter().find(|p| p.user_id == "a").unwrap();
        assert_eq!(p.spending, 35.0);
        assert_eq!(bet.transactions.len(), 2);
        assert_eq!(bet.transactions[0].amount, 25.0);
        assert_eq!(bet.transactions[0].merchant, "Corner Deli");
        assert_eq!(bet.transactions[1].amount, 10.0);
    }

    #[test]
    fn stored_spending_is_the_raw_sum_of_cent_amounts() {
        let mut bet = accepted_two_person_bet();
        apply_transaction(&mut bet, tx("a", 0.1, 3, 100)).unwrap();
        apply_transaction(&mut bet, tx("a", 0.2, 4, 200)).unwrap();

        let p = bet.participants.iter().find(|p| p.user_id == "a").unwrap();
        // The raw sum carries float dust; comparisons round it away.
        assert_eq!(round2(p.spending), 0.3);
    }

    #[test]
    fn rejects_postings_once_the_bet_is_closed() {
        let mut bet = accepted_two_person_bet();
        bet.status = BetStatus::Completed;
        assert!(matches!(
            apply_transaction(&mut bet, tx("a", 5.0, 3, 100)),
            Err(ApiError::InvalidState(_))
        ));
        bet.status = BetStatus::Cancelled;
        assert!(matches!(
            apply_transaction(&mut bet, tx("a", 5.0, 3, 100)),
            Err(ApiError::InvalidState(_))
        ));
    }

    #[test]
    fn rejects_strangers_and_unaccepted_participants() {
        let mut bet = accepted_two_person_bet();
        assert!(matches!(
            apply_transaction(&mut bet, tx("stranger", 5.0, 3, 100)),
            Err(ApiError::NotFound(_))
        ));
        // "b" is a participant but has not accepted yet.
        assert!(matches!(
            apply_transaction(&mut bet, tx("b", 5.0, 3, 100)),
            Err(ApiError::NotFound(_))
        ));
        assert!(bet.transactions.is_empty());
    }

    #[test]
    fn feed_is_newest_first_and_scoped_to_the_user() {
        let mut bet = accepted_two_person_bet();
        apply_accept(&mut bet, "b", at(6)).unwrap();
        apply_transaction(&mut bet, tx("a", 25.0, 3, 100)).unwrap();
        apply_transaction(&mut bet, tx("b", 9.0, 5, 200)).unwrap();
        apply_transaction(&mut bet, tx("a", 10.0, 8, 300)).unwrap();

        let feed = feed_for_user(&[bet], "a");
        assert_eq!(feed.len(), 2);
        assert_eq!(feed[0].transaction.occurred_on, day(8));
        assert_eq!(feed[1].transaction.occurred_on, day(3));
        assert!(feed.iter().all(|e| e.transaction.user_id == "a"));
        assert_eq!(feed[0].bet_title, "No takeout September");
    }
}
