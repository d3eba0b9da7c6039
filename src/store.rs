use std::future::Future;
use std::time::Duration;

use bson::doc;
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, Database, IndexModel};

use crate::error::ApiError;
use crate::schemas::{Bet, Group, User};

/// Typed access to the canonical collections. Every call goes through
/// [`Store::run`], which applies the configured per-operation deadline so
/// no handler can hang on the database.
#[derive(Clone)]
pub struct Store {
    db: Database,
    timeout: Duration,
}

impl Store {
    pub fn new(client: &Client, db_name: &str, timeout: Duration) -> Self {
        Store {
            db: client.database(db_name),
            timeout,
        }
    }

    pub fn users(&self) -> Collection<User> {
        self.db.collection("users")
    }

    pub fn groups(&self) -> Collection<Group> {
        self.db.collection("groups")
    }

    pub fn bets(&self) -> Collection<Bet> {
        self.db.collection("bets")
    }

    /// Runs one driver call under the store's deadline. Elapsed deadline
    /// maps to `TimeoutError`; driver failures pass through as database
    /// errors (duplicate keys are picked apart by the caller).
    pub async fn run<T, F>(&self, operation: F) -> Result<T, ApiError>
    where
        F: Future<Output = Result<T, mongodb::error::Error>>,
    {
        match tokio::time::timeout(self.timeout, operation).await {
            Ok(result) => result.map_err(ApiError::from),
            Err(_) => Err(ApiError::Timeout),
        }
    }

    pub async fn ping(&self) -> Result<(), ApiError> {
        self.run(async {
            self.db.run_command(doc! { "ping": 1 }, None).await?;
            Ok(())
        })
        .await
    }

    /// Uniqueness of usernames and emails is enforced here, not in
    /// application code; the identity sync relies on the duplicate-key
    /// error these indexes produce.
    pub async fn ensure_indexes(&self) -> Result<(), ApiError> {
        let unique = |keys| {
            IndexModel::builder()
                .keys(keys)
                .options(IndexOptions::builder().unique(true).build())
                .build()
        };
        let plain = |keys| IndexModel::builder().keys(keys).build();

        let users = self.users();
        self.run(users.create_index(unique(doc! { "usernameLower": 1 }), None))
            .await?;
        self.run(users.create_index(unique(doc! { "email": 1 }), None))
            .await?;
        self.run(users.create_index(plain(doc! { "authId": 1 }), None))
            .await?;

        let groups = self.groups();
        self.run(groups.create_index(plain(doc! { "members.userId": 1 }), None))
            .await?;
        self.run(groups.create_index(plain(doc! { "id": 1 }), None))
            .await?;

        let bets = self.bets();
        self.run(bets.create_index(plain(doc! { "groupId": 1, "status": 1 }), None))
            .await?;
        self.run(bets.create_index(plain(doc! { "participants.userId": 1 }), None))
            .await?;
        self.run(bets.create_index(plain(doc! { "id": 1 }), None))
            .await?;

        Ok(())
    }
}
