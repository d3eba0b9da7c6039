use std::time::Duration;

use actix_cors::Cors;
use actix_web::{get, web, App, HttpResponse, HttpServer};
use mongodb::Client;
use serde_json::json;
use tracing_subscriber::EnvFilter;

mod bets;
mod dashboard;
mod error;
mod groups;
mod identity;
mod ledger;
mod schemas;
mod store;

use store::Store;

#[get("/health")]
async fn health(store: web::Data<Store>) -> HttpResponse {
    match store.ping().await {
        Ok(()) => {
            HttpResponse::Ok().json(json!({ "status": "healthy", "database": "connected" }))
        }
        Err(_) => {
            HttpResponse::Ok().json(json!({ "status": "unhealthy", "database": "disconnected" }))
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_owned())
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let uri = env_or("MONGODB_URI", "mongodb://localhost:27017");
    let db_name = env_or("MONGODB_DB", "budgetbet");
    let bind_addr = env_or("BIND_ADDR", "0.0.0.0:8000");
    let timeout_ms: u64 = env_or("DB_TIMEOUT_MS", "5000").parse().unwrap_or(5000);

    let client = Client::with_uri_str(&uri)
        .await
        .expect("failed to connect to MongoDB");
    let store = Store::new(&client, &db_name, Duration::from_millis(timeout_ms));
    if let Err(err) = store.ensure_indexes().await {
        tracing::warn!(error = %err, "could not create indexes");
    }
    tracing::info!(%bind_addr, db = %db_name, "starting server");

    HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .app_data(web::Data::new(store.clone()))
            .service(health)
            .service(identity::sync_user)
            // Registered before the `/users/{auth_id}` routes so "search"
            // is never captured as an auth id.
            .service(identity::search_users)
            .service(identity::get_user_by_username)
            .service(identity::get_user_by_email)
            .service(identity::get_user)
            .service(identity::update_user)
            .service(groups::create_group)
            .service(groups::list_groups)
            .service(groups::get_group)
            .service(groups::add_member)
            .service(bets::create_bet)
            .service(bets::get_bet)
            .service(bets::list_group_bets)
            .service(bets::accept_bet)
            .service(bets::finalize_bet)
            .service(bets::cancel_bet)
            .service(ledger::add_transaction)
            .service(ledger::list_user_transactions)
            .service(dashboard::get_dashboard)
    })
    .bind(bind_addr)?
    .run()
    .await
}
