//! Reference key-provisioning CLI — not part of the gateway's runtime path.
//!
//! Grounded on `scripts/create-api-key.py`: generates an opaque `cfx_`-
//! prefixed key, hashes it with the Security module, and inserts the
//! `api_keys` row. Usage: `create-api-key --user-id <uuid>`.

use cfx_router::security;
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let mut args = std::env::args().skip(1);
    let mut user_id: Option<Uuid> = None;
    while let Some(arg) = args.next() {
        if arg == "--user-id" {
            user_id = args.next().and_then(|v| v.parse().ok());
        }
    }
    let user_id = user_id.expect("usage: create-api-key --user-id <uuid>");

    let salt = std::env::var("HASH_SALT").expect("HASH_SALT required");
    let pepper = std::env::var("KEY_HASH_PEPPER").expect("KEY_HASH_PEPPER required");
    security::validate_hash_config(&salt, &pepper).expect("invalid hash configuration");

    let raw_key = format!("cfx_{}", Uuid::new_v4().simple());
    let key_hash = security::hash_api_key(&raw_key, &salt, &pepper);

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
    let pool = sqlx::postgres::PgPool::connect(&database_url).await?;

    let key_id = Uuid::new_v4();
    sqlx::query("INSERT INTO api_keys (id, user_id, key_hash, status) VALUES ($1, $2, $3, 'active')")
        .bind(key_id)
        .bind(user_id)
        .bind(&key_hash)
        .execute(&pool)
        .await?;

    println!("Created API key for user {user_id}: {raw_key}");
    println!("(store this key now — only the hash is kept)");

    Ok(())
}
