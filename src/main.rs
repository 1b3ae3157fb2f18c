mod auth;
mod codegen;
mod config;
mod error;
mod invites;
mod models;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use clap::{Parser, Subcommand};
use config::Config;
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Arc<Config>,
}

#[derive(Parser)]
#[command(name = "invitegate", about = "Invite code issuing and redemption service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (the default when no subcommand is given)
    Serve,
    /// Create or update an admin user, prompting for the password
    CreateAdmin { username: String },
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&state.db).await.unwrap();
    Json(serde_json::json!({ "status": "ok", "db": row.0 == 1 }))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Arc::new(Config::from_env());

    let db = PgPool::connect(&config.database_url)
        .await
        .expect("failed to connect to database");

    sqlx::migrate!()
        .run(&db)
        .await
        .expect("failed to run migrations");

    match cli.command {
        Some(Command::CreateAdmin { username }) => create_admin(&db, &username).await,
        Some(Command::Serve) | None => serve(db, config).await,
    }
}

async fn serve(db: PgPool, config: Arc<Config>) {
    let state = AppState {
        db,
        config: config.clone(),
    };

    let mut app = Router::new()
        .route("/api/health", get(health))
        .merge(routes::api_router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if let Some(static_dir) = &config.static_dir {
        let index = format!("{static_dir}/index.html");
        app = app.fallback_service(ServeDir::new(static_dir).fallback(ServeFile::new(index)));
    }

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .unwrap();
}

async fn create_admin(db: &PgPool, username: &str) {
    let username = username.trim().to_lowercase();
    if username.is_empty() {
        eprintln!("Username must not be empty");
        std::process::exit(1);
    }

    let password = rpassword::prompt_password("Password: ").expect("failed to read password");
    if password.len() < 8 {
        eprintln!("Password must be at least 8 characters");
        std::process::exit(1);
    }

    let password_hash = auth::password::hash_password(&password).expect("failed to hash password");

    sqlx::query(
        "INSERT INTO users (username, password_hash, role)
         VALUES ($1, $2, 'admin')
         ON CONFLICT (username)
         DO UPDATE SET password_hash = EXCLUDED.password_hash, role = 'admin', updated_at = now()",
    )
    .bind(&username)
    .bind(&password_hash)
    .execute(db)
    .await
    .expect("failed to create admin user");

    println!("Admin user '{username}' is ready");
}
