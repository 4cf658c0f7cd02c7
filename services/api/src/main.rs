//! API Service - Read-only views over the loaded game market store
//!
//! Endpoints:
//! - GET /health - Health check
//! - GET /games - Search/list games
//! - GET /flat - Flattened export (games x sales, population and cluster joins)
//! - GET /kpis - Region totals and top genres
//! - GET /sales-by-year - Regional totals per release year
//! - GET /sales-by-genre - Regional totals per genre
//!
//! Reads happen only after a load completes; this service never writes.

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

// ============================================================================
// State
// ============================================================================

#[derive(Clone)]
struct AppState {
    pool: SqlitePool,
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

#[derive(Serialize, sqlx::FromRow)]
struct GameResponse {
    id: i64,
    name: String,
    platform: String,
    year: i64,
    genre: String,
    publisher: Option<String>,
    critic_score: Option<f64>,
    user_score: Option<f64>,
    rating: Option<String>,
}

/// One row of the flattened export: sales joined to its game, with the
/// contemporaneous region population and the cluster label when present.
#[derive(Serialize, sqlx::FromRow)]
struct FlatRow {
    game_id: i64,
    name: String,
    platform: String,
    year: i64,
    genre: String,
    publisher: Option<String>,
    rating: Option<String>,
    critic_score: Option<f64>,
    user_score: Option<f64>,
    na_sales: f64,
    eu_sales: f64,
    jp_sales: f64,
    other_sales: f64,
    global_sales: f64,
    na_population: Option<f64>,
    eu_population: Option<f64>,
    jp_population: Option<f64>,
    other_population: Option<f64>,
    cluster_id: Option<i64>,
}

#[derive(Serialize, sqlx::FromRow)]
struct YearSales {
    year: i64,
    na_sales: f64,
    eu_sales: f64,
    jp_sales: f64,
    other_sales: f64,
    global_sales: f64,
}

#[derive(Serialize, sqlx::FromRow)]
struct GenreSales {
    genre: String,
    na_sales: f64,
    eu_sales: f64,
    jp_sales: f64,
    other_sales: f64,
    global_sales: f64,
}

#[derive(Serialize)]
struct RegionTotals {
    na_sales: f64,
    eu_sales: f64,
    jp_sales: f64,
    other_sales: f64,
}

#[derive(Serialize)]
struct KpiResponse {
    totals: RegionTotals,
    top_genres: Vec<GenreSales>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Query params
// ============================================================================

#[derive(Deserialize)]
struct GamesQuery {
    query: Option<String>,
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct FlatQuery {
    limit: Option<i64>,
}

fn internal_error(e: sqlx::Error) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
        .into_response()
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: "0.1.0",
    })
}

async fn games_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<GamesQuery>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(100).min(1000);

    let games: Result<Vec<GameResponse>, _> = if let Some(q) = params.query {
        let pattern = format!("%{}%", q.to_lowercase());
        sqlx::query_as(
            r#"
            SELECT id, name, platform, year, genre, publisher, critic_score, user_score, rating
            FROM games
            WHERE lower(name) LIKE ? OR lower(platform) LIKE ?
            ORDER BY name
            LIMIT ?
            "#,
        )
        .bind(&pattern)
        .bind(&pattern)
        .bind(limit)
        .fetch_all(&state.pool)
        .await
    } else {
        sqlx::query_as(
            "SELECT id, name, platform, year, genre, publisher, critic_score, user_score, rating \
             FROM games ORDER BY name LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&state.pool)
        .await
    };

    match games {
        Ok(g) => Json(serde_json::json!({ "games": g })).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn flat_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FlatQuery>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(10_000).min(100_000);

    let rows: Result<Vec<FlatRow>, _> = sqlx::query_as(
        r#"
        SELECT
            g.id AS game_id,
            g.name,
            g.platform,
            g.year,
            g.genre,
            g.publisher,
            g.rating,
            g.critic_score,
            g.user_score,
            s.na_sales,
            s.eu_sales,
            s.jp_sales,
            s.other_sales,
            s.global_sales,
            rp.na_population,
            rp.eu_population,
            rp.jp_population,
            rp.other_population,
            c.cluster_id
        FROM games g
        JOIN sales s ON s.game_id = g.id
        LEFT JOIN region_population rp ON rp.year = g.year
        LEFT JOIN clusters c ON c.game_id = g.id
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(&state.pool)
    .await;

    match rows {
        Ok(r) => Json(serde_json::json!({ "rows": r })).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn sales_by_year_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let rows: Result<Vec<YearSales>, _> = sqlx::query_as(
        r#"
        SELECT
            g.year,
            SUM(s.na_sales) AS na_sales,
            SUM(s.eu_sales) AS eu_sales,
            SUM(s.jp_sales) AS jp_sales,
            SUM(s.other_sales) AS other_sales,
            SUM(s.global_sales) AS global_sales
        FROM sales s
        JOIN games g ON g.id = s.game_id
        GROUP BY g.year
        ORDER BY g.year
        "#,
    )
    .fetch_all(&state.pool)
    .await;

    match rows {
        Ok(r) => Json(serde_json::json!({ "years": r })).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn sales_by_genre_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let rows: Result<Vec<GenreSales>, _> = sqlx::query_as(
        r#"
        SELECT
            g.genre,
            SUM(s.na_sales) AS na_sales,
            SUM(s.eu_sales) AS eu_sales,
            SUM(s.jp_sales) AS jp_sales,
            SUM(s.other_sales) AS other_sales,
            SUM(s.global_sales) AS global_sales
        FROM sales s
        JOIN games g ON g.id = s.game_id
        GROUP BY g.genre
        ORDER BY global_sales DESC
        "#,
    )
    .fetch_all(&state.pool)
    .await;

    match rows {
        Ok(r) => Json(serde_json::json!({ "genres": r })).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn kpis_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let totals: Result<(Option<f64>, Option<f64>, Option<f64>, Option<f64>), _> = sqlx::query_as(
        "SELECT SUM(na_sales), SUM(eu_sales), SUM(jp_sales), SUM(other_sales) FROM sales",
    )
    .fetch_one(&state.pool)
    .await;

    let totals = match totals {
        Ok((na, eu, jp, other)) => RegionTotals {
            na_sales: na.unwrap_or(0.0),
            eu_sales: eu.unwrap_or(0.0),
            jp_sales: jp.unwrap_or(0.0),
            other_sales: other.unwrap_or(0.0),
        },
        Err(e) => return internal_error(e),
    };

    let top_genres: Result<Vec<GenreSales>, _> = sqlx::query_as(
        r#"
        SELECT
            g.genre,
            SUM(s.na_sales) AS na_sales,
            SUM(s.eu_sales) AS eu_sales,
            SUM(s.jp_sales) AS jp_sales,
            SUM(s.other_sales) AS other_sales,
            SUM(s.global_sales) AS global_sales
        FROM sales s
        JOIN games g ON g.id = s.game_id
        GROUP BY g.genre
        ORDER BY global_sales DESC
        LIMIT 10
        "#,
    )
    .fetch_all(&state.pool)
    .await;

    match top_genres {
        Ok(top_genres) => Json(KpiResponse { totals, top_genres }).into_response(),
        Err(e) => internal_error(e),
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let db_url = std::env::var("DB_URL")
        .unwrap_or_else(|_| "sqlite://data/games.db?mode=ro".to_string());
    let bind = std::env::var("API_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    println!("=== Game Market API ===");
    println!("Connecting to database...");

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;

    println!("Database connected");

    let state = Arc::new(AppState { pool });

    // CORS for analytics frontends.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/games", get(games_handler))
        .route("/flat", get(flat_handler))
        .route("/kpis", get(kpis_handler))
        .route("/sales-by-year", get(sales_by_year_handler))
        .route("/sales-by-genre", get(sales_by_genre_handler))
        .layer(cors)
        .with_state(state);

    println!("API listening on http://{}", bind);
    println!("\nEndpoints:");
    println!("  GET /health");
    println!("  GET /games?query=&limit=");
    println!("  GET /flat?limit=");
    println!("  GET /kpis");
    println!("  GET /sales-by-year");
    println!("  GET /sales-by-genre");

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
