//! Loader Service - Loads reconciled tables into the relational store
//!
//! Responsibilities:
//! - Apply the idempotent schema (games, sales, region_population, clusters)
//! - Insert games deduplicated by natural key (name, platform, year)
//! - Resolve sales foreign keys through a read-back of the minted game ids
//! - Insert region population rows keyed by year
//! - Commit the whole batch in one transaction, or none of it
//!
//! The source files carry no game identifier; ids exist only after the store
//! mints them, which is why sales resolution reads the games table back
//! instead of trusting anything in the input.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

const SCHEMA: &str = include_str!("schema.sql");

const COUNTED_TABLES: &[&str] = &["games", "sales", "region_population", "clusters"];

#[derive(Parser, Debug)]
#[command(name = "loader", about = "Loads merged tables into the relational store")]
struct Args {
    /// Dry run - parse and report without touching the store
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Override the data directory (defaults to DATA_DIR or ./data)
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct Config {
    db_url: String,
    data_dir: PathBuf,
}

impl Config {
    fn from_env() -> Self {
        Self {
            db_url: std::env::var("DB_URL")
                .unwrap_or_else(|_| "sqlite://data/games.db?mode=rwc".to_string()),
            data_dir: PathBuf::from(
                std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            ),
        }
    }
}

// =============================================================================
// Input rows
// =============================================================================

/// One row of the merged games/population table.
#[derive(Debug, Clone, Deserialize)]
struct MergedRow {
    name: String,
    platform: String,
    year: i64,
    genre: String,
    publisher: Option<String>,
    na_sales: f64,
    eu_sales: f64,
    jp_sales: f64,
    other_sales: f64,
    global_sales: f64,
    critic_score: Option<f64>,
    user_score: Option<f64>,
    rating: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RegionRow {
    year: i64,
    na_population: f64,
    eu_population: f64,
    jp_population: f64,
    other_population: f64,
}

/// Natural key of a game; the only identity the source data carries.
type GameKey = (String, String, i64);

fn game_key(row: &MergedRow) -> GameKey {
    (row.name.clone(), row.platform.clone(), row.year)
}

fn read_merged(path: &Path) -> Result<Vec<MergedRow>> {
    if !path.exists() {
        anyhow::bail!("Merged data not found: {}", path.display());
    }
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mut rows = Vec::new();
    for result in reader.deserialize() {
        rows.push(result.context("Malformed merged row")?);
    }
    Ok(rows)
}

fn read_regions(path: &Path) -> Result<Vec<RegionRow>> {
    if !path.exists() {
        anyhow::bail!("Region population data not found: {}", path.display());
    }
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mut rows = Vec::new();
    for result in reader.deserialize() {
        rows.push(result.context("Malformed region population row")?);
    }
    Ok(rows)
}

// =============================================================================
// Load path
// =============================================================================

#[derive(Debug, Default)]
struct LoadSummary {
    games_inserted: usize,
    sales_inserted: usize,
    sales_skipped: usize,
    regions_inserted: usize,
}

/// Deduplicate merged rows by natural key, first occurrence wins.
fn dedup_games(rows: &[MergedRow]) -> Vec<&MergedRow> {
    let mut seen: HashSet<GameKey> = HashSet::new();
    let mut games = Vec::new();
    for row in rows {
        if seen.insert(game_key(row)) {
            games.push(row);
        }
    }
    games
}

async fn insert_games(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    games: &[&MergedRow],
) -> Result<()> {
    for game in games {
        sqlx::query(
            r#"
            INSERT INTO games (name, platform, year, genre, publisher, critic_score, user_score, rating)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&game.name)
        .bind(&game.platform)
        .bind(game.year)
        .bind(&game.genre)
        .bind(&game.publisher)
        .bind(game.critic_score)
        .bind(game.user_score)
        .bind(&game.rating)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Read the just-inserted games back to learn the ids the store minted for
/// them. The lookup is keyed by natural key because that is all a sales row
/// knows about its game.
async fn build_game_lookup(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
) -> Result<HashMap<GameKey, i64>> {
    let rows: Vec<(i64, String, String, i64)> =
        sqlx::query_as("SELECT id, name, platform, year FROM games")
            .fetch_all(&mut **tx)
            .await?;
    Ok(rows
        .into_iter()
        .map(|(id, name, platform, year)| ((name, platform, year), id))
        .collect())
}

/// Insert one sales row per merged row. Rows whose natural key resolves to
/// no game are skipped and counted, never fatal.
async fn insert_sales(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    rows: &[MergedRow],
    lookup: &HashMap<GameKey, i64>,
) -> Result<(usize, usize)> {
    let mut inserted = 0usize;
    let mut skipped = 0usize;
    for row in rows {
        let game_id = match lookup.get(&game_key(row)) {
            Some(id) => *id,
            None => {
                skipped += 1;
                continue;
            }
        };
        sqlx::query(
            r#"
            INSERT INTO sales (game_id, na_sales, eu_sales, jp_sales, other_sales, global_sales)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(game_id)
        .bind(row.na_sales)
        .bind(row.eu_sales)
        .bind(row.jp_sales)
        .bind(row.other_sales)
        .bind(row.global_sales)
        .execute(&mut **tx)
        .await?;
        inserted += 1;
    }
    Ok((inserted, skipped))
}

async fn insert_region_population(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    regions: &[RegionRow],
) -> Result<()> {
    for region in regions {
        sqlx::query(
            r#"
            INSERT INTO region_population (year, na_population, eu_population, jp_population, other_population)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(region.year)
        .bind(region.na_population)
        .bind(region.eu_population)
        .bind(region.jp_population)
        .bind(region.other_population)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Load the whole batch inside a single transaction. Any failure rolls the
/// entire batch back; a partial load is never visible.
async fn load(pool: &SqlitePool, merged: &[MergedRow], regions: &[RegionRow]) -> Result<LoadSummary> {
    let mut tx = pool.begin().await.context("Failed to open load transaction")?;

    sqlx::raw_sql(SCHEMA)
        .execute(&mut *tx)
        .await
        .context("Failed to apply schema")?;

    let games = dedup_games(merged);
    insert_games(&mut tx, &games).await?;

    let lookup = build_game_lookup(&mut tx).await?;
    let (sales_inserted, sales_skipped) = insert_sales(&mut tx, merged, &lookup).await?;

    insert_region_population(&mut tx, regions).await?;

    tx.commit().await.context("Failed to commit load transaction")?;

    Ok(LoadSummary {
        games_inserted: games.len(),
        sales_inserted,
        sales_skipped,
        regions_inserted: regions.len(),
    })
}

async fn print_table_counts(pool: &SqlitePool) -> Result<()> {
    for table in COUNTED_TABLES {
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(pool)
            .await?;
        println!("{}: {} rows", table, count);
    }
    Ok(())
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::from_env();
    let data_dir = args.data_dir.unwrap_or(config.data_dir);

    println!("=== Game Market Loader ===");
    println!("Data dir: {}", data_dir.display());
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let merged = read_merged(&data_dir.join("merged_games_population.csv"))?;
    let regions = read_regions(&data_dir.join("region_population_by_year.csv"))?;
    println!("Merged rows: {}", merged.len());
    println!("Region rows: {}", regions.len());

    if args.dry_run {
        let games = dedup_games(&merged);
        println!("\nDry run - would load {} games, {} sales rows, {} region rows",
            games.len(),
            merged.len(),
            regions.len()
        );
        return Ok(());
    }

    fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data dir {}", data_dir.display()))?;

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&config.db_url)
        .await
        .with_context(|| format!("Failed to open database {}", config.db_url))?;

    let summary = load(&pool, &merged, &regions).await?;

    println!("\nLoaded {} games, {} sales rows, {} region rows",
        summary.games_inserted,
        summary.sales_inserted,
        summary.regions_inserted
    );
    if summary.sales_skipped > 0 {
        println!(
            "Skipped {} sales rows with no matching game key",
            summary.sales_skipped
        );
    }

    println!();
    print_table_counts(&pool).await?;
    println!("\nDatabase ready at: {}", config.db_url);

    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    fn merged_row(name: &str, platform: &str, year: i64, na: f64) -> MergedRow {
        MergedRow {
            name: name.to_string(),
            platform: platform.to_string(),
            year,
            genre: "Action".to_string(),
            publisher: Some("Nintendo".to_string()),
            na_sales: na,
            eu_sales: 0.5,
            jp_sales: 0.0,
            other_sales: 0.0,
            global_sales: na + 0.5,
            critic_score: Some(90.0),
            user_score: None,
            rating: Some("E".to_string()),
        }
    }

    fn region_row(year: i64) -> RegionRow {
        RegionRow {
            year,
            na_population: 1.0,
            eu_population: 2.0,
            jp_population: 3.0,
            other_population: 4.0,
        }
    }

    #[test]
    fn test_dedup_games_first_occurrence_wins() {
        let rows = vec![
            merged_row("Zelda", "NES", 1986, 1.0),
            merged_row("Zelda", "NES", 1986, 9.0),
            merged_row("Zelda", "SNES", 1991, 1.0),
        ];
        let games = dedup_games(&rows);
        assert_eq!(games.len(), 2);
        assert_eq!(games[0].na_sales, 1.0);
    }

    #[tokio::test]
    async fn test_load_resolves_every_fact_to_its_game() {
        let pool = test_pool().await;
        let merged = vec![
            merged_row("Zelda", "NES", 1986, 1.0),
            merged_row("Zelda", "NES", 1986, 2.0),
            merged_row("Tetris", "GB", 1989, 3.0),
        ];
        let regions = vec![region_row(1986), region_row(1989)];

        let summary = load(&pool, &merged, &regions).await.unwrap();

        assert_eq!(summary.games_inserted, 2);
        assert_eq!(summary.sales_inserted, 3);
        assert_eq!(summary.sales_skipped, 0);
        assert_eq!(summary.regions_inserted, 2);

        // Every sales row must reference an existing game.
        let (orphans,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sales s LEFT JOIN games g ON g.id = s.game_id WHERE g.id IS NULL",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(orphans, 0);

        // Both duplicate-key sales rows landed on the same game.
        let (zelda_sales,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sales s JOIN games g ON g.id = s.game_id WHERE g.name = 'Zelda'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(zelda_sales, 2);
    }

    #[tokio::test]
    async fn test_sales_with_unknown_key_are_skipped_not_fatal() {
        let pool = test_pool().await;
        let mut tx = pool.begin().await.unwrap();
        sqlx::raw_sql(SCHEMA).execute(&mut *tx).await.unwrap();

        let known = merged_row("Zelda", "NES", 1986, 1.0);
        let unknown = merged_row("Ghost", "NES", 1990, 1.0);
        insert_games(&mut tx, &[&known]).await.unwrap();
        let lookup = build_game_lookup(&mut tx).await.unwrap();

        let (inserted, skipped) = insert_sales(&mut tx, &[known, unknown], &lookup)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(inserted, 1);
        assert_eq!(skipped, 1);
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back_entirely() {
        let pool = test_pool().await;
        let merged = vec![merged_row("Zelda", "NES", 1986, 1.0)];
        let regions = vec![region_row(1986)];

        load(&pool, &merged, &regions).await.unwrap();

        // A second run trips the region_population year key; the whole batch
        // must vanish, leaving the first run's rows untouched.
        let err = load(&pool, &merged, &regions).await.unwrap_err();
        assert!(err.to_string().to_lowercase().contains("unique")
            || format!("{err:?}").to_lowercase().contains("unique"));

        let (games,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM games")
            .fetch_one(&pool)
            .await
            .unwrap();
        let (sales,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sales")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(games, 1);
        assert_eq!(sales, 1);
    }

    #[tokio::test]
    async fn test_schema_apply_is_idempotent() {
        let pool = test_pool().await;
        sqlx::raw_sql(SCHEMA).execute(&pool).await.unwrap();
        sqlx::raw_sql(SCHEMA).execute(&pool).await.unwrap();
    }

    #[test]
    fn test_missing_merged_file_is_fatal_with_path() {
        let err = read_merged(Path::new("/nonexistent/merged.csv")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/merged.csv"));
    }
}
