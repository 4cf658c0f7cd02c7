//! Cluster Service - Runs the external clustering engine and stores labels
//!
//! Responsibilities:
//! - Extract one feature vector per game from the store (games x sales)
//! - Standard-scale the features and write the exchange file for the engine
//! - Launch the engine binary as a subprocess with a timeout
//! - Validate the engine's output contract before touching the database
//! - Upsert cluster assignments so re-runs replace labels, never duplicate
//!
//! The engine is a separate program reached only through files; neither side
//! shares a type system with the other, so both the extract we write and the
//! output we read are validated here.

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// Feature columns written to the exchange file, in order, after game_id.
const FEATURE_COLUMNS: &[&str] = &[
    "critic_score",
    "user_score",
    "na_sales",
    "eu_sales",
    "jp_sales",
    "other_sales",
    "global_sales",
];

#[derive(Parser, Debug)]
#[command(name = "cluster", about = "Runs the external clustering engine and stores assignments")]
struct Args {
    /// Cluster count forwarded to the engine (engine default when omitted)
    #[arg(long)]
    k: Option<u32>,

    /// Seconds to wait for the engine before killing it
    #[arg(long, default_value = "300")]
    timeout_secs: u64,

    /// Override the data directory (defaults to DATA_DIR or ./data)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override the engine directory (defaults to ENGINE_DIR or ./engine)
    #[arg(long)]
    engine_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct Config {
    db_url: String,
    data_dir: PathBuf,
    engine_dir: PathBuf,
}

impl Config {
    fn from_env() -> Self {
        Self {
            db_url: std::env::var("DB_URL")
                .unwrap_or_else(|_| "sqlite://data/games.db?mode=rwc".to_string()),
            data_dir: PathBuf::from(
                std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            ),
            engine_dir: PathBuf::from(
                std::env::var("ENGINE_DIR").unwrap_or_else(|_| "./engine".to_string()),
            ),
        }
    }
}

// =============================================================================
// Feature extraction and scaling
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct FeatureRow {
    game_id: i64,
    features: Vec<f64>,
}

/// Pull one candidate feature vector per game. Rows missing either score are
/// dropped and counted; sales columns are NOT NULL by schema.
async fn extract_features(pool: &SqlitePool) -> Result<(Vec<FeatureRow>, usize)> {
    let rows = sqlx::query(
        r#"
        SELECT
            g.id AS game_id,
            g.critic_score,
            g.user_score,
            s.na_sales,
            s.eu_sales,
            s.jp_sales,
            s.other_sales,
            s.global_sales
        FROM games g
        JOIN sales s ON s.game_id = g.id
        "#,
    )
    .fetch_all(pool)
    .await
    .context("Failed to query game features")?;

    let mut kept = Vec::with_capacity(rows.len());
    let mut dropped = 0usize;
    for row in rows {
        let critic: Option<f64> = row.get("critic_score");
        let user: Option<f64> = row.get("user_score");
        match (critic, user) {
            (Some(critic), Some(user)) => kept.push(FeatureRow {
                game_id: row.get("game_id"),
                features: vec![
                    critic,
                    user,
                    row.get("na_sales"),
                    row.get("eu_sales"),
                    row.get("jp_sales"),
                    row.get("other_sales"),
                    row.get("global_sales"),
                ],
            }),
            _ => dropped += 1,
        }
    }
    Ok((kept, dropped))
}

/// Z-score each feature column in place. Standard deviation is the
/// population one, and a zero-variance column divides by 1.0 so constant
/// features collapse to zero instead of NaN.
fn scale_features(rows: &mut [FeatureRow]) {
    if rows.is_empty() {
        return;
    }
    let dim = rows[0].features.len();
    let n = rows.len() as f64;
    for col in 0..dim {
        let mean = rows.iter().map(|r| r.features[col]).sum::<f64>() / n;
        let variance = rows
            .iter()
            .map(|r| {
                let d = r.features[col] - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        let std = variance.sqrt();
        let scale = if std == 0.0 { 1.0 } else { std };
        for row in rows.iter_mut() {
            row.features[col] = (row.features[col] - mean) / scale;
        }
    }
}

fn write_features(path: &Path, rows: &[FeatureRow]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to open {} for writing", path.display()))?;

    let mut header = vec!["game_id".to_string()];
    header.extend(FEATURE_COLUMNS.iter().map(|c| c.to_string()));
    writer.write_record(&header)?;

    for row in rows {
        let mut record = vec![row.game_id.to_string()];
        record.extend(row.features.iter().map(|v| v.to_string()));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

// =============================================================================
// Engine invocation
// =============================================================================

/// Platform-specific engine binary inside the engine directory.
fn engine_binary(engine_dir: &Path) -> PathBuf {
    let name = if cfg!(windows) {
        "cluster_engine.exe"
    } else {
        "cluster_engine"
    };
    engine_dir.join(name)
}

/// Run the engine synchronously. The engine resolves its data/ directory
/// from its working directory (or that directory's parent), so it runs from
/// the parent of the data dir. Non-zero exit and timeout are both fatal;
/// timeout kills the child and leaves the stage retryable.
async fn run_engine(
    exe: &Path,
    data_dir: &Path,
    k: Option<u32>,
    timeout_secs: u64,
) -> Result<()> {
    if !exe.exists() {
        anyhow::bail!(
            "Cluster engine not found at {}. Place the platform build of the engine there before running this stage.",
            exe.display()
        );
    }

    let run_dir = data_dir
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut cmd = Command::new(exe);
    if let Some(k) = k {
        cmd.arg(k.to_string());
    }
    cmd.current_dir(run_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd
        .spawn()
        .with_context(|| format!("Failed to launch cluster engine at {}", exe.display()))?;

    let output = match timeout(Duration::from_secs(timeout_secs), child.wait_with_output()).await {
        Ok(result) => result.context("Failed to wait for cluster engine")?,
        Err(_) => anyhow::bail!(
            "Cluster engine timed out after {}s and was terminated; re-run this stage once the engine is responsive",
            timeout_secs
        ),
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        anyhow::bail!(
            "Cluster engine failed (code {:?}). Stdout: {} Stderr: {}",
            output.status.code(),
            stdout.trim(),
            stderr.trim()
        );
    }

    if !stdout.trim().is_empty() {
        println!("{}", stdout.trim());
    }
    if !stderr.trim().is_empty() {
        eprintln!("{}", stderr.trim());
    }
    Ok(())
}

// =============================================================================
// Output contract validation and upsert
// =============================================================================

/// Read the engine's output file. The contract requires game_id and
/// cluster_id columns; extra columns are ignored. Validation happens here,
/// before any database write.
fn read_cluster_output(path: &Path) -> Result<Vec<(i64, i64)>> {
    if !path.exists() {
        anyhow::bail!("cluster_output.csv not found at {}", path.display());
    }

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let headers = reader.headers()?.clone();
    let game_idx = headers.iter().position(|h| h == "game_id");
    let cluster_idx = headers.iter().position(|h| h == "cluster_id");
    let (game_idx, cluster_idx) = match (game_idx, cluster_idx) {
        (Some(game_idx), Some(cluster_idx)) => (game_idx, cluster_idx),
        _ => anyhow::bail!(
            "Cluster output must contain game_id and cluster_id columns (found: {:?})",
            headers.iter().collect::<Vec<_>>()
        ),
    };

    let mut rows = Vec::new();
    let mut malformed = 0usize;
    for record in reader.records() {
        let record = record?;
        let game_id = record.get(game_idx).and_then(|v| v.trim().parse::<i64>().ok());
        let cluster_id = record
            .get(cluster_idx)
            .and_then(|v| v.trim().parse::<i64>().ok());
        match (game_id, cluster_id) {
            (Some(game_id), Some(cluster_id)) => rows.push((game_id, cluster_id)),
            _ => malformed += 1,
        }
    }
    if malformed > 0 {
        eprintln!("Warning: skipped {} malformed cluster row(s)", malformed);
    }
    Ok(rows)
}

/// Replace-on-conflict write of the assignments, one transaction for the
/// whole batch. Re-running the engine with new parameters overwrites the
/// previous label for each game.
async fn upsert_clusters(pool: &SqlitePool, rows: &[(i64, i64)]) -> Result<usize> {
    let mut tx = pool
        .begin()
        .await
        .context("Failed to open cluster transaction")?;
    for (game_id, cluster_id) in rows {
        sqlx::query(
            r#"
            INSERT INTO clusters (game_id, cluster_id)
            VALUES (?, ?)
            ON CONFLICT (game_id) DO UPDATE SET cluster_id = excluded.cluster_id
            "#,
        )
        .bind(game_id)
        .bind(cluster_id)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit()
        .await
        .context("Failed to commit cluster transaction")?;
    Ok(rows.len())
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
    let engine_dir = args.engine_dir.unwrap_or(config.engine_dir);

    println!("=== Game Market Cluster Bridge ===");
    println!("Data dir: {}", data_dir.display());
    println!("Engine dir: {}", engine_dir.display());

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&config.db_url)
        .await
        .with_context(|| format!("Failed to open database {}", config.db_url))?;

    // Feature extract for the engine.
    let (mut features, dropped) = extract_features(&pool).await?;
    println!(
        "Feature rows: {} ({} dropped with missing scores)",
        features.len(),
        dropped
    );
    if features.is_empty() {
        anyhow::bail!("No complete feature rows available for clustering; run the loader first");
    }

    scale_features(&mut features);
    let features_path = data_dir.join("features_for_clustering.csv");
    write_features(&features_path, &features)?;
    println!("Wrote features to: {}", features_path.display());

    // Engine run.
    let exe = engine_binary(&engine_dir);
    println!("\nRunning cluster engine: {}", exe.display());
    run_engine(&exe, &data_dir, args.k, args.timeout_secs).await?;

    // Output contract, then upsert.
    let output_path = data_dir.join("cluster_output.csv");
    let assignments = read_cluster_output(&output_path)?;
    let count = upsert_clusters(&pool, &assignments).await?;
    println!("\nWrote {} cluster assignments into clusters table.", count);

    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
