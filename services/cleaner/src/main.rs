//! Cleaner Service - Normalizes raw exports into tidy, reconciled tables
//!
//! Responsibilities:
//! - Clean the console sales export (snake_case headers, numeric coercion,
//!   sales fill + global total, required-field row drops)
//! - Parse the population export whose delimiter/quoting/encoding varies
//! - Reshape population from wide to long (one row per country/year)
//! - Aggregate population into na/eu/jp/other region buckets per year
//! - Merge console rows with region population by release year (inner join)
//!
//! Every stage reads its input file, writes its output file, and prints
//! before/after row counts so dropped rows are visible in aggregate.

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "cleaner", about = "Cleans and reconciles raw tabular exports")]
struct Args {
    /// Stage to run: console, population, regions, merge, all
    #[arg(long, default_value = "all")]
    stage: String,

    /// Override the data directory (defaults to DATA_DIR or ./data)
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct Config {
    data_dir: PathBuf,
}

impl Config {
    fn from_env() -> Self {
        Self {
            data_dir: PathBuf::from(
                std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            ),
        }
    }
}

// =============================================================================
// Column label normalization
// =============================================================================

/// Convert a raw column label to snake_case.
///
/// Collapses every run of non-alphanumeric characters into a single
/// underscore, splits fused camelCase words, strips leading/trailing
/// separators and lowercases. Total: never fails, and applying it twice
/// equals applying it once.
fn to_snake(label: &str) -> String {
    let mut out = String::with_capacity(label.len() + 4);
    let mut prev_lower_or_digit = false;
    let mut pending_sep = false;
    for ch in label.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            if ch.is_ascii_uppercase() && prev_lower_or_digit {
                pending_sep = true;
            }
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(ch.to_ascii_lowercase());
            prev_lower_or_digit = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        } else {
            pending_sep = true;
            prev_lower_or_digit = false;
        }
    }
    out
}

/// Trim a label and strip one layer of enclosing quote characters.
fn strip_label(label: &str) -> String {
    label
        .trim()
        .trim_matches('"')
        .trim_matches('\'')
        .to_string()
}

/// Parse a numeric cell. Empty or unparseable cells become None, never zero,
/// so missingness stays distinguishable from a true zero.
fn parse_num(raw: &str) -> Option<f64> {
    let cleaned = raw.trim();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

/// Parse an integer year. Accepts float spellings like "2006.0".
fn parse_year(raw: &str) -> Option<i64> {
    let cleaned = raw.trim();
    if cleaned.is_empty() {
        return None;
    }
    if let Ok(year) = cleaned.parse::<i64>() {
        return Some(year);
    }
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| v as i64)
}

/// Decode raw file bytes as UTF-8, tolerating a byte-order mark.
fn decode_input(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let (text, _, _) = encoding_rs::UTF_8.decode(&bytes);
    Ok(text.into_owned())
}

// =============================================================================
// Console export cleaning
// =============================================================================

/// Canonical cleaned console row. The column order written to disk is the
/// field order here; downstream stages rely on these names, not positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ConsoleRow {
    name: String,
    platform: String,
    year_of_release: Option<i64>,
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

#[derive(Debug, Default)]
struct ConsoleStats {
    raw_rows: usize,
    dropped_rows: usize,
}

fn optional_cell(record: &csv::StringRecord, col: Option<usize>) -> Option<String> {
    col.and_then(|idx| record.get(idx))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn numeric_cell(record: &csv::StringRecord, col: Option<usize>) -> Option<f64> {
    col.and_then(|idx| record.get(idx)).and_then(parse_num)
}

/// Clean the tab-delimited console export.
///
/// The export arrives with arbitrary header casing and trailing columns that
/// are entirely empty; those columns are dropped before headers are
/// normalized. Rows missing name or genre are dropped and counted.
fn clean_console_text(content: &str) -> Result<(Vec<ConsoleRow>, ConsoleStats)> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .context("Failed to read console header row")?
        .iter()
        .map(str::to_string)
        .collect();

    let mut records: Vec<csv::StringRecord> = Vec::new();
    for (line_num, result) in reader.records().enumerate() {
        match result {
            Ok(record) => records.push(record),
            Err(e) => eprintln!(
                "Warning: skipping console line {} due to error: {}",
                line_num + 2,
                e
            ),
        }
    }

    // Drop columns with no data at all (the export pads rows with trailing
    // empty fields).
    let mut column_index: HashMap<String, usize> = HashMap::new();
    for (idx, header) in headers.iter().enumerate() {
        let has_data = records
            .iter()
            .any(|r| !r.get(idx).unwrap_or("").trim().is_empty());
        if !has_data {
            continue;
        }
        column_index.entry(to_snake(header)).or_insert(idx);
    }

    let name_col = *column_index
        .get("name")
        .with_context(|| format!("Console export has no name column. Headers: {:?}", headers))?;
    let genre_col = *column_index.get("genre").with_context(|| {
        format!("Console export has no genre column. Headers: {:?}", headers)
    })?;
    let platform_col = *column_index.get("platform").with_context(|| {
        format!("Console export has no platform column. Headers: {:?}", headers)
    })?;

    let year_col = column_index.get("year_of_release").copied();
    let publisher_col = column_index.get("publisher").copied();
    let critic_col = column_index.get("critic_score").copied();
    let user_col = column_index.get("user_score").copied();
    let rating_col = column_index.get("rating").copied();
    let na_col = column_index.get("na_sales").copied();
    let eu_col = column_index.get("eu_sales").copied();
    let jp_col = column_index.get("jp_sales").copied();
    let other_col = column_index.get("other_sales").copied();

    let mut stats = ConsoleStats {
        raw_rows: records.len(),
        ..ConsoleStats::default()
    };
    let mut rows = Vec::with_capacity(records.len());

    for record in &records {
        let name = record.get(name_col).unwrap_or("").trim().to_string();
        let genre = record.get(genre_col).unwrap_or("").trim().to_string();
        if name.is_empty() || genre.is_empty() {
            stats.dropped_rows += 1;
            continue;
        }

        let na_sales = numeric_cell(record, na_col).unwrap_or(0.0);
        let eu_sales = numeric_cell(record, eu_col).unwrap_or(0.0);
        let jp_sales = numeric_cell(record, jp_col).unwrap_or(0.0);
        let other_sales = numeric_cell(record, other_col).unwrap_or(0.0);

        rows.push(ConsoleRow {
            name,
            platform: record.get(platform_col).unwrap_or("").trim().to_string(),
            year_of_release: year_col.and_then(|idx| record.get(idx)).and_then(parse_year),
            genre,
            publisher: optional_cell(record, publisher_col),
            na_sales,
            eu_sales,
            jp_sales,
            other_sales,
            global_sales: na_sales + eu_sales + jp_sales + other_sales,
            critic_score: numeric_cell(record, critic_col),
            user_score: numeric_cell(record, user_col),
            rating: optional_cell(record, rating_col),
        });
    }

    Ok((rows, stats))
}

fn clean_console(input: &Path, output: &Path) -> Result<()> {
    if !input.exists() {
        anyhow::bail!("Console data file not found: {}", input.display());
    }

    let content = decode_input(input)?;
    let (rows, stats) = clean_console_text(&content)?;

    println!("Raw rows: {}", stats.raw_rows);
    println!(
        "Cleaned rows: {} ({} dropped for missing name/genre)",
        rows.len(),
        stats.dropped_rows
    );

    let mut writer = csv::Writer::from_path(output)
        .with_context(|| format!("Failed to open {} for writing", output.display()))?;
    for row in &rows {
        writer.serialize(row)?;
    }
    writer.flush()?;

    println!("Wrote cleaned console data to: {}", output.display());
    Ok(())
}

// =============================================================================
// Population export parsing (delimiter/quoting unknown in advance)
// =============================================================================

/// Parser configurations tried in priority order: (delimiter, quoting).
const PARSE_CANDIDATES: &[(u8, bool)] = &[(b'\t', true), (b'\t', false), (b',', true)];

/// Known identity-column label pairs, checked in priority order before
/// falling back to the first two columns positionally.
const ID_COLUMN_CANDIDATES: &[(&str, &str)] = &[
    ("Country Name", "Country Code"),
    ("country name", "country code"),
    ("CountryName", "CountryCode"),
    ("country_name", "country_code"),
];

#[derive(Debug)]
struct RawTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

fn try_parse_candidate(content: &str, delimiter: u8, quoting: bool) -> Result<RawTable> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .quoting(quoting)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .context("failed to read header row")?
        .iter()
        .map(strip_label)
        .collect();
    if headers.len() < 2 {
        anyhow::bail!("only {} column(s) detected", headers.len());
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        // Strict field counts here: a ragged parse means the candidate
        // configuration does not match the file.
        let record = record?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(RawTable { headers, rows })
}

/// Manual recovery when no structured candidate matches: normalize line
/// endings, split on tabs, first row is the header.
fn manual_population_fallback(content: &str) -> Result<RawTable> {
    let text = content.replace("\r\n", "\n").replace('\r', "\n");
    let mut lines = text.split('\n').filter(|line| !line.trim().is_empty());

    let headers: Vec<String> = match lines.next() {
        Some(line) => line.split('\t').map(strip_label).collect(),
        None => anyhow::bail!("Population export is empty"),
    };
    if headers.len() < 2 {
        anyhow::bail!("Population export fallback produced fewer than 2 columns");
    }

    let rows = lines
        .map(|line| line.split('\t').map(str::to_string).collect())
        .collect();
    Ok(RawTable { headers, rows })
}

/// Try each parser configuration in order and accept the first that parses
/// without structural error; degrade to the manual text-splitting path only
/// when every candidate fails.
fn parse_population_table(content: &str) -> Result<RawTable> {
    for &(delimiter, quoting) in PARSE_CANDIDATES {
        match try_parse_candidate(content, delimiter, quoting) {
            Ok(table) => return Ok(table),
            Err(e) => eprintln!(
                "Warning: population parse candidate (delimiter={:?}, quoting={}) rejected: {}",
                delimiter as char, quoting, e
            ),
        }
    }
    eprintln!("Warning: no structured parse candidate matched; using manual fallback");
    manual_population_fallback(content)
}

fn resolve_identity_columns(headers: &[String]) -> (usize, usize) {
    for (name_label, code_label) in ID_COLUMN_CANDIDATES {
        let name_idx = headers.iter().position(|h| h == name_label);
        let code_idx = headers.iter().position(|h| h == code_label);
        if let (Some(name_idx), Some(code_idx)) = (name_idx, code_idx) {
            return (name_idx, code_idx);
        }
    }
    // No known pair matched: treat the first two columns as (name, code).
    (0, 1)
}

// =============================================================================
// Wide-to-long reshaping
// =============================================================================

/// Tidy population row. Population stays optional after coercion so an
/// unparseable cell is not confused with an explicit zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PopulationRow {
    country_name: String,
    country_code: String,
    year: i64,
    population: Option<f64>,
}

#[derive(Debug, Default)]
struct MeltStats {
    dropped_year_cells: usize,
}

/// Melt the wide table into one row per (country, year). Year labels that do
/// not parse to an integer are dropped and counted.
fn melt_population(table: &RawTable) -> (Vec<PopulationRow>, MeltStats) {
    let (name_idx, code_idx) = resolve_identity_columns(&table.headers);

    let mut rows = Vec::new();
    let mut stats = MeltStats::default();
    for raw in &table.rows {
        let country_name = strip_label(raw.get(name_idx).map(String::as_str).unwrap_or(""));
        let country_code = strip_label(raw.get(code_idx).map(String::as_str).unwrap_or(""));
        for (idx, header) in table.headers.iter().enumerate() {
            if idx == name_idx || idx == code_idx {
                continue;
            }
            let year = match parse_year(header) {
                Some(year) => year,
                None => {
                    stats.dropped_year_cells += 1;
                    continue;
                }
            };
            rows.push(PopulationRow {
                country_name: country_name.clone(),
                country_code: country_code.clone(),
                year,
                population: parse_num(raw.get(idx).map(String::as_str).unwrap_or("")),
            });
        }
    }
    (rows, stats)
}

fn clean_population(input: &Path, output: &Path) -> Result<()> {
    if !input.exists() {
        anyhow::bail!("Population data file not found: {}", input.display());
    }

    let content = decode_input(input)?;
    let table = parse_population_table(&content)?;
    println!(
        "Parsed population table: {} rows x {} columns",
        table.rows.len(),
        table.headers.len()
    );

    let (rows, stats) = melt_population(&table);
    println!(
        "Melted rows: {} ({} cells dropped for unparseable year labels)",
        rows.len(),
        stats.dropped_year_cells
    );

    let mut writer = csv::Writer::from_path(output)
        .with_context(|| format!("Failed to open {} for writing", output.display()))?;
    for row in &rows {
        writer.serialize(row)?;
    }
    writer.flush()?;

    println!("Wrote cleaned population data to: {}", output.display());
    Ok(())
}

// =============================================================================
// Region aggregation
// =============================================================================

const NORTH_AMERICA: &[&str] = &["USA", "US", "CAN", "MEX"];
const EUROPE: &[&str] = &[
    "GBR", "DEU", "FRA", "ESP", "ITA", "NLD", "BEL", "CHE", "AUT", "SWE", "NOR", "DNK", "FIN",
    "IRL", "PRT", "GRC", "POL", "CZE", "HUN", "ROU", "BGR", "SVK", "SVN", "HRV", "EST", "LVA",
    "LTU", "UKR", "RUS", "TUR",
];
const JAPAN: &[&str] = &["JPN"];

/// Map a country code to one of the four region buckets. Closed and
/// exhaustive: anything outside the static sets is "other".
fn region_for(code: &str) -> &'static str {
    let normalized = code.trim().to_ascii_uppercase();
    if NORTH_AMERICA.contains(&normalized.as_str()) {
        "na"
    } else if EUROPE.contains(&normalized.as_str()) {
        "eu"
    } else if JAPAN.contains(&normalized.as_str()) {
        "jp"
    } else {
        "other"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RegionRow {
    year: i64,
    na_population: f64,
    eu_population: f64,
    jp_population: f64,
    other_population: f64,
}

/// Sum population per (year, region). Null populations contribute zero, and
/// every year present in the input produces exactly one output row, with
/// zero-filled regions, ascending by year.
fn build_region_population(rows: &[PopulationRow]) -> Vec<RegionRow> {
    let mut by_year: BTreeMap<i64, RegionRow> = BTreeMap::new();
    for row in rows {
        let entry = by_year.entry(row.year).or_insert(RegionRow {
            year: row.year,
            na_population: 0.0,
            eu_population: 0.0,
            jp_population: 0.0,
            other_population: 0.0,
        });
        let value = row.population.unwrap_or(0.0);
        match region_for(&row.country_code) {
            "na" => entry.na_population += value,
            "eu" => entry.eu_population += value,
            "jp" => entry.jp_population += value,
            _ => entry.other_population += value,
        }
    }
    by_year.into_values().collect()
}

fn build_regions(input: &Path, output: &Path) -> Result<()> {
    if !input.exists() {
        anyhow::bail!("Clean population file not found: {}", input.display());
    }

    let mut reader = csv::Reader::from_path(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let mut rows: Vec<PopulationRow> = Vec::new();
    for result in reader.deserialize() {
        rows.push(result?);
    }

    let regions = build_region_population(&rows);
    println!(
        "Aggregated {} population rows into {} year rows",
        rows.len(),
        regions.len()
    );

    let mut writer = csv::Writer::from_path(output)
        .with_context(|| format!("Failed to open {} for writing", output.display()))?;
    for row in &regions {
        writer.serialize(row)?;
    }
    writer.flush()?;

    println!("Wrote region population totals to: {}", output.display());
    Ok(())
}

// =============================================================================
// Year-keyed merge
// =============================================================================

/// Merged output row. The field order fixes the on-disk column order so
/// downstream consumers never depend on incidental ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
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
    na_population: f64,
    eu_population: f64,
    jp_population: f64,
    other_population: f64,
}

/// Inner join on release year against the region population years. Console
/// rows with no release year, or with a year absent from the population
/// table, are dropped.
fn merge_with_population(
    console: &[ConsoleRow],
    regions: &BTreeMap<i64, RegionRow>,
) -> (Vec<MergedRow>, usize) {
    let mut merged = Vec::new();
    let mut dropped = 0usize;
    for row in console {
        let region = match row.year_of_release.and_then(|year| regions.get(&year)) {
            Some(region) => region,
            None => {
                dropped += 1;
                continue;
            }
        };
        merged.push(MergedRow {
            name: row.name.clone(),
            platform: row.platform.clone(),
            year: region.year,
            genre: row.genre.clone(),
            publisher: row.publisher.clone(),
            na_sales: row.na_sales,
            eu_sales: row.eu_sales,
            jp_sales: row.jp_sales,
            other_sales: row.other_sales,
            global_sales: row.global_sales,
            critic_score: row.critic_score,
            user_score: row.user_score,
            rating: row.rating.clone(),
            na_population: region.na_population,
            eu_population: region.eu_population,
            jp_population: region.jp_population,
            other_population: region.other_population,
        });
    }
    (merged, dropped)
}

fn merge_games(console_in: &Path, regions_in: &Path, output: &Path) -> Result<()> {
    if !console_in.exists() {
        anyhow::bail!("Console data not found: {}", console_in.display());
    }
    if !regions_in.exists() {
        anyhow::bail!("Population data not found: {}", regions_in.display());
    }

    let mut console_reader = csv::Reader::from_path(console_in)
        .with_context(|| format!("Failed to read {}", console_in.display()))?;
    let mut console: Vec<ConsoleRow> = Vec::new();
    for result in console_reader.deserialize() {
        console.push(result?);
    }

    let mut region_reader = csv::Reader::from_path(regions_in)
        .with_context(|| format!("Failed to read {}", regions_in.display()))?;
    let mut regions: BTreeMap<i64, RegionRow> = BTreeMap::new();
    for result in region_reader.deserialize() {
        let row: RegionRow = result?;
        regions.insert(row.year, row);
    }

    let (merged, dropped) = merge_with_population(&console, &regions);
    println!(
        "Merged rows: {} ({} console rows dropped with no population year)",
        merged.len(),
        dropped
    );

    let mut writer = csv::Writer::from_path(output)
        .with_context(|| format!("Failed to open {} for writing", output.display()))?;
    for row in &merged {
        writer.serialize(row)?;
    }
    writer.flush()?;

    println!("Wrote merged data to: {}", output.display());
    Ok(())
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::from_env();
    let data_dir = args.data_dir.unwrap_or(config.data_dir);

    println!("=== Game Market Cleaner ===");
    println!("Data dir: {}", data_dir.display());
    println!("Stage: {}", args.stage);

    fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data dir {}", data_dir.display()))?;

    let stage = args.stage.as_str();
    if !matches!(stage, "console" | "population" | "regions" | "merge" | "all") {
        anyhow::bail!(
            "Unknown stage '{}'. Expected console, population, regions, merge or all",
            stage
        );
    }

    if matches!(stage, "console" | "all") {
        println!("\n--- Console export ---");
        clean_console(
            &data_dir.join("Console_Data.csv"),
            &data_dir.join("clean_console_data.csv"),
        )?;
    }

    if matches!(stage, "population" | "all") {
        println!("\n--- Population export ---");
        clean_population(
            &data_dir.join("Population.csv"),
            &data_dir.join("clean_population_data.csv"),
        )?;
    }

    if matches!(stage, "regions" | "all") {
        println!("\n--- Region rollup ---");
        build_regions(
            &data_dir.join("clean_population_data.csv"),
            &data_dir.join("region_population_by_year.csv"),
        )?;
    }

    if matches!(stage, "merge" | "all") {
        println!("\n--- Year-keyed merge ---");
        merge_games(
            &data_dir.join("clean_console_data.csv"),
            &data_dir.join("region_population_by_year.csv"),
            &data_dir.join("merged_games_population.csv"),
        )?;
    }

    println!("\n=== Cleaning Complete ===");
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // LABEL NORMALIZATION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_to_snake_basic() {
        assert_eq!(to_snake("Year_of_Release"), "year_of_release");
        assert_eq!(to_snake("NA_Sales"), "na_sales");
        assert_eq!(to_snake("User Score"), "user_score");
    }

    #[test]
    fn test_to_snake_camel_case_boundary() {
        assert_eq!(to_snake("userScore"), "user_score");
        assert_eq!(to_snake("criticScore2Plus"), "critic_score2_plus");
    }

    #[test]
    fn test_to_snake_collapses_separator_runs() {
        assert_eq!(to_snake("  NA -- Sales!! "), "na_sales");
        assert_eq!(to_snake("__Other___Sales__"), "other_sales");
    }

    #[test]
    fn test_to_snake_idempotent() {
        for label in ["Year_of_Release", "userScore", "NA -- Sales", "rating"] {
            let once = to_snake(label);
            assert_eq!(to_snake(&once), once);
        }
    }

    #[test]
    fn test_strip_label_quotes() {
        assert_eq!(strip_label("  \"Country Name\"  "), "Country Name");
        assert_eq!(strip_label("'1990'"), "1990");
        assert_eq!(strip_label("plain"), "plain");
    }

    #[test]
    fn test_parse_num_and_year() {
        assert_eq!(parse_num("1.5"), Some(1.5));
        assert_eq!(parse_num("  "), None);
        assert_eq!(parse_num("tbd"), None);
        assert_eq!(parse_year("2006"), Some(2006));
        assert_eq!(parse_year("2006.0"), Some(2006));
        assert_eq!(parse_year("notayear"), None);
    }

    // -------------------------------------------------------------------------
    // CONSOLE CLEANING TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_console_fills_missing_sales_and_totals() {
        let content = "Name\tPlatform\tGenre\tNA_Sales\tEU_Sales\tJP_Sales\tOther_Sales\n\
                       Zelda\tNES\tAction\t1.2\t0.3\t\t\n";
        let (rows, stats) = clean_console_text(content).unwrap();

        assert_eq!(stats.raw_rows, 1);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].na_sales, 1.2);
        assert_eq!(rows[0].eu_sales, 0.3);
        assert_eq!(rows[0].jp_sales, 0.0);
        assert_eq!(rows[0].other_sales, 0.0);
        assert_eq!(rows[0].global_sales, 1.5);
    }

    #[test]
    fn test_console_drops_rows_missing_name_or_genre() {
        let content = "Name\tPlatform\tGenre\tNA_Sales\n\
                       Zelda\tNES\tAction\t1.0\n\
                       \tNES\tAction\t2.0\n\
                       Tetris\tGB\t\t3.0\n";
        let (rows, stats) = clean_console_text(content).unwrap();

        assert_eq!(stats.raw_rows, 3);
        assert_eq!(stats.dropped_rows, 2);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "Zelda");
    }

    #[test]
    fn test_console_coerces_numbers_and_keeps_missing_scores_null() {
        let content = "Name\tPlatform\tYear_of_Release\tGenre\tCritic_Score\tUser_Score\n\
                       Zelda\tNES\t1986.0\tAction\t95\ttbd\n";
        let (rows, _) = clean_console_text(content).unwrap();

        assert_eq!(rows[0].year_of_release, Some(1986));
        assert_eq!(rows[0].critic_score, Some(95.0));
        assert_eq!(rows[0].user_score, None);
    }

    #[test]
    fn test_console_ignores_all_empty_trailing_columns() {
        // The export pads every row with a trailing tab; the phantom column
        // must not shadow real ones during header normalization.
        let content = "Name\tPlatform\tGenre\t\n\
                       Zelda\tNES\tAction\t\n";
        let (rows, _) = clean_console_text(content).unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].platform, "NES");
    }

    #[test]
    fn test_console_header_casing_is_normalized() {
        let content = "NAME\tplatform\tGENRE\tna_SALES\n\
                       Zelda\tNES\tAction\t1.0\n";
        let (rows, _) = clean_console_text(content).unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].na_sales, 1.0);
    }

    #[test]
    fn test_console_missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = clean_console(
            &dir.path().join("Console_Data.csv"),
            &dir.path().join("out.csv"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("Console data file not found"));
    }

    // -------------------------------------------------------------------------
    // POPULATION PARSING TESTS
    // -------------------------------------------------------------------------

    const TAB_INPUT: &str = "Country Name\tCountry Code\t1990\t1991\n\
                             Japan\tJPN\t100\t105\n\
                             France\tFRA\t50\t51\n";
    const QUOTED_TAB_INPUT: &str = "\"Country Name\"\t\"Country Code\"\t\"1990\"\t\"1991\"\n\
                                    \"Japan\"\t\"JPN\"\t\"100\"\t\"105\"\n\
                                    \"France\"\t\"FRA\"\t\"50\"\t\"51\"\n";
    const COMMA_INPUT: &str = "Country Name,Country Code,1990,1991\n\
                               Japan,JPN,100,105\n\
                               France,FRA,50,51\n";

    fn melt(content: &str) -> Vec<PopulationRow> {
        let table = parse_population_table(content).unwrap();
        melt_population(&table).0
    }

    #[test]
    fn test_population_equivalent_inputs_produce_identical_rows() {
        let from_tab = melt(TAB_INPUT);
        let from_quoted = melt(QUOTED_TAB_INPUT);
        let from_comma = melt(COMMA_INPUT);

        assert_eq!(from_tab, from_quoted);
        assert_eq!(from_tab, from_comma);
        assert_eq!(from_tab.len(), 4);
        assert_eq!(
            from_tab[0],
            PopulationRow {
                country_name: "Japan".to_string(),
                country_code: "JPN".to_string(),
                year: 1990,
                population: Some(100.0),
            }
        );
    }

    #[test]
    fn test_decode_input_strips_byte_order_mark() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Population.csv");
        std::fs::write(&path, b"\xef\xbb\xbfCountry Name\tCountry Code\t1990\nJapan\tJPN\t100\n")
            .unwrap();

        let content = decode_input(&path).unwrap();
        assert!(content.starts_with("Country Name"));

        let rows = melt(&content);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].country_code, "JPN");
    }

    #[test]
    fn test_population_manual_fallback_on_ragged_rows() {
        // Ragged rows fail every strict candidate; the manual tab-splitting
        // path recovers them.
        let content = "Country Name\tCountry Code\t1990\t1991\r\n\
                       Japan\tJPN\t100\r\n\
                       France\tFRA\t50\t51\r\n";
        let table = parse_population_table(content).unwrap();

        assert_eq!(table.headers.len(), 4);
        assert_eq!(table.rows.len(), 2);
        let (rows, _) = melt_population(&table);
        // Japan's missing 1991 cell melts to a null population, not a zero.
        let japan_1991 = rows
            .iter()
            .find(|r| r.country_code == "JPN" && r.year == 1991)
            .unwrap();
        assert_eq!(japan_1991.population, None);
    }

    #[test]
    fn test_population_identity_fallback_is_positional() {
        let content = "Pays\tISO\t1990\nJapon\tJPN\t100\n";
        let rows = melt(content);
        assert_eq!(rows[0].country_name, "Japon");
        assert_eq!(rows[0].country_code, "JPN");
    }

    #[test]
    fn test_population_fewer_than_two_columns_is_fatal() {
        let err = parse_population_table("justonecolumn\nvalue\n").unwrap_err();
        assert!(err.to_string().contains("fewer than 2 columns"));
    }

    #[test]
    fn test_melt_produces_n_by_m_rows_and_drops_bad_year_labels() {
        let table = RawTable {
            headers: vec![
                "country_name".to_string(),
                "country_code".to_string(),
                "1990".to_string(),
                "1991".to_string(),
                "notayear".to_string(),
            ],
            rows: vec![
                vec!["Japan".into(), "JPN".into(), "100".into(), "105".into(), "x".into()],
                vec!["France".into(), "FRA".into(), "50".into(), "51".into(), "y".into()],
            ],
        };
        let (rows, stats) = melt_population(&table);

        // 2 identity rows x 2 parseable year columns.
        assert_eq!(rows.len(), 4);
        assert_eq!(stats.dropped_year_cells, 2);
        assert!(rows.iter().all(|r| r.year == 1990 || r.year == 1991));
    }

    #[test]
    fn test_melt_preserves_null_population() {
        let table = RawTable {
            headers: vec!["n".to_string(), "c".to_string(), "1990".to_string()],
            rows: vec![vec!["Japan".into(), "JPN".into(), "".into()]],
        };
        let (rows, _) = melt_population(&table);
        assert_eq!(rows[0].population, None);
    }

    // -------------------------------------------------------------------------
    // REGION AGGREGATION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_region_for_static_buckets() {
        assert_eq!(region_for("JPN"), "jp");
        assert_eq!(region_for("USA"), "na");
        assert_eq!(region_for("  deu "), "eu");
        assert_eq!(region_for("BRA"), "other");
        assert_eq!(region_for(""), "other");
    }

    fn pop(code: &str, year: i64, population: Option<f64>) -> PopulationRow {
        PopulationRow {
            country_name: code.to_string(),
            country_code: code.to_string(),
            year,
            population,
        }
    }

    #[test]
    fn test_region_rollup_sums_are_exhaustive() {
        let rows = vec![
            pop("USA", 1990, Some(10.0)),
            pop("JPN", 1990, Some(5.0)),
            pop("FRA", 1990, Some(3.0)),
            pop("BRA", 1990, Some(2.0)),
            pop("IND", 1990, None),
        ];
        let regions = build_region_population(&rows);

        assert_eq!(regions.len(), 1);
        let r = &regions[0];
        let total = r.na_population + r.eu_population + r.jp_population + r.other_population;
        assert_eq!(total, 20.0);
        assert_eq!(r.jp_population, 5.0);
        assert_eq!(r.other_population, 2.0);
    }

    #[test]
    fn test_region_rollup_one_row_per_year_ascending() {
        let rows = vec![
            pop("JPN", 1992, Some(1.0)),
            pop("JPN", 1990, Some(1.0)),
            pop("USA", 1992, Some(1.0)),
            pop("USA", 1991, Some(1.0)),
        ];
        let regions = build_region_population(&rows);

        let years: Vec<i64> = regions.iter().map(|r| r.year).collect();
        assert_eq!(years, vec![1990, 1991, 1992]);
    }

    #[test]
    fn test_region_rollup_zero_fills_empty_regions() {
        let regions = build_region_population(&[pop("JPN", 1990, Some(7.0))]);
        assert_eq!(regions[0].jp_population, 7.0);
        assert_eq!(regions[0].na_population, 0.0);
        assert_eq!(regions[0].eu_population, 0.0);
        assert_eq!(regions[0].other_population, 0.0);
    }

    // -------------------------------------------------------------------------
    // MERGE TESTS
    // -------------------------------------------------------------------------

    fn console_row(name: &str, year: Option<i64>) -> ConsoleRow {
        ConsoleRow {
            name: name.to_string(),
            platform: "NES".to_string(),
            year_of_release: year,
            genre: "Action".to_string(),
            publisher: None,
            na_sales: 1.0,
            eu_sales: 0.0,
            jp_sales: 0.0,
            other_sales: 0.0,
            global_sales: 1.0,
            critic_score: None,
            user_score: None,
            rating: None,
        }
    }

    fn region_row(year: i64) -> RegionRow {
        RegionRow {
            year,
            na_population: 100.0,
            eu_population: 200.0,
            jp_population: 50.0,
            other_population: 10.0,
        }
    }

    #[test]
    fn test_merge_is_a_true_inner_join() {
        let console = vec![
            console_row("Matched", Some(1991)),
            console_row("NoPopulationYear", Some(1990)),
            console_row("NoYearAtAll", None),
        ];
        let regions: BTreeMap<i64, RegionRow> = [(1991, region_row(1991))].into_iter().collect();

        let (merged, dropped) = merge_with_population(&console, &regions);

        assert_eq!(merged.len(), 1);
        assert_eq!(dropped, 2);
        assert_eq!(merged[0].name, "Matched");
        assert_eq!(merged[0].year, 1991);
        assert_eq!(merged[0].eu_population, 200.0);
    }

    #[test]
    fn test_merged_column_order_is_fixed() {
        let (merged, _) = merge_with_population(
            &[console_row("Zelda", Some(1990))],
            &[(1990, region_row(1990))].into_iter().collect(),
        );

        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.serialize(&merged[0]).unwrap();
        let bytes = writer.into_inner().unwrap();
        let header = String::from_utf8(bytes).unwrap();
        assert!(header.starts_with(
            "name,platform,year,genre,publisher,na_sales,eu_sales,jp_sales,other_sales,\
             global_sales,critic_score,user_score,rating,na_population,eu_population,\
             jp_population,other_population"
        ));
    }
}
