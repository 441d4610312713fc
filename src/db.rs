use std::path::Path;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, Row};
use serde::Serialize;

/// The parent directory must already exist.
pub fn connect(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(conn)
}

/// `external_id` is indexed but not unique: the fallback save path appends,
/// and readers collapse duplicates by recency.
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS listings (
            id                 INTEGER PRIMARY KEY,
            external_id        TEXT NOT NULL,
            title              TEXT,
            url                TEXT,
            latitude           REAL,
            longitude          REAL,
            location_type      TEXT,
            num_places         INTEGER,
            total_reviews      INTEGER,
            avg_rating         REAL,
            parking_min_eur    REAL,
            parking_max_eur    REAL,
            electricity_eur    REAL,
            review_seasonality TEXT,
            top_languages      TEXT,
            ai_pros            TEXT,
            ai_cons            TEXT,
            last_fetched       TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_listings_external_id ON listings(external_id);
        ",
    )?;
    Ok(())
}

// ── Records ──

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListingRecord {
    pub external_id: String,
    pub title: String,
    pub url: String,
    pub latitude: f64,
    pub longitude: f64,
    pub location_type: String,
    pub num_places: Option<u32>,
    pub total_reviews: u32,
    pub avg_rating: f64,
    pub parking_min_eur: Option<f64>,
    pub parking_max_eur: Option<f64>,
    pub electricity_eur: Option<f64>,
    pub review_seasonality: String,
    pub top_languages: String,
    pub ai_pros: String,
    pub ai_cons: String,
    pub last_fetched: Option<DateTime<Utc>>,
}

impl ListingRecord {
    /// 0,0 means the page had no usable coordinates.
    pub fn has_coordinates(&self) -> bool {
        !(self.latitude == 0.0 && self.longitude == 0.0)
    }
}

/// Trimmed natural key; empty and `nan` keys are unusable.
pub fn normalize_key(raw: &str) -> Option<String> {
    let key = raw.trim();
    if key.is_empty() || key.eq_ignore_ascii_case("nan") {
        None
    } else {
        Some(key.to_string())
    }
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// RFC 3339 first, then the plain `YYYY-MM-DD HH:MM:SS` form (read as UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

// ── Reads ──

const SELECT_COLUMNS: &str = "external_id, title, url, latitude, longitude, location_type,
     num_places, total_reviews, avg_rating, parking_min_eur, parking_max_eur,
     electricity_eur, review_seasonality, top_languages, ai_pros, ai_cons, last_fetched";

/// Every stored row, in insertion order. Cells are read leniently: a value
/// of the wrong type degrades to its default instead of failing the load.
pub fn load_listings(conn: &Connection) -> rusqlite::Result<Vec<ListingRecord>> {
    let sql = format!("SELECT {} FROM listings ORDER BY id", SELECT_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ListingRecord {
                external_id: text_at(row, 0)?.unwrap_or_default(),
                title: text_at(row, 1)?.unwrap_or_default(),
                url: text_at(row, 2)?.unwrap_or_default(),
                latitude: real_at(row, 3)?.unwrap_or(0.0),
                longitude: real_at(row, 4)?.unwrap_or(0.0),
                location_type: text_at(row, 5)?.unwrap_or_else(|| "Unknown".into()),
                num_places: int_at(row, 6)?.and_then(|v| u32::try_from(v).ok()),
                total_reviews: int_at(row, 7)?.and_then(|v| u32::try_from(v).ok()).unwrap_or(0),
                avg_rating: real_at(row, 8)?.unwrap_or(0.0),
                parking_min_eur: real_at(row, 9)?,
                parking_max_eur: real_at(row, 10)?,
                electricity_eur: real_at(row, 11)?,
                review_seasonality: text_at(row, 12)?.unwrap_or_else(|| "{}".into()),
                top_languages: text_at(row, 13)?.unwrap_or_default(),
                ai_pros: text_at(row, 14)?.unwrap_or_default(),
                ai_cons: text_at(row, 15)?.unwrap_or_default(),
                last_fetched: text_at(row, 16)?.as_deref().and_then(parse_timestamp),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn text_at(row: &Row, idx: usize) -> rusqlite::Result<Option<String>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) if f.fract() == 0.0 && f.abs() < 1e15 => Some((f as i64).to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) | ValueRef::Blob(t) => Some(String::from_utf8_lossy(t).into_owned()),
    })
}

fn real_at(row: &Row, idx: usize) -> rusqlite::Result<Option<f64>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Integer(i) => Some(i as f64),
        ValueRef::Real(f) => Some(f),
        ValueRef::Text(t) => std::str::from_utf8(t)
            .ok()
            .and_then(|s| s.trim().parse::<f64>().ok())
            .filter(|f| f.is_finite()),
        _ => None,
    })
}

fn int_at(row: &Row, idx: usize) -> rusqlite::Result<Option<i64>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Integer(i) => Some(i),
        ValueRef::Real(f) if f.is_finite() => Some(f as i64),
        ValueRef::Text(t) => std::str::from_utf8(t)
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok()),
        _ => None,
    })
}

// ── Writes ──

const INSERT_SQL: &str = "INSERT INTO listings
     (external_id, title, url, latitude, longitude, location_type, num_places,
      total_reviews, avg_rating, parking_min_eur, parking_max_eur, electricity_eur,
      review_seasonality, top_languages, ai_pros, ai_cons, last_fetched)
     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)";

/// Swap the whole table for `rows` in one transaction.
pub fn replace_listings(conn: &Connection, rows: &[ListingRecord]) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM listings", [])?;
    insert_all(&tx, rows)?;
    tx.commit()
}

pub fn append_listings(conn: &Connection, rows: &[ListingRecord]) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    insert_all(&tx, rows)?;
    tx.commit()
}

fn insert_all(conn: &Connection, rows: &[ListingRecord]) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(INSERT_SQL)?;
    for r in rows {
        stmt.execute(rusqlite::params![
            r.external_id,
            r.title,
            r.url,
            r.latitude,
            r.longitude,
            r.location_type,
            r.num_places,
            r.total_reviews,
            r.avg_rating,
            r.parking_min_eur,
            r.parking_max_eur,
            r.electricity_eur,
            r.review_seasonality,
            r.top_languages,
            r.ai_pros,
            r.ai_cons,
            r.last_fetched.as_ref().map(format_timestamp),
        ])?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_record(id: &str, title: &str, last_fetched: Option<DateTime<Utc>>) -> ListingRecord {
    ListingRecord {
        external_id: id.to_string(),
        title: title.to_string(),
        url: format!("https://park4night.com/en/place/{}", id),
        latitude: 38.7,
        longitude: -9.1,
        location_type: "Parking".into(),
        num_places: Some(10),
        total_reviews: 12,
        avg_rating: 4.2,
        parking_min_eur: Some(0.0),
        parking_max_eur: Some(8.0),
        electricity_eur: None,
        review_seasonality: "{}".into(),
        top_languages: "German (3)".into(),
        ai_pros: "quiet (4)".into(),
        ai_cons: String::new(),
        last_fetched,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn memory_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn replace_then_load_keeps_fields() {
        let conn = memory_db();
        let ts = Utc.with_ymd_and_hms(2026, 1, 1, 8, 30, 0).unwrap();
        let rec = test_record("100", "Praia", Some(ts));
        replace_listings(&conn, &[rec.clone()]).unwrap();
        replace_listings(&conn, &[rec.clone()]).unwrap();

        let rows = load_listings(&conn).unwrap();
        assert_eq!(rows, vec![rec]);
    }

    #[test]
    fn lenient_read_of_foreign_rows() {
        let conn = memory_db();
        conn.execute(
            "INSERT INTO listings (external_id, title, latitude, total_reviews, last_fetched)
             VALUES (600, 'int-id', 'not a number', '17', 'yesterday-ish')",
            [],
        )
        .unwrap();

        let rows = load_listings(&conn).unwrap();
        assert_eq!(rows[0].external_id, "600");
        assert_eq!(rows[0].latitude, 0.0);
        assert_eq!(rows[0].total_reviews, 17);
        assert_eq!(rows[0].location_type, "Unknown");
        assert!(rows[0].last_fetched.is_none());
    }

    #[test]
    fn timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2026, 1, 22, 12, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2026-01-22 12:00:00"), Some(expected));
        assert_eq!(parse_timestamp("2026-01-22T12:00:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2026-01-22T13:00:00+01:00"), Some(expected));
        assert_eq!(parse_timestamp(&format_timestamp(&expected)), Some(expected));
        assert_eq!(parse_timestamp("NaT"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn key_normalization() {
        assert_eq!(normalize_key("  500 "), Some("500".to_string()));
        assert_eq!(normalize_key("nan"), None);
        assert_eq!(normalize_key("   "), None);
    }
}
