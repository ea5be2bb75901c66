use std::collections::HashSet;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::browser::Record;
use crate::crawler::error::CrawlError;
use crate::crawler::path::NavigationPath;

/// One document reference ready for insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct BookRow {
    pub id: String,
    pub parent_url_id: String,
    pub book_name: Option<String>,
    pub book_number: Option<String>,
    pub book_url: Option<String>,
    pub navigation_path: String,
    pub date_collected: DateTime<Utc>,
    pub is_active: bool,
    pub book_effective_date: Option<NaiveDate>,
    pub book_year: Option<i32>,
}

/// Incremental record sink.
///
/// `save_batch` must look up the keys already stored for this parent within
/// the given navigation-path prefix and insert only the rows whose key is
/// new, atomically, returning the inserted count. Uniqueness is enforced
/// here at the application level; the crawler is the only writer for its
/// parent id.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn save_batch(
        &self,
        table: &str,
        parent_url_id: &str,
        path_prefix: &str,
        rows: Vec<BookRow>,
    ) -> Result<u64, CrawlError>;
}

pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    async fn save_batch(
        &self,
        table: &str,
        parent_url_id: &str,
        path_prefix: &str,
        rows: Vec<BookRow>,
    ) -> Result<u64, CrawlError> {
        // The table name is interpolated, so it must pass the allow-list
        // even though callers validate it at startup.
        validate_table_name(table)?;

        let mut tx = self.pool.begin().await?;

        let select = format!(
            "SELECT book_url FROM {} WHERE parent_url_id = $1 AND navigation_path LIKE $2",
            table
        );
        let existing: Vec<Option<String>> = sqlx::query_scalar(&select)
            .bind(parent_url_id)
            .bind(format!("{}%", path_prefix))
            .fetch_all(&mut *tx)
            .await?;
        let existing: HashSet<String> = existing.into_iter().flatten().collect();

        let new_rows = filter_new_rows(rows, &existing);
        if new_rows.is_empty() {
            debug!("All rows in this batch are already stored");
            return Ok(0);
        }

        let insert = format!(
            "INSERT INTO {} (id, parent_url_id, book_name, book_number, book_url, \
             navigation_path, date_collected, is_active, book_effective_date, book_year) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            table
        );
        for row in &new_rows {
            sqlx::query(&insert)
                .bind(&row.id)
                .bind(&row.parent_url_id)
                .bind(&row.book_name)
                .bind(&row.book_number)
                .bind(&row.book_url)
                .bind(&row.navigation_path)
                .bind(row.date_collected)
                .bind(row.is_active)
                .bind(row.book_effective_date)
                .bind(row.book_year)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(new_rows.len() as u64)
    }
}

/// Drops rows whose key is already stored. Rows without a key are kept; a
/// record the site served without a link is still worth capturing.
pub fn filter_new_rows(rows: Vec<BookRow>, existing: &HashSet<String>) -> Vec<BookRow> {
    rows.into_iter()
        .filter(|row| match &row.book_url {
            Some(url) => !existing.contains(url),
            None => true,
        })
        .collect()
}

static TABLE_NAME_RE: OnceLock<Regex> = OnceLock::new();

/// Destination tables come from the command line and are interpolated into
/// SQL, so anything outside `[A-Za-z0-9_]+` is rejected before any query is
/// built.
pub fn validate_table_name(table: &str) -> Result<(), CrawlError> {
    let re = TABLE_NAME_RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_]+$").unwrap_or_else(|e| panic!("invalid table regex: {}", e))
    });
    if re.is_match(table) {
        Ok(())
    } else {
        Err(CrawlError::Config(format!(
            "invalid destination table name: '{}'",
            table
        )))
    }
}

/// Where and for whom a scraped batch is being stored.
pub struct PersistRequest<'a> {
    pub table: &'a str,
    pub parent_url_id: &'a str,
    pub path: &'a NavigationPath,
    pub page: u32,
    pub key_column: &'a str,
    pub dedup_depth: usize,
}

/// Coerces scraped records into rows and stores the new ones, returning how
/// many were actually inserted.
pub async fn persist_records(
    store: &dyn RecordStore,
    request: &PersistRequest<'_>,
    records: Vec<Record>,
) -> Result<u64, CrawlError> {
    if records.is_empty() {
        return Ok(0);
    }
    validate_table_name(request.table)?;

    let navigation_path = request.path.render_with_page(request.page);
    let rows: Vec<BookRow> = records
        .into_iter()
        .map(|record| coerce_record(record, request, &navigation_path))
        .collect();
    let batch_size = rows.len();

    let prefix = request.path.prefix(request.dedup_depth);
    let inserted = store
        .save_batch(request.table, request.parent_url_id, &prefix, rows)
        .await?;

    info!(
        "Saved {} new records out of {} scraped at {}",
        inserted, batch_size, navigation_path
    );
    Ok(inserted)
}

fn coerce_record(record: Record, request: &PersistRequest<'_>, navigation_path: &str) -> BookRow {
    let field = |name: &str| record.get(name).cloned().flatten();
    BookRow {
        id: Uuid::new_v4().to_string(),
        parent_url_id: request.parent_url_id.to_string(),
        book_name: field("title"),
        book_number: field("number"),
        book_url: field(request.key_column),
        navigation_path: navigation_path.to_string(),
        date_collected: Utc::now(),
        is_active: true,
        book_effective_date: field("effective_date").and_then(|s| parse_effective_date(&s)),
        book_year: field("year").and_then(|s| parse_year(&s)),
    }
}

fn parse_effective_date(raw: &str) -> Option<NaiveDate> {
    match NaiveDate::parse_from_str(raw.trim(), "%d/%m/%Y") {
        Ok(date) => Some(date),
        Err(e) => {
            warn!("Could not parse effective date '{}': {}", raw, e);
            None
        }
    }
}

fn parse_year(raw: &str) -> Option<i32> {
    match raw.trim().parse() {
        Ok(year) => Some(year),
        Err(e) => {
            warn!("Could not parse year '{}': {}", raw, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn sample_row(url: Option<&str>, navigation_path: &str) -> BookRow {
        BookRow {
            id: Uuid::new_v4().to_string(),
            parent_url_id: "parent-1".to_string(),
            book_name: Some("Evidence Act 1958".to_string()),
            book_number: Some("6246".to_string()),
            book_url: url.map(String::from),
            navigation_path: navigation_path.to_string(),
            date_collected: Utc::now(),
            is_active: true,
            book_effective_date: None,
            book_year: None,
        }
    }

    #[test]
    fn rejects_injection_shaped_table_names() {
        assert!(validate_table_name("l1_scan_books_vic").is_ok());
        assert!(validate_table_name("1; DROP TABLE books").is_err());
        assert!(validate_table_name("books; --").is_err());
        assert!(validate_table_name("").is_err());
    }

    #[test]
    fn filter_drops_only_existing_keys() {
        let existing: HashSet<String> = ["https://example.gov.au/act-1".to_string()]
            .into_iter()
            .collect();
        let rows = vec![
            sample_row(Some("https://example.gov.au/act-1"), "Home/x/Page/1"),
            sample_row(Some("https://example.gov.au/act-2"), "Home/x/Page/1"),
            sample_row(None, "Home/x/Page/1"),
        ];
        let kept = filter_new_rows(rows, &existing);
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|r| r.book_url.as_deref() != Some("https://example.gov.au/act-1")));
    }

    #[test]
    fn coercion_degrades_bad_year_and_date_to_null() {
        let mut record = Record::new();
        record.insert("title".to_string(), Some("Evidence Act 1958".to_string()));
        record.insert("link".to_string(), Some("https://example.gov.au/act-1".to_string()));
        record.insert("year".to_string(), Some("not-a-year".to_string()));
        record.insert("effective_date".to_string(), Some("31/02/bad".to_string()));
        let path = NavigationPath::new(["Home", "tas-acts"]);
        let request = PersistRequest {
            table: "l1_scan_books_tas",
            parent_url_id: "parent-1",
            path: &path,
            page: 1,
            key_column: "link",
            dedup_depth: 3,
        };
        let row = coerce_record(record, &request, "Home/tas-acts/Page/1");
        assert_eq!(row.book_name.as_deref(), Some("Evidence Act 1958"));
        assert_eq!(row.book_year, None);
        assert_eq!(row.book_effective_date, None);
        assert_eq!(row.navigation_path, "Home/tas-acts/Page/1");
    }

    #[test]
    fn coercion_parses_valid_year_and_date() {
        let mut record = Record::new();
        record.insert("link".to_string(), Some("https://example.gov.au/act-2".to_string()));
        record.insert("year".to_string(), Some(" 1997 ".to_string()));
        record.insert("effective_date".to_string(), Some("05/03/1997".to_string()));
        let path = NavigationPath::new(["Home", "tas-acts"]);
        let request = PersistRequest {
            table: "l1_scan_books_tas",
            parent_url_id: "parent-1",
            path: &path,
            page: 2,
            key_column: "link",
            dedup_depth: 3,
        };
        let row = coerce_record(record, &request, "Home/tas-acts/Page/2");
        assert_eq!(row.book_year, Some(1997));
        assert_eq!(
            row.book_effective_date,
            NaiveDate::from_ymd_opt(1997, 3, 5)
        );
    }

    /// Store double with the same select-then-filtered-insert semantics as
    /// the Postgres implementation, for exercising `persist_records` end to
    /// end.
    struct InMemoryStore {
        rows: Mutex<HashMap<String, Vec<BookRow>>>,
    }

    impl InMemoryStore {
        fn new() -> Self {
            Self {
                rows: Mutex::new(HashMap::new()),
            }
        }

        fn stored(&self, table: &str) -> Vec<BookRow> {
            self.rows.lock().unwrap().get(table).cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl RecordStore for InMemoryStore {
        async fn save_batch(
            &self,
            table: &str,
            parent_url_id: &str,
            path_prefix: &str,
            rows: Vec<BookRow>,
        ) -> Result<u64, CrawlError> {
            let mut stored = self.rows.lock().unwrap();
            let entries = stored.entry(table.to_string()).or_default();
            let existing: HashSet<String> = entries
                .iter()
                .filter(|r| {
                    r.parent_url_id == parent_url_id
                        && r.navigation_path.starts_with(path_prefix)
                })
                .filter_map(|r| r.book_url.clone())
                .collect();
            let new_rows = filter_new_rows(rows, &existing);
            let inserted = new_rows.len() as u64;
            entries.extend(new_rows);
            Ok(inserted)
        }
    }

    fn scraped(title: &str, link: &str) -> Record {
        let mut record = Record::new();
        record.insert("title".to_string(), Some(title.to_string()));
        record.insert("link".to_string(), Some(link.to_string()));
        record
    }

    #[tokio::test]
    async fn second_identical_run_inserts_nothing() {
        let store = InMemoryStore::new();
        let path = NavigationPath::new(["Home", "In force", "vic-acts"]);
        let request = PersistRequest {
            table: "l1_scan_books_vic",
            parent_url_id: "parent-1",
            path: &path,
            page: 1,
            key_column: "link",
            dedup_depth: 3,
        };
        let batch = || {
            vec![
                scraped("Evidence Act 1958", "https://example.gov.au/act-1"),
                scraped("Wills Act 1997", "https://example.gov.au/act-2"),
            ]
        };

        let first = persist_records(&store, &request, batch()).await.unwrap();
        assert_eq!(first, 2);
        let second = persist_records(&store, &request, batch()).await.unwrap();
        assert_eq!(second, 0);
        assert_eq!(store.stored("l1_scan_books_vic").len(), 2);
    }

    #[tokio::test]
    async fn batch_with_one_known_key_inserts_the_rest() {
        let store = InMemoryStore::new();
        let path = NavigationPath::new(["Home", "In force", "vic-acts"]);
        let request = PersistRequest {
            table: "l1_scan_books_vic",
            parent_url_id: "parent-1",
            path: &path,
            page: 1,
            key_column: "link",
            dedup_depth: 3,
        };
        persist_records(
            &store,
            &request,
            vec![scraped("Evidence Act 1958", "https://example.gov.au/act-1")],
        )
        .await
        .unwrap();

        let inserted = persist_records(
            &store,
            &request,
            vec![
                scraped("Evidence Act 1958", "https://example.gov.au/act-1"),
                scraped("Wills Act 1997", "https://example.gov.au/act-2"),
                scraped("Water Act 1989", "https://example.gov.au/act-3"),
            ],
        )
        .await
        .unwrap();
        assert_eq!(inserted, 2);
    }

    #[tokio::test]
    async fn different_path_prefixes_do_not_dedup_against_each_other() {
        let store = InMemoryStore::new();
        let in_force = NavigationPath::new(["Home", "In force", "vic-acts"]);
        let repealed = NavigationPath::new(["Home", "Repealed", "vic-acts"]);
        let request = |path| PersistRequest {
            table: "l1_scan_books_vic",
            parent_url_id: "parent-1",
            path,
            page: 1,
            key_column: "link",
            dedup_depth: 3,
        };

        let first = persist_records(
            &store,
            &request(&in_force),
            vec![scraped("Evidence Act 1958", "https://example.gov.au/act-1")],
        )
        .await
        .unwrap();
        let second = persist_records(
            &store,
            &request(&repealed),
            vec![scraped("Evidence Act 1958", "https://example.gov.au/act-1")],
        )
        .await
        .unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 1);
    }

    #[tokio::test]
    async fn save_batch_receives_depth_bounded_prefix() {
        let mut mock = MockRecordStore::new();
        mock.expect_save_batch()
            .withf(|table, parent, prefix, rows| {
                table == "l1_scan_books_qld"
                    && parent == "parent-9"
                    && prefix == "Home/In force/qld-acts"
                    && rows.len() == 1
            })
            .return_once(|_, _, _, _| Ok(1));

        let path = NavigationPath::new(["Home", "In force", "qld-acts", "Letter-B"]);
        let request = PersistRequest {
            table: "l1_scan_books_qld",
            parent_url_id: "parent-9",
            path: &path,
            page: 4,
            key_column: "link",
            dedup_depth: 3,
        };
        let inserted = persist_records(
            &mock,
            &request,
            vec![scraped("Bail Act 1980", "https://example.gov.au/act-4")],
        )
        .await
        .unwrap();
        assert_eq!(inserted, 1);
    }

    #[tokio::test]
    async fn empty_batch_skips_the_store() {
        let mock = MockRecordStore::new();
        let path = NavigationPath::new(["Home", "vic-acts"]);
        let request = PersistRequest {
            table: "l1_scan_books_vic",
            parent_url_id: "parent-1",
            path: &path,
            page: 1,
            key_column: "link",
            dedup_depth: 3,
        };
        let inserted = persist_records(&mock, &request, Vec::new()).await.unwrap();
        assert_eq!(inserted, 0);
    }
}
