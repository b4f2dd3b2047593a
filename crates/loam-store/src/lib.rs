//! Tabular store adapter: keyed record operations over a shared spreadsheet-
//! style grid that offers no locking and no atomic read-modify-write.
//!
//! The grid backend is a seam (`RowGrid`); the HTTP implementation talks to a
//! values-API-shaped REST endpoint, and the in-memory implementation backs
//! tests and local runs. Swapping in a real transactional store only requires
//! another `RowGrid`.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use loam_core::{normalize_website_key, Prospect, TRACKING_COLUMNS};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "loam-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store header shares no columns with the incoming records")]
    NoCommonColumns,
    #[error("store header has no '{0}' column to key on")]
    MissingKeyColumn(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// A single-cell write, addressed by 0-based grid coordinates. Row 0 is the
/// header row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellWrite {
    pub row: usize,
    pub col: usize,
    pub value: String,
}

/// Minimal contract the shared grid must provide. Every operation is one
/// round trip; the backend is assumed atomic per request, not across them.
#[async_trait]
pub trait RowGrid: Send + Sync {
    async fn read_all(&self) -> anyhow::Result<Vec<Vec<String>>>;
    async fn append_rows(&self, rows: Vec<Vec<String>>) -> anyhow::Result<()>;
    async fn update_cells(&self, writes: Vec<CellWrite>) -> anyhow::Result<()>;
    async fn overwrite(&self, rows: Vec<Vec<String>>) -> anyhow::Result<()>;
}

/// Grid held in process memory. Used by tests and by dry runs.
#[derive(Debug, Default)]
pub struct InMemoryGrid {
    rows: Mutex<Vec<Vec<String>>>,
}

impl InMemoryGrid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<Vec<String>>) -> Self {
        Self {
            rows: Mutex::new(rows),
        }
    }

    pub async fn snapshot(&self) -> Vec<Vec<String>> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl RowGrid for InMemoryGrid {
    async fn read_all(&self) -> anyhow::Result<Vec<Vec<String>>> {
        Ok(self.rows.lock().await.clone())
    }

    async fn append_rows(&self, rows: Vec<Vec<String>>) -> anyhow::Result<()> {
        self.rows.lock().await.extend(rows);
        Ok(())
    }

    async fn update_cells(&self, writes: Vec<CellWrite>) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().await;
        for write in writes {
            let row = rows
                .get_mut(write.row)
                .with_context(|| format!("cell write past end of grid: row {}", write.row))?;
            if row.len() <= write.col {
                row.resize(write.col + 1, String::new());
            }
            row[write.col] = write.value;
        }
        Ok(())
    }

    async fn overwrite(&self, rows: Vec<Vec<String>>) -> anyhow::Result<()> {
        *self.rows.lock().await = rows;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpGridConfig {
    pub base_url: String,
    pub api_token: String,
    pub timeout: Duration,
}

impl HttpGridConfig {
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_token: api_token.into(),
            timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ValuesBody {
    values: Vec<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct BatchUpdateBody {
    data: Vec<CellWrite>,
}

/// Grid backed by a values-style REST API: full-range reads, row appends,
/// targeted cell batches, and a clear-then-write overwrite.
#[derive(Debug, Clone)]
pub struct HttpGrid {
    client: reqwest::Client,
    config: HttpGridConfig,
}

impl HttpGrid {
    pub fn new(config: HttpGridConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building grid HTTP client")?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, suffix: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), suffix)
    }
}

#[async_trait]
impl RowGrid for HttpGrid {
    async fn read_all(&self) -> anyhow::Result<Vec<Vec<String>>> {
        let body: ValuesBody = self
            .client
            .get(self.endpoint("values"))
            .bearer_auth(&self.config.api_token)
            .send()
            .await
            .context("fetching grid values")?
            .error_for_status()
            .context("grid read rejected")?
            .json()
            .await
            .context("decoding grid values")?;
        Ok(body.values)
    }

    async fn append_rows(&self, rows: Vec<Vec<String>>) -> anyhow::Result<()> {
        self.client
            .post(self.endpoint("values:append"))
            .bearer_auth(&self.config.api_token)
            .json(&ValuesBody { values: rows })
            .send()
            .await
            .context("appending grid rows")?
            .error_for_status()
            .context("grid append rejected")?;
        Ok(())
    }

    async fn update_cells(&self, writes: Vec<CellWrite>) -> anyhow::Result<()> {
        self.client
            .post(self.endpoint("values:batchUpdate"))
            .bearer_auth(&self.config.api_token)
            .json(&BatchUpdateBody { data: writes })
            .send()
            .await
            .context("updating grid cells")?
            .error_for_status()
            .context("grid cell update rejected")?;
        Ok(())
    }

    async fn overwrite(&self, rows: Vec<Vec<String>>) -> anyhow::Result<()> {
        self.client
            .post(self.endpoint("values:clear"))
            .bearer_auth(&self.config.api_token)
            .send()
            .await
            .context("clearing grid")?
            .error_for_status()
            .context("grid clear rejected")?;
        self.client
            .post(self.endpoint("values:append"))
            .bearer_auth(&self.config.api_token)
            .json(&ValuesBody { values: rows })
            .send()
            .await
            .context("rewriting grid")?
            .error_for_status()
            .context("grid rewrite rejected")?;
        Ok(())
    }
}

/// Header plus data rows, read in one round trip.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl StoreSnapshot {
    pub fn is_empty(&self) -> bool {
        self.header.is_empty()
    }

    fn column(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|c| c == name)
    }
}

/// Outcome of one `bulk_update` round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkUpdateOutcome {
    pub matched_rows: usize,
    pub cells_written: usize,
    pub unmatched_keys: Vec<String>,
}

/// Keyed field updates: primary key -> (column -> absolute value).
pub type KeyedUpdates = BTreeMap<String, BTreeMap<String, String>>;

/// The prospect-level adapter over a `RowGrid`.
///
/// `append` and `bulk_update` touch only their own rows and cells and are safe
/// to interleave with each other. `clear_and_rewrite` replaces the whole grid
/// and loses concurrent writes; it must only run from maintenance jobs with
/// external mutual exclusion.
#[derive(Clone)]
pub struct ProspectStore {
    grid: Arc<dyn RowGrid>,
}

impl ProspectStore {
    pub fn new(grid: Arc<dyn RowGrid>) -> Self {
        Self { grid }
    }

    pub async fn read_snapshot(&self) -> Result<StoreSnapshot, StoreError> {
        let mut rows = self.grid.read_all().await?;
        if rows.is_empty() {
            return Ok(StoreSnapshot::default());
        }
        let header = rows.remove(0);
        Ok(StoreSnapshot { header, rows })
    }

    /// All records, in store row order. Short rows are padded and long rows
    /// truncated; corrupt rows never fail the read.
    pub async fn fetch_all(&self) -> Result<Vec<Prospect>, StoreError> {
        let snapshot = self.read_snapshot().await?;
        Ok(snapshot
            .rows
            .iter()
            .map(|cells| Prospect::from_row(&snapshot.header, cells))
            .collect())
    }

    /// Normalized primary keys currently in the store, for duplicate checks.
    pub async fn existing_keys(&self) -> Result<HashSet<String>, StoreError> {
        let snapshot = self.read_snapshot().await?;
        let Some(key_col) = snapshot.column(loam_core::col::WEBSITE) else {
            return Ok(HashSet::new());
        };
        Ok(snapshot
            .rows
            .iter()
            .filter_map(|row| row.get(key_col))
            .map(|raw| normalize_website_key(raw))
            .filter(|key| !key.is_empty())
            .collect())
    }

    /// Add any canonical tracking columns the header is missing. Returns how
    /// many were added.
    pub async fn ensure_columns(&self) -> Result<usize, StoreError> {
        let snapshot = self.read_snapshot().await?;
        if snapshot.is_empty() {
            let header = TRACKING_COLUMNS.iter().map(|c| c.to_string()).collect();
            self.grid.append_rows(vec![header]).await?;
            return Ok(TRACKING_COLUMNS.len());
        }
        let missing: Vec<&str> = TRACKING_COLUMNS
            .iter()
            .copied()
            .filter(|c| snapshot.column(c).is_none())
            .collect();
        if missing.is_empty() {
            return Ok(0);
        }
        debug!(columns = ?missing, "adding missing tracking columns");
        let writes = missing
            .iter()
            .enumerate()
            .map(|(offset, column)| CellWrite {
                row: 0,
                col: snapshot.header.len() + offset,
                value: column.to_string(),
            })
            .collect();
        self.grid.update_cells(writes).await?;
        Ok(missing.len())
    }

    /// Append records to the end of the store, aligned to the existing header
    /// order. Unknown incoming fields are dropped and store columns the
    /// records lack come out empty. An empty store gets the canonical header
    /// first.
    pub async fn append(&self, prospects: &[Prospect]) -> Result<usize, StoreError> {
        if prospects.is_empty() {
            return Ok(0);
        }
        let snapshot = self.read_snapshot().await?;
        let header: Vec<String> = if snapshot.is_empty() {
            let header: Vec<String> = TRACKING_COLUMNS.iter().map(|c| c.to_string()).collect();
            self.grid.append_rows(vec![header.clone()]).await?;
            header
        } else {
            if !snapshot
                .header
                .iter()
                .any(|c| TRACKING_COLUMNS.contains(&c.as_str()))
            {
                return Err(StoreError::NoCommonColumns);
            }
            snapshot.header
        };
        let rows: Vec<Vec<String>> = prospects.iter().map(|p| p.to_row(&header)).collect();
        let count = rows.len();
        self.grid.append_rows(rows).await?;
        Ok(count)
    }

    /// Apply keyed field updates in a single write round trip. The table is
    /// re-read immediately before writing so row coordinates come from one
    /// consistent snapshot, and only the touched cells are written. Keys with
    /// no matching row are reported, not errors.
    pub async fn bulk_update(
        &self,
        updates: &KeyedUpdates,
    ) -> Result<BulkUpdateOutcome, StoreError> {
        if updates.is_empty() {
            return Ok(BulkUpdateOutcome::default());
        }
        let snapshot = self.read_snapshot().await?;
        let key_col = snapshot
            .column(loam_core::col::WEBSITE)
            .ok_or_else(|| StoreError::MissingKeyColumn(loam_core::col::WEBSITE.to_string()))?;

        let mut writes = Vec::new();
        let mut matched: HashSet<String> = HashSet::new();
        for (row_index, row) in snapshot.rows.iter().enumerate() {
            let key = normalize_website_key(row.get(key_col).map(String::as_str).unwrap_or(""));
            let Some(fields) = updates.get(&key) else {
                continue;
            };
            matched.insert(key.clone());
            for (field, value) in fields {
                let Some(col) = snapshot.column(field) else {
                    warn!(field, key, "update targets a column the store lacks; skipping");
                    continue;
                };
                writes.push(CellWrite {
                    // +1 for the header row the snapshot peeled off.
                    row: row_index + 1,
                    col,
                    value: value.clone(),
                });
            }
        }

        let unmatched_keys: Vec<String> = updates
            .keys()
            .filter(|k| !matched.contains(k.as_str()))
            .cloned()
            .collect();
        if !unmatched_keys.is_empty() {
            warn!(keys = ?unmatched_keys, "bulk update keys matched no store row");
        }

        let outcome = BulkUpdateOutcome {
            matched_rows: matched.len(),
            cells_written: writes.len(),
            unmatched_keys,
        };
        if !writes.is_empty() {
            self.grid.update_cells(writes).await?;
        }
        Ok(outcome)
    }

    /// Replace the store's entire content. Unsafe under concurrent writers;
    /// reserved for deduplication and backfill maintenance.
    pub async fn clear_and_rewrite(
        &self,
        header: &[String],
        prospects: &[Prospect],
    ) -> Result<(), StoreError> {
        let mut rows = Vec::with_capacity(prospects.len() + 1);
        rows.push(header.to_vec());
        rows.extend(prospects.iter().map(|p| p.to_row(header)));
        self.grid.overwrite(rows).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loam_core::col;

    fn header() -> Vec<String> {
        vec![
            col::NAME.into(),
            col::WEBSITE.into(),
            col::SUBJECT.into(),
            col::SENT_DATE.into(),
            col::LAST_CONTACT_DATE.into(),
        ]
    }

    fn store_with(rows: Vec<Vec<String>>) -> (ProspectStore, Arc<InMemoryGrid>) {
        let grid = Arc::new(InMemoryGrid::with_rows(rows));
        (ProspectStore::new(grid.clone()), grid)
    }

    #[tokio::test]
    async fn fetch_all_tolerates_short_and_long_rows() {
        let (store, _grid) = store_with(vec![
            header(),
            vec!["Acme".into()],
            vec![
                "Beta".into(),
                "beta.com".into(),
                "Hi".into(),
                "".into(),
                "".into(),
                "overflow".into(),
            ],
        ]);
        let prospects = store.fetch_all().await.unwrap();
        assert_eq!(prospects.len(), 2);
        assert_eq!(prospects[0].name, "Acme");
        assert_eq!(prospects[0].website, "");
        assert_eq!(prospects[1].subject, "Hi");
    }

    #[tokio::test]
    async fn append_aligns_to_existing_header_order() {
        let (store, grid) = store_with(vec![vec![
            col::WEBSITE.into(),
            col::NAME.into(),
            "operator_notes".into(),
        ]]);
        let mut p = Prospect::default();
        p.name = "Acme".into();
        p.website = "acme.com".into();
        p.subject = "dropped because the store has no subject column".into();
        store.append(&[p]).await.unwrap();

        let rows = grid.snapshot().await;
        assert_eq!(rows[1], vec!["acme.com", "Acme", ""]);
    }

    #[tokio::test]
    async fn append_to_empty_store_writes_canonical_header() {
        let (store, grid) = store_with(Vec::new());
        let mut p = Prospect::default();
        p.website = "acme.com".into();
        store.append(&[p]).await.unwrap();

        let rows = grid.snapshot().await;
        assert_eq!(rows[0].len(), TRACKING_COLUMNS.len());
        assert_eq!(rows[0][0], col::NAME);
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn append_fails_loudly_on_disjoint_headers() {
        let (store, _grid) = store_with(vec![vec!["foo".into(), "bar".into()]]);
        let err = store.append(&[Prospect::default()]).await.unwrap_err();
        assert!(matches!(err, StoreError::NoCommonColumns));
    }

    #[tokio::test]
    async fn bulk_update_writes_only_touched_cells_by_key() {
        let (store, grid) = store_with(vec![
            header(),
            vec!["Acme".into(), "https://www.acme.com/".into(), "s".into(), "".into(), "".into()],
            vec!["Beta".into(), "beta.com".into(), "s".into(), "".into(), "".into()],
        ]);
        let mut updates: KeyedUpdates = BTreeMap::new();
        updates.insert(
            "acme.com".into(),
            BTreeMap::from([
                (col::SENT_DATE.to_string(), "2024-01-01 08:00:00".to_string()),
                (
                    col::LAST_CONTACT_DATE.to_string(),
                    "2024-01-01 08:00:00".to_string(),
                ),
            ]),
        );
        updates.insert("missing.com".into(), BTreeMap::new());

        let outcome = store.bulk_update(&updates).await.unwrap();
        assert_eq!(outcome.matched_rows, 1);
        assert_eq!(outcome.cells_written, 2);
        assert_eq!(outcome.unmatched_keys, vec!["missing.com".to_string()]);

        let rows = grid.snapshot().await;
        assert_eq!(rows[1][3], "2024-01-01 08:00:00");
        assert_eq!(rows[1][4], "2024-01-01 08:00:00");
        // The other row is untouched.
        assert_eq!(rows[2][3], "");
    }

    #[tokio::test]
    async fn bulk_update_is_idempotent() {
        let (store, grid) = store_with(vec![
            header(),
            vec!["Acme".into(), "acme.com".into(), "s".into(), "".into(), "".into()],
        ]);
        let mut updates: KeyedUpdates = BTreeMap::new();
        updates.insert(
            "acme.com".into(),
            BTreeMap::from([(col::SENT_DATE.to_string(), "2024-01-01 08:00:00".to_string())]),
        );
        store.bulk_update(&updates).await.unwrap();
        let first = grid.snapshot().await;
        store.bulk_update(&updates).await.unwrap();
        assert_eq!(grid.snapshot().await, first);
    }

    #[tokio::test]
    async fn ensure_columns_extends_header_in_place() {
        let (store, grid) = store_with(vec![
            vec![col::NAME.into(), col::WEBSITE.into()],
            vec!["Acme".into(), "acme.com".into()],
        ]);
        let added = store.ensure_columns().await.unwrap();
        assert_eq!(added, TRACKING_COLUMNS.len() - 2);
        let rows = grid.snapshot().await;
        assert_eq!(rows[0].len(), TRACKING_COLUMNS.len());
        // Existing data rows are not rewritten; reads pad them.
        assert_eq!(rows[1].len(), 2);
    }

    #[tokio::test]
    async fn existing_keys_are_normalized() {
        let (store, _grid) = store_with(vec![
            header(),
            vec!["Acme".into(), "https://WWW.Acme.com/".into(), "".into(), "".into(), "".into()],
        ]);
        let keys = store.existing_keys().await.unwrap();
        assert!(keys.contains("acme.com"));
    }
}
