// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sled-backed storage for test cases and their captured traffic.
//!
//! Every test case is one JSON document in the [`TRAFFIC_TREE`] tree, keyed
//! by its traffic id. Documents carry a sequence number taken from
//! [`sled::Db::generate_id`] so selects return them in load order.

use std::fs;
use std::path::{Path, PathBuf};

use ftw_correlator::query::{Database, Field, NewRequest, Query, QueryError, QueryResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sled::{Config as SledConfig, Db, Tree};
use thiserror::Error;
use tracing::debug;

/// Tree holding one [`TrafficRow`] per test case.
pub const TRAFFIC_TREE: &str = "traffic";

/// Columns of [`Query::SelectResults`].
pub const RESULT_COLUMNS: [&str; 6] = [
    "traffic_id",
    "test_title",
    "output",
    "raw_request",
    "raw_response",
    "raw_log",
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid title filter: {0}")]
    Filter(#[from] regex::Error),
}

impl From<StoreError> for QueryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Filter(e) => QueryError::Invalid(e.to_string()),
            other => QueryError::Backend(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficRow {
    pub seq: u64,
    pub traffic_id: String,
    pub test_title: String,
    pub meta: String,
    pub file: String,
    pub input: String,
    pub output: String,
    pub request: Vec<u8>,
    pub raw_request: Option<Vec<u8>>,
    pub raw_response: Option<Vec<u8>>,
    pub raw_log: Option<String>,
    pub testing_result: Option<bool>,
    /// Seconds between the first request byte and the first response byte.
    pub duration: Option<f64>,
}

impl TrafficRow {
    fn clean_raw_data(&mut self) {
        self.raw_request = None;
        self.raw_response = None;
        self.raw_log = None;
        self.testing_result = None;
        self.duration = None;
    }
}

#[derive(Debug, Clone)]
pub struct TrafficStore {
    db: Db,
    tree: Tree,
    path: PathBuf,
}

impl TrafficStore {
    /// Opens (or creates) a persistent store at `path`.
    ///
    /// # Errors
    ///
    /// Fails when the parent directory cannot be created or sled cannot open
    /// the database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                // sled does not create intermediate directories
                fs::create_dir_all(parent)?;
            }
        }
        let db = SledConfig::new().path(&path).open()?;
        let tree = db.open_tree(TRAFFIC_TREE)?;
        debug!("Opened traffic store at {}", path.display());
        Ok(Self { db, tree, path })
    }

    /// Opens a store that disappears when dropped.
    ///
    /// # Errors
    ///
    /// Fails when sled cannot create its temporary database.
    pub fn open_ephemeral() -> Result<Self, StoreError> {
        let db = SledConfig::new().temporary(true).open()?;
        let tree = db.open_tree(TRAFFIC_TREE)?;
        Ok(Self {
            db,
            tree,
            path: PathBuf::new(),
        })
    }

    /// Location on disk; empty for ephemeral stores.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// # Errors
    ///
    /// Propagates sled flush failures.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Stores a freshly loaded test case, replacing any row with the same id.
    ///
    /// # Errors
    ///
    /// Fails on sled or serialization errors.
    pub fn insert(&self, request: &NewRequest) -> Result<(), StoreError> {
        let row = TrafficRow {
            seq: self.db.generate_id()?,
            traffic_id: request.traffic_id.clone(),
            test_title: request.test_title.clone(),
            meta: request.meta.clone(),
            file: request.file.clone(),
            input: request.input.clone(),
            output: request.output.clone(),
            request: request.request.clone(),
            raw_request: None,
            raw_response: None,
            raw_log: None,
            testing_result: None,
            duration: None,
        };
        self.put(&row)
    }

    /// # Errors
    ///
    /// Fails on sled or deserialization errors.
    pub fn row(&self, traffic_id: &str) -> Result<Option<TrafficRow>, StoreError> {
        self.tree
            .get(traffic_id.as_bytes())?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(StoreError::from))
            .transpose()
    }

    /// Every row in load order.
    ///
    /// # Errors
    ///
    /// Fails on sled or deserialization errors.
    pub fn rows(&self) -> Result<Vec<TrafficRow>, StoreError> {
        let mut rows = self
            .tree
            .iter()
            .values()
            .map(|value| -> Result<TrafficRow, StoreError> {
                Ok(serde_json::from_slice(&value?)?)
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        rows.sort_by_key(|row| row.seq);
        Ok(rows)
    }

    /// Runs `query` to completion.
    ///
    /// # Errors
    ///
    /// Fails on storage errors or when a title filter is not a valid regex.
    pub fn execute(&self, query: &Query) -> Result<QueryResult, StoreError> {
        match query {
            Query::InsertRequest(request) => {
                self.insert(request)?;
                Ok(QueryResult::affected(1))
            }
            Query::SelectRequests { title } => {
                let filter = title.as_deref().map(Regex::new).transpose()?;
                let rows = self
                    .rows()?
                    .into_iter()
                    .filter(|row| filter.as_ref().map_or(true, |f| f.is_match(&row.test_title)))
                    .map(|row| vec![Field::Text(row.traffic_id), Field::Bytes(row.request)])
                    .collect();
                Ok(QueryResult::with_rows(&["traffic_id", "request"], rows))
            }
            Query::CleanRawData => {
                let rows = self.rows()?;
                for mut row in rows.iter().cloned() {
                    row.clean_raw_data();
                    self.put(&row)?;
                }
                Ok(QueryResult::affected(rows.len()))
            }
            Query::UpdateRawTraffic {
                traffic_id,
                raw_request,
                raw_response,
                duration,
            } => self.update(traffic_id, |row| {
                row.raw_request = Some(raw_request.clone());
                row.raw_response = Some(raw_response.clone());
                row.duration = duration.map(|d| d.as_secs_f64());
            }),
            Query::UpdateLog { traffic_id, raw_log } => self.update(traffic_id, |row| {
                row.raw_log = Some(raw_log.clone());
            }),
            Query::UpdateTestingResult { traffic_id, passed } => {
                self.update(traffic_id, |row| row.testing_result = Some(*passed))
            }
            Query::SelectResults => {
                let rows = self
                    .rows()?
                    .into_iter()
                    .map(|row| {
                        vec![
                            Field::Text(row.traffic_id),
                            Field::Text(row.test_title),
                            Field::Text(row.output),
                            Field::from(row.raw_request),
                            Field::from(row.raw_response),
                            Field::from(row.raw_log),
                        ]
                    })
                    .collect();
                Ok(QueryResult::with_rows(&RESULT_COLUMNS, rows))
            }
            Query::SelectTestTitle { traffic_id } => {
                let rows = self
                    .row(traffic_id)?
                    .map(|row| vec![Field::Text(row.test_title)])
                    .into_iter()
                    .collect();
                Ok(QueryResult::with_rows(&["test_title"], rows))
            }
            Query::CountRequests => {
                let count = i64::try_from(self.tree.len()).unwrap_or(i64::MAX);
                Ok(QueryResult::with_rows(&["count"], vec![vec![Field::Int(count)]]))
            }
        }
    }

    fn put(&self, row: &TrafficRow) -> Result<(), StoreError> {
        self.tree
            .insert(row.traffic_id.as_bytes(), serde_json::to_vec(row)?)?;
        Ok(())
    }

    fn update<F>(&self, traffic_id: &str, apply: F) -> Result<QueryResult, StoreError>
    where
        F: FnOnce(&mut TrafficRow),
    {
        let Some(mut row) = self.row(traffic_id)? else {
            return Ok(QueryResult::affected(0));
        };
        apply(&mut row);
        self.put(&row)?;
        Ok(QueryResult::affected(1))
    }
}

impl Database for TrafficStore {
    fn query(&self, query: &Query) -> Result<QueryResult, QueryError> {
        Ok(self.execute(query)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn request(traffic_id: &str, title: &str) -> NewRequest {
        NewRequest {
            traffic_id: traffic_id.to_string(),
            test_title: title.to_string(),
            meta: "{}".to_string(),
            file: "rules/920100.yaml".to_string(),
            input: "{}".to_string(),
            output: r#"{"status":403}"#.to_string(),
            request: format!("GET /{traffic_id} HTTP/1.1\r\n\r\n").into_bytes(),
        }
    }

    #[test]
    fn test_rows_keep_load_order() {
        let store = TrafficStore::open_ephemeral().unwrap();
        for (id, title) in [("c", "920100-1"), ("a", "920100-2"), ("b", "942100-1")] {
            store.insert(&request(id, title)).unwrap();
        }
        let ids: Vec<String> = store.rows().unwrap().into_iter().map(|r| r.traffic_id).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_select_requests_filters_titles() {
        let store = TrafficStore::open_ephemeral().unwrap();
        store.insert(&request("a", "920100-1")).unwrap();
        store.insert(&request("b", "942100-1")).unwrap();

        let result = store
            .execute(&Query::SelectRequests {
                title: Some("^920".to_string()),
            })
            .unwrap();
        assert_eq!(result.row_count, 1);
        let record = result.records().next().unwrap();
        assert_eq!(record.text("traffic_id"), Some("a"));
        assert_eq!(record.bytes("request"), Some(b"GET /a HTTP/1.1\r\n\r\n".as_slice()));

        let all = store.execute(&Query::SelectRequests { title: None }).unwrap();
        assert_eq!(all.row_count, 2);
    }

    #[test]
    fn test_invalid_title_filter_is_invalid_query() {
        let store = TrafficStore::open_ephemeral().unwrap();
        let err = store
            .query(&Query::SelectRequests {
                title: Some("(".to_string()),
            })
            .unwrap_err();
        assert!(matches!(err, QueryError::Invalid(_)));
    }

    #[test]
    fn test_updates_and_clean() {
        let store = TrafficStore::open_ephemeral().unwrap();
        store.insert(&request("a", "920100-1")).unwrap();

        let updated = store
            .execute(&Query::UpdateRawTraffic {
                traffic_id: "a".to_string(),
                raw_request: b"GET / HTTP/1.1\r\n\r\n".to_vec(),
                raw_response: b"HTTP/1.1 403 Forbidden\r\n\r\n".to_vec(),
                duration: Some(Duration::from_millis(250)),
            })
            .unwrap();
        assert_eq!(updated.row_count, 1);
        store
            .execute(&Query::UpdateLog {
                traffic_id: "a".to_string(),
                raw_log: "id \"920100\"".to_string(),
            })
            .unwrap();
        store
            .execute(&Query::UpdateTestingResult {
                traffic_id: "a".to_string(),
                passed: true,
            })
            .unwrap();

        let row = store.row("a").unwrap().unwrap();
        assert_eq!(row.duration, Some(0.25));
        assert_eq!(row.raw_log.as_deref(), Some("id \"920100\""));
        assert_eq!(row.testing_result, Some(true));

        let missing = store
            .execute(&Query::UpdateLog {
                traffic_id: "nope".to_string(),
                raw_log: String::new(),
            })
            .unwrap();
        assert_eq!(missing.row_count, 0);

        store.execute(&Query::CleanRawData).unwrap();
        let row = store.row("a").unwrap().unwrap();
        assert_eq!(row.raw_request, None);
        assert_eq!(row.raw_log, None);
        assert_eq!(row.testing_result, None);
        assert_eq!(row.request, b"GET /a HTTP/1.1\r\n\r\n".to_vec());
    }

    #[test]
    fn test_select_results_and_title() {
        let store = TrafficStore::open_ephemeral().unwrap();
        store.insert(&request("a", "920100-1")).unwrap();

        let results = store.execute(&Query::SelectResults).unwrap();
        assert_eq!(results.column_titles, RESULT_COLUMNS.map(String::from).to_vec());
        let record = results.records().next().unwrap();
        assert_eq!(record.text("output"), Some(r#"{"status":403}"#));
        assert!(record.get("raw_request").unwrap().is_null());

        let title = store
            .execute(&Query::SelectTestTitle {
                traffic_id: "a".to_string(),
            })
            .unwrap();
        assert_eq!(title.records().next().unwrap().text("test_title"), Some("920100-1"));

        let count = store.execute(&Query::CountRequests).unwrap();
        assert_eq!(count.rows[0][0].as_int(), Some(1));
    }

    #[test]
    fn test_open_persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("ftw.db");
        {
            let store = TrafficStore::open(&path).unwrap();
            store.insert(&request("a", "920100-1")).unwrap();
            store.flush().unwrap();
        }
        let reopened = TrafficStore::open(&path).unwrap();
        assert_eq!(reopened.path(), path.as_path());
        assert_eq!(reopened.row("a").unwrap().unwrap().test_title, "920100-1");
    }
}
