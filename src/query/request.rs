//! Collaborator-facing query request: the structured JSON object a caller
//! (daemon, CLI, client library) hands to the engine, decoded into a
//! `QueryConfig` plus an optional condition tree.

use std::path::PathBuf;

use serde::Deserialize;

use crate::query::condition::Condition;
use crate::query::executor::QueryConfig;
use crate::{CidxError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryRequest {
    pub csv: String,
    pub index_dir: Option<String>,
    /// Condition tree or simple equality map; `null`/`{}` means none.
    #[serde(rename = "where")]
    pub where_clause: serde_json::Value,
    /// 0 means unlimited.
    pub limit: i64,
    pub offset: i64,
    pub count_only: bool,
    pub explain: bool,
    pub group_by: String,
    pub agg_col: String,
    pub agg_func: String,
}

impl QueryRequest {
    /// Decode a request from raw JSON. All structural validation happens
    /// here, before any file is touched.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let req: QueryRequest = serde_json::from_slice(data)
            .map_err(|e| CidxError::BadRequest(format!("request JSON: {e}")))?;
        req.validate()?;
        Ok(req)
    }

    fn validate(&self) -> Result<()> {
        if self.csv.is_empty() {
            return Err(CidxError::BadRequest("csv path required".into()));
        }
        if self.limit < 0 {
            return Err(CidxError::BadRequest("limit must be >= 0".into()));
        }
        if self.offset < 0 {
            return Err(CidxError::BadRequest("offset must be >= 0".into()));
        }
        Ok(())
    }

    /// Split into the executor configuration and the parsed condition.
    pub fn into_parts(self) -> Result<(QueryConfig, Option<Condition>)> {
        self.validate()?;
        let condition = Condition::parse(&self.where_clause)?;
        let config = QueryConfig {
            csv_path: PathBuf::from(self.csv),
            index_dir: self.index_dir.map(PathBuf::from),
            group_by: self.group_by,
            agg_col: self.agg_col,
            agg_func: self.agg_func,
            count_only: self.count_only,
            limit: self.limit,
            offset: self.offset,
            explain: self.explain,
            ..Default::default()
        };
        Ok((config, condition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_request() {
        let req = QueryRequest::from_json(
            br#"{
                "csv": "/data/people.csv",
                "where": {"dept": "Eng"},
                "limit": 10,
                "offset": 2,
                "countOnly": true,
                "groupBy": "dept",
                "aggFunc": "count"
            }"#,
        )
        .unwrap();
        assert_eq!(req.csv, "/data/people.csv");
        assert_eq!(req.limit, 10);
        assert!(req.count_only);

        let (config, cond) = req.into_parts().unwrap();
        assert_eq!(config.csv_path, PathBuf::from("/data/people.csv"));
        assert_eq!(config.group_by, "dept");
        assert_eq!(config.offset, 2);
        let conds = cond.unwrap().extract_index_conditions();
        assert_eq!(conds.get("dept"), Some(&"Eng".to_string()));
    }

    #[test]
    fn test_defaults() {
        let req = QueryRequest::from_json(br#"{"csv": "x.csv"}"#).unwrap();
        assert_eq!(req.limit, 0);
        assert!(!req.explain);
        let (config, cond) = req.into_parts().unwrap();
        assert!(cond.is_none());
        assert!(config.index_dir.is_none());
        assert_eq!(config.separator, b',');
    }

    #[test]
    fn test_rejections() {
        assert!(matches!(
            QueryRequest::from_json(b"{not json"),
            Err(CidxError::BadRequest(_))
        ));
        assert!(matches!(
            QueryRequest::from_json(br#"{"where": {"a": "b"}}"#),
            Err(CidxError::BadRequest(_))
        ));
        assert!(matches!(
            QueryRequest::from_json(br#"{"csv": "x.csv", "limit": -1}"#),
            Err(CidxError::BadRequest(_))
        ));
        assert!(matches!(
            QueryRequest::from_json(br#"{"csv": "x.csv", "offset": -5}"#),
            Err(CidxError::BadRequest(_))
        ));
    }

    #[test]
    fn test_tree_where_clause() {
        let req = QueryRequest::from_json(
            br#"{"csv": "x.csv", "where": {"operator": ">", "column": "score", "value": "10"}}"#,
        )
        .unwrap();
        let (_, cond) = req.into_parts().unwrap();
        assert!(cond.is_some());
    }
}
