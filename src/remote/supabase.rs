//! PostgREST (Supabase) implementation of the remote store.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, Url};
use serde_json::Value;
use tracing::debug;
use zeroize::Zeroizing;

use super::{row_key, RemoteStore, RowFilter};
use crate::config::RemoteConfig;
use crate::error::RemoteError;
use crate::models::{format_ts, Table};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
/// Rows per select page; PostgREST caps responses server-side anyway.
const PAGE_SIZE: usize = 1000;
const UPSERT_CHUNK: usize = 500;

pub struct SupabaseRemote {
    client: Client,
    rest_url: String,
    api_key: Zeroizing<String>,
}

impl SupabaseRemote {
    pub fn new(config: &RemoteConfig) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RemoteError::Network(format!("HTTP client error: {e}")))?;
        Ok(Self {
            client,
            rest_url: config.rest_url(),
            api_key: config.api_key.clone(),
        })
    }

    fn table_url(&self, table: &str, params: &[(String, String)]) -> Result<Url, RemoteError> {
        let mut url = Url::parse(&format!("{}/{table}", self.rest_url))
            .map_err(|e| RemoteError::NotConfigured(format!("invalid remote URL: {e}")))?;
        if !params.is_empty() {
            let mut qp = url.query_pairs_mut();
            for (k, v) in params {
                qp.append_pair(k, v);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let key = self.api_key.as_str();
        self.client
            .request(method, url)
            .header("apikey", key)
            .header("Authorization", format!("Bearer {key}"))
            .header("Content-Type", "application/json")
    }
}

async fn check(resp: Response) -> Result<Response, RemoteError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(RemoteError::Status {
        status: status.as_u16(),
        body,
    })
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// PostgREST `in.(...)` operand with every value double-quoted.
fn in_list(values: &[String]) -> String {
    let quoted: Vec<String> = values.iter().map(|v| quote(v)).collect();
    format!("in.({})", quoted.join(","))
}

/// Column that breaks `updated_at` ties, so pages follow a total order.
fn tiebreak_column(table: &str) -> &'static str {
    Table::from_remote_name(table).map_or("id", Table::remote_key)
}

fn order_param(key: &str) -> (String, String) {
    ("order".to_string(), format!("updated_at.asc,{key}.asc"))
}

/// Keyset filter for the page after `last`: rows strictly after it in
/// `(updated_at, key)` order.
fn page_after(last: &Value, key: &str) -> Result<(String, String), RemoteError> {
    let updated_at = last
        .get("updated_at")
        .and_then(Value::as_str)
        .ok_or_else(|| RemoteError::Decode("cannot page past a row without updated_at".into()))?;
    let last_key = row_key(last, key)
        .ok_or_else(|| RemoteError::Decode(format!("cannot page past a row without {key}")))?;
    let ts = quote(updated_at);
    Ok((
        "or".to_string(),
        format!(
            "(updated_at.gt.{ts},and(updated_at.eq.{ts},{key}.gt.{}))",
            quote(&last_key)
        ),
    ))
}

/// Query-string filters for a [`RowFilter`].
fn filter_params(filter: &RowFilter) -> Vec<(String, String)> {
    match filter {
        RowFilter::All => Vec::new(),
        RowFilter::KeyIn { column, values } => vec![(column.clone(), in_list(values))],
        RowFilter::UpdatedAfter(since) => {
            vec![("updated_at".to_string(), format!("gt.{}", format_ts(since)))]
        }
    }
}

fn is_empty_key_filter(filter: &RowFilter) -> bool {
    matches!(filter, RowFilter::KeyIn { values, .. } if values.is_empty())
}

#[async_trait]
impl RemoteStore for SupabaseRemote {
    async fn select(&self, table: &str, filter: &RowFilter) -> Result<Vec<Value>, RemoteError> {
        if is_empty_key_filter(filter) {
            return Ok(Vec::new());
        }
        let key = tiebreak_column(table);
        let mut rows: Vec<Value> = Vec::new();
        let mut cursor: Option<(String, String)> = None;
        loop {
            let mut params = vec![
                ("select".to_string(), "*".to_string()),
                order_param(key),
                ("limit".to_string(), PAGE_SIZE.to_string()),
            ];
            params.extend(filter_params(filter));
            params.extend(cursor.take());
            let url = self.table_url(table, &params)?;
            let resp = check(self.request(Method::GET, url).send().await?).await?;
            let page = match resp.json::<Value>().await? {
                Value::Array(page) => page,
                other => {
                    return Err(RemoteError::Decode(format!(
                        "expected an array from {table}, got {other}"
                    )))
                }
            };
            let fetched = page.len();
            rows.extend(page);
            if fetched < PAGE_SIZE {
                break;
            }
            if let Some(last) = rows.last() {
                cursor = Some(page_after(last, key)?);
            }
        }
        debug!(table, rows = rows.len(), "Remote select");
        Ok(rows)
    }

    async fn upsert(
        &self,
        table: &str,
        rows: &[Value],
        conflict_key: &str,
    ) -> Result<(), RemoteError> {
        for chunk in rows.chunks(UPSERT_CHUNK) {
            let url = self.table_url(table, &[("on_conflict".to_string(), conflict_key.to_string())])?;
            let resp = self
                .request(Method::POST, url)
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(chunk)
                .send()
                .await?;
            check(resp).await?;
        }
        debug!(table, rows = rows.len(), "Remote upsert");
        Ok(())
    }

    async fn delete(&self, table: &str, filter: &RowFilter) -> Result<(), RemoteError> {
        if matches!(filter, RowFilter::All) {
            return Err(RemoteError::Status {
                status: 400,
                body: format!("refusing unfiltered delete on {table}"),
            });
        }
        if is_empty_key_filter(filter) {
            return Ok(());
        }
        let url = self.table_url(table, &filter_params(filter))?;
        check(self.request(Method::DELETE, url).send().await?).await?;
        debug!(table, "Remote delete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::parse_ts;

    #[test]
    fn test_in_list_quotes_values() {
        assert_eq!(
            in_list(&["A,1".to_string(), "say \"hi\"".to_string()]),
            r#"in.("A,1","say \"hi\"")"#
        );
    }

    #[test]
    fn test_filter_params() {
        assert!(filter_params(&RowFilter::All).is_empty());
        let since = parse_ts("2026-03-01T10:00:00.000Z").unwrap();
        assert_eq!(
            filter_params(&RowFilter::UpdatedAfter(since)),
            vec![(
                "updated_at".to_string(),
                "gt.2026-03-01T10:00:00.000Z".to_string()
            )]
        );
        assert_eq!(
            filter_params(&RowFilter::key_in("code", vec!["T-001".into()])),
            vec![("code".to_string(), r#"in.("T-001")"#.to_string())]
        );
    }

    #[test]
    fn test_pages_follow_updated_at_then_key() {
        assert_eq!(tiebreak_column("products"), "code");
        assert_eq!(tiebreak_column("clients"), "document");
        assert_eq!(tiebreak_column("sale_details"), "id");
        assert_eq!(
            order_param("code"),
            ("order".to_string(), "updated_at.asc,code.asc".to_string())
        );

        let last = serde_json::json!({"code": "T-001", "updated_at": "2026-03-01T10:00:00.000+00:00"});
        assert_eq!(
            page_after(&last, "code").unwrap(),
            (
                "or".to_string(),
                r#"(updated_at.gt."2026-03-01T10:00:00.000+00:00",and(updated_at.eq."2026-03-01T10:00:00.000+00:00",code.gt."T-001"))"#
                    .to_string()
            )
        );
        assert!(page_after(&serde_json::json!({"code": "T-001"}), "code").is_err());
    }

    #[test]
    fn test_table_url_encodes_query() {
        let config = RemoteConfig::new("abc.supabase.co", "k").unwrap();
        let remote = SupabaseRemote::new(&config).unwrap();
        let url = remote
            .table_url("products", &[("on_conflict".into(), "code".into())])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://abc.supabase.co/rest/v1/products?on_conflict=code"
        );
    }
}
