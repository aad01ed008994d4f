use std::time::Duration;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, RequestBuilder, Response};
use serde_json::{Map, Value};
use url::Url;

use super::types::{PageQuery, Record};
use super::RemoteSource;
use crate::config::{Config, RemoteConfig};
use crate::error::FetchError;

/// Per-request timeout. A stalled page surfaces as a transport error.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// PostgREST (Supabase REST) client.
#[derive(Clone)]
pub struct PostgrestClient {
  http: reqwest::Client,
  base: Url,
  api_key: String,
  access_token: Option<String>,
}

impl PostgrestClient {
  pub fn new(config: &RemoteConfig) -> Result<Self> {
    let api_key = Config::get_api_key()?;
    let access_token = Config::get_access_token();
    Self::with_credentials(&config.url, api_key, access_token)
  }

  pub fn with_credentials(url: &str, api_key: String, access_token: Option<String>) -> Result<Self> {
    let mut base = Url::parse(url).map_err(|e| eyre!("Invalid remote url {}: {}", url, e))?;
    // Make `join` append rather than replace the last path segment.
    if !base.path().ends_with('/') {
      base.set_path(&format!("{}/", base.path()));
    }

    let http = reqwest::Client::builder()
      .timeout(REQUEST_TIMEOUT)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base,
      api_key,
      access_token,
    })
  }

  fn table_url(&self, table: &str) -> Result<Url, FetchError> {
    self
      .base
      .join(&format!("rest/v1/{}", table))
      .map_err(|e| FetchError::Transport {
        table: table.to_string(),
        message: format!("invalid table url: {}", e),
      })
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    let bearer = self.access_token.as_deref().unwrap_or(self.api_key.as_str());
    self
      .http
      .request(method, url)
      .header("apikey", self.api_key.as_str())
      .bearer_auth(bearer)
  }

  async fn send(&self, table: &str, request: RequestBuilder) -> Result<Response, FetchError> {
    let response = request.send().await.map_err(|e| FetchError::Transport {
      table: table.to_string(),
      message: e.to_string(),
    })?;

    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
      .ok()
      .and_then(|v| v.get("message").and_then(Value::as_str).map(String::from))
      .unwrap_or(body);

    Err(FetchError::Remote {
      table: table.to_string(),
      status: status.as_u16(),
      message,
    })
  }
}

/// Render a row id as a PostgREST filter operand.
fn id_operand(id: &Value) -> String {
  match id {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

#[async_trait]
impl RemoteSource for PostgrestClient {
  async fn query(&self, query: &PageQuery) -> Result<Vec<Record>, FetchError> {
    let mut url = self.table_url(&query.table)?;
    url
      .query_pairs_mut()
      .append_pair("select", "*")
      .append_pair(
        &query.created_column,
        &format!("gte.{}", query.since.to_rfc3339()),
      )
      .append_pair("order", &format!("{}.desc,id.desc", query.created_column))
      .append_pair("offset", &query.offset.to_string())
      .append_pair("limit", &query.limit.to_string());

    let response = self.send(&query.table, self.request(Method::GET, url)).await?;

    response
      .json::<Vec<Record>>()
      .await
      .map_err(|e| FetchError::Decode {
        table: query.table.clone(),
        message: e.to_string(),
      })
  }

  async fn update(&self, table: &str, id: &Value, patch: &Map<String, Value>) -> Result<(), FetchError> {
    let mut url = self.table_url(table)?;
    url
      .query_pairs_mut()
      .append_pair("id", &format!("eq.{}", id_operand(id)));

    let request = self
      .request(Method::PATCH, url)
      .header("Prefer", "return=minimal")
      .json(patch);
    self.send(table, request).await?;
    Ok(())
  }

  async fn delete(&self, table: &str, id: &Value) -> Result<(), FetchError> {
    let mut url = self.table_url(table)?;
    url
      .query_pairs_mut()
      .append_pair("id", &format!("eq.{}", id_operand(id)));

    self.send(table, self.request(Method::DELETE, url)).await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_table_url_keeps_base_path() {
    let client =
      PostgrestClient::with_credentials("https://example.test/proxy", "key".into(), None).unwrap();
    assert_eq!(
      client.table_url("save_selection").unwrap().as_str(),
      "https://example.test/proxy/rest/v1/save_selection"
    );
  }

  #[test]
  fn test_id_operand() {
    assert_eq!(id_operand(&json!(42)), "42");
    assert_eq!(id_operand(&json!("a1b2")), "a1b2");
  }

  #[test]
  fn test_rejects_invalid_url() {
    assert!(PostgrestClient::with_credentials("not a url", "key".into(), None).is_err());
  }
}
