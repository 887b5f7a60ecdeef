//! Redis cache backend over the Upstash REST protocol.
//!
//! Each operation is one `POST {base_url}` whose JSON body is the Redis command as an array
//! (e.g. `["SET", key, value, "EX", ttl]`); the reply is `{"result": ...}` or `{"error": ...}`.

use serde::Deserialize;
use webground_core::{CacheBackend, Error, Result};

#[derive(Debug, Clone)]
pub struct UpstashCache {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    error: Option<String>,
}

impl UpstashCache {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn command(&self, args: serde_json::Value) -> Result<serde_json::Value> {
        let resp = self
            .client
            .post(self.base_url.trim_end_matches('/'))
            .bearer_auth(&self.token)
            .json(&args)
            .send()
            .await
            .map_err(|e| Error::Cache(e.to_string()))?;
        let status = resp.status();
        let reply: Reply = resp
            .json()
            .await
            .map_err(|e| Error::Cache(format!("upstash HTTP {status}: {e}")))?;
        if let Some(err) = reply.error {
            return Err(Error::Cache(format!("upstash HTTP {status}: {err}")));
        }
        if !status.is_success() {
            return Err(Error::Cache(format!("upstash HTTP {status}")));
        }
        Ok(reply.result)
    }
}

#[async_trait::async_trait]
impl CacheBackend for UpstashCache {
    fn name(&self) -> &'static str {
        "upstash"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.command(serde_json::json!(["GET", key])).await? {
            serde_json::Value::Null => Ok(None),
            serde_json::Value::String(s) => Ok(Some(s)),
            other => Ok(Some(other.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_s: u64) -> Result<()> {
        // Redis rejects EX 0; treat it as "already expired".
        if ttl_s == 0 {
            return self.delete(key).await;
        }
        self.command(serde_json::json!(["SET", key, value, "EX", ttl_s]))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.command(serde_json::json!(["DEL", key])).await?;
        Ok(())
    }
}
