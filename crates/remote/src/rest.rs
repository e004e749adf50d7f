/// PostgREST/storage backend (Supabase-compatible)
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use url::Url;

use crate::realtime::RealtimeChannel;
use crate::{
    InsertHandler, RemoteConfig, RemoteError, RemoteRepository, RemoteRow, Result, SelectQuery,
    Subscription,
};

pub struct RestRemote {
    base: Url,
    api_key: String,
    schema: String,
    client: reqwest::Client,
}

impl RestRemote {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let raw = config
            .url
            .as_deref()
            .ok_or_else(|| RemoteError::Config("rest backend requires url".into()))?;
        let base = Url::parse(raw).map_err(|e| RemoteError::Config(format!("bad url {raw}: {e}")))?;
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| RemoteError::Config("rest backend requires api_key".into()))?;

        Ok(Self {
            base,
            api_key,
            schema: config.schema.clone(),
            client: reqwest::Client::new(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| RemoteError::Config(format!("bad endpoint {path}: {e}")))
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&self.api_key)
            .map_err(|e| RemoteError::Config(format!("api key is not a valid header: {e}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| RemoteError::Config(e.to_string()))?;
        let schema = HeaderValue::from_str(&self.schema)
            .map_err(|e| RemoteError::Config(e.to_string()))?;
        headers.insert("apikey", key);
        headers.insert("authorization", bearer);
        headers.insert("accept-profile", schema.clone());
        headers.insert("content-profile", schema);
        Ok(headers)
    }

    async fn write_rows(
        &self,
        table: &str,
        on_conflict: Option<&str>,
        row: RemoteRow,
    ) -> Result<RemoteRow> {
        let mut url = self.endpoint(&format!("rest/v1/{table}"))?;
        let prefer = match on_conflict {
            Some(column) => {
                url.query_pairs_mut().append_pair("on_conflict", column);
                "resolution=merge-duplicates,return=representation"
            }
            None => "return=representation",
        };

        let response = self
            .client
            .post(url)
            .headers(self.headers()?)
            .header("prefer", prefer)
            .json(&[row])
            .send()
            .await?;

        let rows: Vec<RemoteRow> = Self::check(response).await?.json().await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| RemoteError::Decode(format!("{table}: empty representation")))
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(RemoteError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    /// Public URL of an object in a public bucket
    pub fn public_url(&self, bucket: &str, path: &str) -> Result<String> {
        Ok(self
            .endpoint(&format!("storage/v1/object/public/{bucket}/{path}"))?
            .to_string())
    }
}

#[async_trait::async_trait]
impl RemoteRepository for RestRemote {
    fn name(&self) -> &str {
        "rest"
    }

    async fn insert(&self, table: &str, row: RemoteRow) -> Result<RemoteRow> {
        self.write_rows(table, None, row).await
    }

    async fn upsert(&self, table: &str, on_conflict: &str, row: RemoteRow) -> Result<RemoteRow> {
        self.write_rows(table, Some(on_conflict), row).await
    }

    async fn select(&self, table: &str, query: &SelectQuery) -> Result<Vec<RemoteRow>> {
        let mut url = self.endpoint(&format!("rest/v1/{table}"))?;
        {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query.to_query_pairs() {
                pairs.append_pair(&k, &v);
            }
        }
        let response = self
            .client
            .get(url)
            .headers(self.headers()?)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn upload_blob(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String> {
        let url = self.endpoint(&format!("storage/v1/object/{bucket}/{path}"))?;
        let response = self
            .client
            .post(url)
            .headers(self.headers()?)
            .header(CONTENT_TYPE, content_type)
            .header("x-upsert", "true")
            .body(bytes)
            .send()
            .await?;
        Self::check(response).await?;
        self.public_url(bucket, path)
    }

    async fn subscribe_inserts(&self, table: &str, handler: InsertHandler) -> Result<Subscription> {
        let channel = RealtimeChannel::new(&self.base, &self.api_key, &self.schema, table)?;
        Ok(Subscription::new(tokio::spawn(channel.run(handler))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_url() {
        let remote = RestRemote::new(&RemoteConfig::rest("https://demo.supabase.co", "anon")).unwrap();
        assert_eq!(
            remote.public_url("vistorias", "abc/f1.jpg").unwrap(),
            "https://demo.supabase.co/storage/v1/object/public/vistorias/abc/f1.jpg"
        );
    }

    #[test]
    fn test_missing_key_is_config_error() {
        let mut config = RemoteConfig::rest("https://demo.supabase.co", "anon");
        config.api_key = None;
        assert!(matches!(RestRemote::new(&config), Err(RemoteError::Config(_))));
    }
}
