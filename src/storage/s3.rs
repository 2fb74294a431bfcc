use std::time::SystemTime;

use anyhow::anyhow;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use hmac::{Hmac, Mac};
use http::StatusCode;
use reqwest::Client;
use sha1::Sha1;

use super::{StorageError, StorageProvider};
use crate::cache::CacheWriter;
use crate::http::serve::fmt_http_date;
use crate::settings::Host;

type HmacSha1 = Hmac<Sha1>;

/// Origin client for one bucket, speaking plain S3 HTTP GET with AWS
/// signature version 2 request signing.
pub struct S3Provider {
    bucket: String,
    root_path: String,
    endpoint: Option<String>,
    access_key: String,
    secret_key: String,
    preserve_headers: Vec<String>,
    client: Client,
}

impl S3Provider {
    pub fn from_host(host: &Host) -> Self {
        Self {
            bucket: host.bucket.clone(),
            root_path: host.path.trim_matches('/').to_string(),
            endpoint: host
                .endpoint
                .as_ref()
                .map(|endpoint| endpoint.trim_end_matches('/').to_string()),
            access_key: host.access_key.clone(),
            secret_key: host.secret_key.clone(),
            preserve_headers: host.preserve_headers.clone().unwrap_or_default(),
            client: Client::new(),
        }
    }

    fn object_key(&self, path: &str) -> String {
        if self.root_path.is_empty() {
            path.to_string()
        } else {
            format!("{}/{path}", self.root_path)
        }
    }

    fn object_url(&self, key: &str) -> String {
        match &self.endpoint {
            // Path-style addressing for S3-compatible services.
            Some(endpoint) => format!("{endpoint}/{}/{key}", self.bucket),
            None => format!("https://{}.s3.amazonaws.com/{key}", self.bucket),
        }
    }

    fn authorization(&self, date: &str, key: &str) -> String {
        let resource = format!("/{}/{key}", self.bucket);
        let string_to_sign = format!("GET\n\n\n{date}\n{resource}");
        let mut mac = HmacSha1::new_from_slice(self.secret_key.as_bytes())
            .expect("hmac accepts keys of any length");
        mac.update(string_to_sign.as_bytes());
        let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());
        format!("AWS {}:{signature}", self.access_key)
    }
}

#[async_trait]
impl StorageProvider for S3Provider {
    async fn read(&self, path: &str, writer: &mut CacheWriter<'_>) -> Result<u64, StorageError> {
        let key = self.object_key(path);
        let url = self.object_url(&key);
        let date = fmt_http_date(SystemTime::now());

        let mut response = self
            .client
            .get(&url)
            .header(http::header::DATE, date.as_str())
            .header(http::header::AUTHORIZATION, self.authorization(&date, &key))
            .send()
            .await
            .map_err(|err| StorageError::Unreachable(anyhow!(err)))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(StorageError::OriginStatus(status));
        }

        writer.preserve_and_write_headers(response.headers());
        let expected = response.content_length();

        let mut total = 0u64;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    writer.write(&chunk).await?;
                    total += chunk.len() as u64;
                }
                Ok(None) => break,
                Err(err) => return Err(StorageError::Truncated(anyhow!(err))),
            }
        }
        if let Some(expected) = expected
            && total != expected
        {
            return Err(StorageError::Truncated(anyhow!(
                "origin advertised {expected} bytes, read {total}"
            )));
        }
        Ok(total)
    }

    fn preserve_headers(&self) -> &[String] {
        &self.preserve_headers
    }
}
