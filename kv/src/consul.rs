//! A [`Client`] backed by a Consul agent's KV API.
//!
//! Swaps use Consul's check-and-set (`?cas=<ModifyIndex>`) for optimistic
//! concurrency; watches use blocking queries (`?index=<last>&wait=<dur>`) so
//! an idle watch costs one parked HTTP request rather than a poll loop.

use std::time::Duration;

use async_trait::async_trait;
use backoff::{Backoff, BackoffConfig};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use observability_deps::tracing::{debug, warn};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::{CasFn, Client, Codec, Error, PrefixWatchFn, WatchFn, MAX_CAS_RETRIES};

/// Consul client configuration.
#[derive(Debug, Clone)]
pub struct ConsulConfig {
    /// Base URL of the Consul agent, e.g. `http://127.0.0.1:8500`.
    pub host: String,

    /// Optional ACL token attached to every request.
    pub acl_token: Option<String>,

    /// How long a blocking (watch) query parks server-side before returning
    /// unchanged.
    pub watch_wait: Duration,

    /// Per-request HTTP timeout. Must exceed `watch_wait` (Consul adds up to
    /// `wait / 16` of jitter on top of the requested wait).
    pub http_timeout: Duration,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            host: "http://127.0.0.1:8500".to_string(),
            acl_token: None,
            watch_wait: Duration::from_secs(10),
            http_timeout: Duration::from_secs(20),
        }
    }
}

/// One element of the JSON array returned by `GET /v1/kv/...`.
#[derive(Debug, Deserialize)]
struct KvPair {
    #[serde(rename = "Key")]
    key: String,
    /// Base64-encoded value bytes; absent for empty values.
    #[serde(rename = "Value")]
    value: Option<String>,
    #[serde(rename = "ModifyIndex")]
    modify_index: u64,
}

/// A Consul-backed KV client.
pub struct ConsulClient<C> {
    config: ConsulConfig,
    codec: C,
    http: reqwest::Client,
    backoff_config: BackoffConfig,
}

impl<C> std::fmt::Debug for ConsulClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsulClient")
            .field("host", &self.config.host)
            .finish()
    }
}

fn transport(e: impl std::error::Error + Send + Sync + 'static) -> Error {
    Error::Transport {
        source: Box::new(e),
    }
}

impl<C> ConsulClient<C>
where
    C: Codec,
{
    /// Construct a client for the agent at `config.host`, (de)serialising
    /// values with `codec`.
    pub fn new(config: ConsulConfig, codec: C) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(transport)?;

        Ok(Self {
            config,
            codec,
            http,
            backoff_config: BackoffConfig::default(),
        })
    }

    fn kv_url(&self, key: &str) -> String {
        format!("{}/v1/kv/{}", self.config.host.trim_end_matches('/'), key)
    }

    /// Fetch `key` (or everything under it with `recurse`), optionally as a
    /// blocking query against `index`. Returns the pairs and the
    /// `X-Consul-Index` to pass to the next blocking query.
    async fn get_raw(
        &self,
        key: &str,
        index: Option<u64>,
        recurse: bool,
    ) -> Result<(Vec<KvPair>, u64), Error> {
        let mut req = self.http.get(self.kv_url(key));
        if let Some(index) = index {
            req = req.query(&[
                ("index", index.to_string()),
                ("wait", format!("{}s", self.config.watch_wait.as_secs())),
            ]);
        }
        if recurse {
            req = req.query(&[("recurse", "true")]);
        }
        if let Some(token) = &self.config.acl_token {
            req = req.header("X-Consul-Token", token);
        }

        let resp = req.send().await.map_err(transport)?;

        let consul_index = resp
            .headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok((vec![], consul_index));
        }
        let resp = resp.error_for_status().map_err(transport)?;

        let pairs: Vec<KvPair> = resp.json().await.map_err(transport)?;
        Ok((pairs, consul_index))
    }

    fn decode_pair(&self, pair: &KvPair) -> Result<C::Value, Error> {
        let raw = match &pair.value {
            Some(b64) => BASE64.decode(b64).map_err(transport)?,
            None => vec![],
        };
        self.codec.decode(&raw).map_err(|source| Error::Decode {
            key: pair.key.clone(),
            source,
        })
    }

    /// Write `value` to `key` iff its ModifyIndex is still `cas_index`
    /// (0 = key must not exist). Returns whether the swap committed.
    async fn put_cas(&self, key: &str, value: Bytes, cas_index: u64) -> Result<bool, Error> {
        let mut req = self
            .http
            .put(self.kv_url(key))
            .query(&[("cas", cas_index.to_string())])
            .body(value);
        if let Some(token) = &self.config.acl_token {
            req = req.header("X-Consul-Token", token);
        }

        let resp = req
            .send()
            .await
            .map_err(transport)?
            .error_for_status()
            .map_err(transport)?;

        let body = resp.text().await.map_err(transport)?;
        Ok(body.trim() == "true")
    }
}

#[async_trait]
impl<C> Client<C::Value> for ConsulClient<C>
where
    C: Codec,
{
    async fn get(&self, key: &str) -> Result<Option<C::Value>, Error> {
        let (pairs, _) = self.get_raw(key, None, false).await?;
        pairs.first().map(|p| self.decode_pair(p)).transpose()
    }

    async fn cas(&self, key: &str, f: CasFn<'_, C::Value>) -> Result<(), Error> {
        let mut backoff = Backoff::new(&self.backoff_config);

        for attempt in 1..=MAX_CAS_RETRIES {
            let (pairs, _) = self.get_raw(key, None, false).await?;
            let (current, index) = match pairs.first() {
                Some(pair) => (Some(self.decode_pair(pair)?), pair.modify_index),
                None => (None, 0),
            };

            let (new, retry) = match f(current)? {
                (Some(new), retry) => (new, retry),
                (None, _) => return Ok(()),
            };

            let buf = self.codec.encode(&new).map_err(|source| Error::Encode {
                key: key.to_string(),
                source,
            })?;

            if self.put_cas(key, buf, index).await? {
                return Ok(());
            }
            if !retry {
                return Err(Error::CasExhausted {
                    key: key.to_string(),
                    attempts: attempt,
                });
            }

            debug!(key, attempt, "consul CAS lost the swap race, retrying");
            if let Some(delay) = backoff.next() {
                tokio::time::sleep(delay).await;
            }
        }

        Err(Error::CasExhausted {
            key: key.to_string(),
            attempts: MAX_CAS_RETRIES,
        })
    }

    async fn watch_key(&self, key: &str, shutdown: CancellationToken, cb: WatchFn<'_, C::Value>) {
        let mut backoff = Backoff::new(&self.backoff_config);
        let mut index = 0_u64;

        loop {
            let got = tokio::select! {
                _ = shutdown.cancelled() => return,
                got = self.get_raw(key, Some(index), false) => got,
            };

            let (pairs, new_index) = match got {
                Ok(v) => v,
                Err(e) => {
                    warn!(key, error=%e, "error watching consul key");
                    if let Some(delay) = backoff.next() {
                        tokio::time::sleep(delay).await;
                    }
                    continue;
                }
            };
            backoff = Backoff::new(&self.backoff_config);

            // An index moving backwards means consul state was lost; restart
            // the watch from scratch.
            if new_index < index {
                index = 0;
                continue;
            }
            // Unchanged: the blocking query timed out.
            if new_index == index {
                continue;
            }
            index = new_index;

            if let Some(pair) = pairs.first() {
                match self.decode_pair(pair) {
                    Ok(value) => {
                        if !cb(value) {
                            return;
                        }
                    }
                    Err(e) => warn!(key, error=%e, "malformed value while watching key"),
                }
            }
        }
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        shutdown: CancellationToken,
        cb: PrefixWatchFn<'_, C::Value>,
    ) {
        let mut backoff = Backoff::new(&self.backoff_config);
        let mut index = 0_u64;

        loop {
            let got = tokio::select! {
                _ = shutdown.cancelled() => return,
                got = self.get_raw(prefix, Some(index), true) => got,
            };

            let (pairs, new_index) = match got {
                Ok(v) => v,
                Err(e) => {
                    warn!(prefix, error=%e, "error watching consul prefix");
                    if let Some(delay) = backoff.next() {
                        tokio::time::sleep(delay).await;
                    }
                    continue;
                }
            };
            backoff = Backoff::new(&self.backoff_config);

            if new_index < index {
                index = 0;
                continue;
            }
            if new_index == index {
                continue;
            }
            let prev_index = index;
            index = new_index;

            for pair in pairs.iter().filter(|p| p.modify_index > prev_index) {
                match self.decode_pair(pair) {
                    Ok(value) => {
                        if !cb(&pair.key, value) {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(prefix, key=%pair.key, error=%e, "malformed value while watching prefix")
                    }
                }
            }
        }
    }
}
