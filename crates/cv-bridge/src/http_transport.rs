//! Client for a log proxy that exposes topics over HTTP.
//!
//! - `POST {base}/topics/{topic}/records` with `{"records":[{"key":..,"value":..}]}`
//! - `GET {base}/topics/{topic}/records?group={group}&after={offset}` returning
//!   `{"records":[{"offset":..,"key":..,"value":..}]}`
//!
//! Subscriptions poll every topic on a fixed interval from a background task
//! that stops when the subscription is dropped or a read fails.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::transport::{GroupTransport, RawMessage, Result, Subscription, TransportError};

#[derive(Debug, Serialize)]
struct ProduceRecord<'a> {
    key: Option<&'a str>,
    value: &'a str,
}

#[derive(Debug, Serialize)]
struct ProduceRequest<'a> {
    records: Vec<ProduceRecord<'a>>,
}

#[derive(Debug, Deserialize)]
struct FetchedRecord {
    offset: u64,
    #[serde(default)]
    key: Option<String>,
    value: String,
}

#[derive(Debug, Deserialize)]
struct FetchResponse {
    #[serde(default)]
    records: Vec<FetchedRecord>,
}

#[derive(Clone)]
pub struct HttpLogTransport {
    client: reqwest::Client,
    base_url: String,
    consumer_group: String,
    poll_interval: Duration,
    request_timeout: Duration,
    api_key: Option<String>,
}

impl HttpLogTransport {
    pub fn new(
        base_url: impl Into<String>,
        consumer_group: impl Into<String>,
        poll_interval: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            consumer_group: consumer_group.into(),
            poll_interval,
            request_timeout,
            api_key: None,
        })
    }

    /// Send `Authorization: Bearer <key>` on every request.
    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key.filter(|k| !k.is_empty());
        self
    }

    fn records_url(&self, topic: &str) -> String {
        format!("{}/topics/{}/records", self.base_url, topic)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    fn map_reqwest(&self, err: reqwest::Error, wrap: fn(String) -> TransportError) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.request_timeout.as_millis() as u64)
        } else if err.is_connect() {
            TransportError::NotConnected
        } else {
            wrap(err.to_string())
        }
    }

    async fn fetch(&self, topic: &str, after: Option<u64>) -> Result<Vec<FetchedRecord>> {
        let mut query = vec![("group", self.consumer_group.clone())];
        if let Some(offset) = after {
            query.push(("after", offset.to_string()));
        }
        let resp = self
            .authorize(self.client.get(self.records_url(topic)).query(&query))
            .send()
            .await
            .map_err(|e| self.map_reqwest(e, TransportError::ReceiveFailed))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::ReceiveFailed(format!(
                "GET {topic}: HTTP {status}"
            )));
        }
        let body: FetchResponse = resp
            .json()
            .await
            .map_err(|e| TransportError::Serialization(e.to_string()))?;
        Ok(body.records)
    }

    async fn poll_loop(
        self,
        topics: Vec<String>,
        tx: flume::Sender<Result<RawMessage>>,
    ) {
        let mut offsets: Vec<Option<u64>> = vec![None; topics.len()];
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if tx.is_disconnected() {
                debug!("subscription dropped, stopping poll loop");
                return;
            }
            for (topic, offset) in topics.iter().zip(offsets.iter_mut()) {
                match self.fetch(topic, *offset).await {
                    Ok(records) => {
                        for rec in records {
                            *offset = Some(offset.map_or(rec.offset, |o| o.max(rec.offset)));
                            let msg = RawMessage {
                                topic: topic.clone(),
                                key: rec.key,
                                value: rec.value.into_bytes(),
                            };
                            if tx.send(Ok(msg)).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "log proxy read failed");
                        let _ = tx.send(Err(e));
                        return;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl GroupTransport for HttpLogTransport {
    async fn publish(&self, topic: &str, key: Option<&str>, value: Vec<u8>) -> Result<()> {
        let value =
            String::from_utf8(value).map_err(|e| TransportError::Serialization(e.to_string()))?;
        let body = ProduceRequest {
            records: vec![ProduceRecord { key, value: &value }],
        };
        let resp = self
            .authorize(self.client.post(self.records_url(topic)).json(&body))
            .send()
            .await
            .map_err(|e| self.map_reqwest(e, TransportError::SendFailed))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::SendFailed(format!(
                "POST {topic}: HTTP {status}"
            )));
        }
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<Subscription> {
        let (tx, rx) = flume::unbounded();
        tokio::spawn(self.clone().poll_loop(topics.to_vec(), tx));
        Ok(Subscription::new(rx))
    }
}
