//! Trace export to a Zipkin-compatible collector.
//!
//! Span records are queued on a bounded channel and shipped in batches by a
//! background task (`POST {endpoint}/api/v2/spans`). Spans recorded while the
//! queue is full are dropped and counted. A missing, malformed or unreachable
//! endpoint leaves the exporter disabled; recording on a disabled exporter is
//! a no-op.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use url::Url;
use uuid::Uuid;

use crate::config::schema::ObservabilityConfig;
use crate::observability::metrics;

const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_BATCH: usize = 100;

/// Batching and delivery limits for the span reporter.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub flush_interval: Duration,
    pub request_timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self::from(&ObservabilityConfig::default())
    }
}

impl From<&ObservabilityConfig> for ExportOptions {
    fn from(config: &ObservabilityConfig) -> Self {
        Self {
            flush_interval: Duration::from_millis(config.trace_flush_ms),
            request_timeout: Duration::from_millis(config.trace_export_timeout_ms),
            queue_capacity: config.trace_queue_capacity,
        }
    }
}

/// Zipkin v2 span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanRecord {
    pub trace_id: String,
    pub id: String,
    pub name: String,
    pub kind: String,
    /// Epoch microseconds.
    pub timestamp: u64,
    /// Microseconds.
    pub duration: u64,
    pub local_endpoint: LocalEndpoint,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalEndpoint {
    pub service_name: String,
}

#[derive(Debug)]
struct Enabled {
    endpoint: Url,
    service_name: String,
    sender: mpsc::Sender<SpanRecord>,
}

/// Handle for recording spans. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct SpanExporter {
    inner: Option<Arc<Enabled>>,
}

impl SpanExporter {
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn endpoint(&self) -> Option<&Url> {
        self.inner.as_ref().map(|e| &e.endpoint)
    }

    /// Queue one server span. Never blocks; drops the span if the export
    /// queue is full.
    pub fn record(
        &self,
        name: &str,
        started: SystemTime,
        elapsed: Duration,
        tags: BTreeMap<String, String>,
    ) {
        let Some(enabled) = &self.inner else {
            return;
        };
        let trace_id = Uuid::new_v4().simple().to_string();
        let span = SpanRecord {
            id: trace_id[..16].to_string(),
            trace_id,
            name: name.to_lowercase(),
            kind: "SERVER".to_string(),
            timestamp: started
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_micros() as u64,
            duration: (elapsed.as_micros() as u64).max(1),
            local_endpoint: LocalEndpoint {
                service_name: enabled.service_name.clone(),
            },
            tags,
        };
        match enabled.sender.try_send(span) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => metrics::record_span_dropped(),
            // The reporter only goes away with the runtime.
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

/// Build the span exporter for `endpoint`. Never fails.
pub async fn init_tracing(
    endpoint: Option<&str>,
    service_name: &str,
    options: ExportOptions,
) -> SpanExporter {
    let Some(raw) = endpoint.filter(|e| !e.trim().is_empty()) else {
        tracing::info!("No trace collector configured, tracing disabled");
        return SpanExporter::disabled();
    };

    let endpoint = match Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.host_str().is_some() => url,
        Ok(_) | Err(_) => {
            tracing::warn!(endpoint = %raw, "Malformed trace collector URL, tracing disabled");
            return SpanExporter::disabled();
        }
    };

    if let Err(reason) = check_reachable(&endpoint).await {
        tracing::warn!(endpoint = %endpoint, reason = %reason, "Trace collector unreachable, tracing disabled");
        return SpanExporter::disabled();
    }

    let mut base = endpoint.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    let spans_url = match base.join("api/v2/spans") {
        Ok(url) => url,
        Err(e) => {
            tracing::warn!(endpoint = %endpoint, error = %e, "Malformed trace collector URL, tracing disabled");
            return SpanExporter::disabled();
        }
    };

    let client = match reqwest::Client::builder()
        .timeout(options.request_timeout)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to build trace export client, tracing disabled");
            return SpanExporter::disabled();
        }
    };

    let (sender, receiver) = mpsc::channel(options.queue_capacity.max(1));
    let flush_interval = options.flush_interval.max(Duration::from_millis(1));
    tokio::spawn(report(client, spans_url, receiver, flush_interval));

    tracing::info!(endpoint = %endpoint, service = %service_name, "Tracing enabled");
    SpanExporter {
        inner: Some(Arc::new(Enabled {
            endpoint,
            service_name: service_name.to_string(),
            sender,
        })),
    }
}

async fn check_reachable(endpoint: &Url) -> Result<(), String> {
    let host = endpoint.host_str().ok_or("missing host")?;
    let port = endpoint.port_or_known_default().ok_or("missing port")?;
    match tokio::time::timeout(REACHABILITY_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("connect timed out".to_string()),
    }
}

async fn report(
    client: reqwest::Client,
    url: Url,
    mut receiver: mpsc::Receiver<SpanRecord>,
    flush_interval: Duration,
) {
    let mut batch = Vec::new();
    let mut ticker = tokio::time::interval(flush_interval);
    loop {
        tokio::select! {
            span = receiver.recv() => match span {
                Some(span) => {
                    batch.push(span);
                    if batch.len() >= MAX_BATCH {
                        ship(&client, &url, &mut batch).await;
                    }
                }
                None => {
                    ship(&client, &url, &mut batch).await;
                    return;
                }
            },
            _ = ticker.tick() => ship(&client, &url, &mut batch).await,
        }
    }
}

async fn ship(client: &reqwest::Client, url: &Url, batch: &mut Vec<SpanRecord>) {
    if batch.is_empty() {
        return;
    }
    let spans = std::mem::take(batch);
    match client.post(url.clone()).json(&spans).send().await {
        Ok(resp) if resp.status().is_success() => {
            tracing::trace!(spans = spans.len(), "Spans exported");
        }
        Ok(resp) => {
            tracing::warn!(status = %resp.status(), spans = spans.len(), "Trace collector rejected spans");
        }
        Err(e) => {
            tracing::warn!(error = %e, spans = spans.len(), "Failed to export spans");
        }
    }
}
