//! Streamed raw-event export
//!
//! Events are read in pages of [`EXPORT_BATCH_SIZE`] and written to the
//! response as they arrive; the full result is never held in memory.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension,
};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::analytics::{authorize, EventFilter};
use crate::api::error::ApiError;
use crate::api::handlers::AppState;
use crate::auth::Caller;
use crate::cursor::EventCursor;
use crate::error::AnalyticsError;
use crate::models::{ClickEvent, DateWindow};
use crate::storage::EventStore;

pub const EXPORT_BATCH_SIZE: usize = 100;

const CSV_HEADER: &str = "id,linkId,timestamp,visitorHash,country,countryCode,region,city,\
deviceType,deviceBrand,os,browser,referrerDomain,referrerType,utmSource,utmMedium,utmCampaign\n";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
}

impl ExportFormat {
    fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv; charset=utf-8",
            ExportFormat::Json => "application/json",
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            other => Err(AnalyticsError::validation(format!(
                "unknown export format '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportQuery {
    pub format: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

pub fn csv_row(event: &ClickEvent) -> String {
    let opt = |v: &Option<String>| csv_field(v.as_deref().unwrap_or(""));
    let fields = [
        event.id.to_string(),
        csv_field(&event.link_id),
        event.timestamp.to_rfc3339(),
        csv_field(&event.visitor_hash),
        opt(&event.location.country),
        opt(&event.location.country_code),
        opt(&event.location.region),
        opt(&event.location.city),
        event.device.device_type.as_str().to_string(),
        opt(&event.device.brand),
        opt(&event.os.name),
        opt(&event.browser.name),
        opt(&event.referrer.domain),
        event.referrer.referrer_type.as_str().to_string(),
        opt(&event.utm.source),
        opt(&event.utm.medium),
        opt(&event.utm.campaign),
    ];
    let mut row = fields.join(",");
    row.push('\n');
    row
}

/// Encode one page. `first` tells the JSON encoder whether a separator is needed.
fn encode_batch(format: ExportFormat, events: &[ClickEvent], first: bool) -> anyhow::Result<String> {
    match format {
        ExportFormat::Csv => Ok(events.iter().map(csv_row).collect()),
        ExportFormat::Json => {
            let mut out = String::new();
            for (i, event) in events.iter().enumerate() {
                if !(first && i == 0) {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(event)?);
            }
            Ok(out)
        }
    }
}

type Chunk = Result<String, std::io::Error>;

async fn pump(
    store: Arc<dyn EventStore>,
    filter: EventFilter,
    format: ExportFormat,
    tx: mpsc::Sender<Chunk>,
) {
    let opening = match format {
        ExportFormat::Csv => CSV_HEADER,
        ExportFormat::Json => "[",
    };
    if tx.send(Ok(opening.to_string())).await.is_err() {
        return;
    }

    let mut cursor: Option<EventCursor> = None;
    let mut exported = 0usize;
    loop {
        let page = match store.events_page(&filter, cursor, EXPORT_BATCH_SIZE).await {
            Ok(page) => page,
            Err(e) => {
                warn!(error = %e, exported, "Export aborted by storage failure");
                let _ = tx.send(Err(std::io::Error::other(e.to_string()))).await;
                return;
            }
        };
        let Some(last) = page.last() else {
            break;
        };
        cursor = Some(EventCursor::after(last));

        let chunk = encode_batch(format, &page, exported == 0)
            .map_err(|e| std::io::Error::other(e.to_string()));
        exported += page.len();
        if tx.send(chunk).await.is_err() {
            // Client went away
            return;
        }
        if page.len() < EXPORT_BATCH_SIZE {
            break;
        }
    }

    if format == ExportFormat::Json && tx.send(Ok("]".to_string())).await.is_err() {
        return;
    }
    info!(exported, "Export finished");
}

pub async fn export_events(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(link_id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let format = match query.format.as_deref() {
        Some(f) => f.parse::<ExportFormat>()?,
        None => ExportFormat::default(),
    };
    let window = DateWindow::from_params(query.start_date.as_deref(), query.end_date.as_deref())?;
    authorize(state.links.as_ref(), caller.id(), &link_id).await?;

    // Two pages in flight at most
    let (tx, rx) = mpsc::channel(2);
    tokio::spawn(pump(
        state.store.clone(),
        EventFilter::link(&link_id, window),
        format,
        tx,
    ));

    let disposition = format!(
        "attachment; filename=\"{}-events.{}\"",
        link_id.replace('"', ""),
        format.extension()
    );
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_csv_quotes_awkward_values() {
        let mut event = ClickEvent::new(
            "abc",
            Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            "0123456789abcdef",
        );
        event.location.city = Some("Washington, D.C.".to_string());
        event.utm.campaign = Some("say \"hi\"".to_string());

        let row = csv_row(&event);
        assert!(row.contains("\"Washington, D.C.\""));
        assert!(row.contains("\"say \"\"hi\"\"\""));
        assert!(row.ends_with('\n'));
        assert_eq!(
            CSV_HEADER.trim_end().split(',').count(),
            17
        );
    }

    #[test]
    fn test_json_batches_join_into_array() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let events: Vec<ClickEvent> = (0..3).map(|i| ClickEvent::new("abc", ts, format!("v{i}"))).collect();

        let body = format!(
            "[{}{}]",
            encode_batch(ExportFormat::Json, &events[..2], true).unwrap(),
            encode_batch(ExportFormat::Json, &events[2..], false).unwrap()
        );
        let parsed: Vec<ClickEvent> = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed, events);
    }
}
