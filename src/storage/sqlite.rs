use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use std::sync::Arc;

use crate::analytics::plan::{
    Dimension, EventFilter, GroupCount, LinkScope, Projection, QueryPlan, SortOrder, WindowStats,
};
use crate::cursor::EventCursor;
use crate::models::{
    ClickEvent, DateWindow, Device, Location, Referrer, RollupPeriod, RollupRecord, Software, Utm,
};
use crate::storage::{EventSink, EventStore, LinkRepository, RollupStore};

pub struct SqliteStore {
    pool: Arc<SqlitePool>,
}

impl SqliteStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create tables and indexes if they do not exist
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS click_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                link_id TEXT NOT NULL,
                owner_id TEXT,
                timestamp_ms INTEGER NOT NULL,
                visitor_hash TEXT NOT NULL,
                country TEXT,
                country_code TEXT,
                region TEXT,
                city TEXT,
                latitude REAL,
                longitude REAL,
                device_type TEXT NOT NULL,
                device_brand TEXT,
                device_model TEXT,
                os_name TEXT,
                os_version TEXT,
                browser_name TEXT,
                browser_version TEXT,
                referrer_url TEXT,
                referrer_domain TEXT,
                referrer_type TEXT NOT NULL,
                utm_source TEXT,
                utm_medium TEXT,
                utm_campaign TEXT,
                utm_term TEXT,
                utm_content TEXT
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_link_time ON click_events(link_id, timestamp_ms)",
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_time ON click_events(timestamp_ms)")
            .execute(self.pool.as_ref())
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS links (
                link_id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_links_owner ON links(owner_id)")
            .execute(self.pool.as_ref())
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rollups (
                link_id TEXT NOT NULL,
                period TEXT NOT NULL,
                period_start INTEGER NOT NULL,
                period_end INTEGER NOT NULL,
                payload TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (link_id, period, period_start)
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_watermarks (
                job TEXT PRIMARY KEY,
                watermark INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    /// Mirror a link from the link catalogue (insert or change owner)
    pub async fn register_link(&self, link_id: &str, owner_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO links (link_id, owner_id, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(link_id) DO UPDATE SET owner_id = excluded.owner_id
            "#,
        )
        .bind(link_id)
        .bind(owner_id)
        .bind(Utc::now().timestamp())
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }
}

/// SQL expression for a grouping dimension. Mirrors `Dimension::value_of`.
fn dimension_expr(dimension: Dimension) -> &'static str {
    match dimension {
        Dimension::Link => "link_id",
        Dimension::Country => "COALESCE(country_code, 'Unknown')",
        Dimension::Region => "COALESCE(region, 'Unknown')",
        Dimension::City => "COALESCE(city, 'Unknown')",
        Dimension::DeviceType => "device_type",
        Dimension::DeviceBrand => "COALESCE(device_brand, 'Unknown')",
        Dimension::Os => "COALESCE(os_name, 'Unknown')",
        Dimension::Browser => "COALESCE(browser_name, 'Unknown')",
        Dimension::ReferrerDomain => "COALESCE(referrer_domain, 'direct')",
        Dimension::ReferrerType => "referrer_type",
        Dimension::UtmSource => "utm_source",
        Dimension::UtmMedium => "utm_medium",
        Dimension::UtmCampaign => "utm_campaign",
        Dimension::Hour => "CAST((timestamp_ms / 3600000) * 3600 AS TEXT)",
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &EventFilter) {
    qb.push(" WHERE 1 = 1");
    if let LinkScope::Links(ids) = &filter.scope {
        if ids.is_empty() {
            qb.push(" AND 0 = 1");
        } else {
            qb.push(" AND link_id IN (");
            let mut separated = qb.separated(", ");
            for id in ids {
                separated.push_bind(id.clone());
            }
            separated.push_unseparated(")");
        }
    }
    if let Some(window) = filter.window {
        qb.push(" AND timestamp_ms >= ")
            .push_bind(window.start.timestamp_millis())
            .push(" AND timestamp_ms < ")
            .push_bind(window.end.timestamp_millis());
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[derive(Debug, FromRow)]
struct EventRow {
    id: i64,
    link_id: String,
    owner_id: Option<String>,
    timestamp_ms: i64,
    visitor_hash: String,
    country: Option<String>,
    country_code: Option<String>,
    region: Option<String>,
    city: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    device_type: String,
    device_brand: Option<String>,
    device_model: Option<String>,
    os_name: Option<String>,
    os_version: Option<String>,
    browser_name: Option<String>,
    browser_version: Option<String>,
    referrer_url: Option<String>,
    referrer_domain: Option<String>,
    referrer_type: String,
    utm_source: Option<String>,
    utm_medium: Option<String>,
    utm_campaign: Option<String>,
    utm_term: Option<String>,
    utm_content: Option<String>,
}

impl From<EventRow> for ClickEvent {
    fn from(row: EventRow) -> Self {
        ClickEvent {
            id: row.id,
            link_id: row.link_id,
            owner_id: row.owner_id,
            timestamp: from_millis(row.timestamp_ms),
            visitor_hash: row.visitor_hash,
            location: Location {
                country: row.country,
                country_code: row.country_code,
                region: row.region,
                city: row.city,
                latitude: row.latitude,
                longitude: row.longitude,
            },
            device: Device {
                device_type: row.device_type.parse().unwrap_or_default(),
                brand: row.device_brand,
                model: row.device_model,
            },
            os: Software {
                name: row.os_name,
                version: row.os_version,
            },
            browser: Software {
                name: row.browser_name,
                version: row.browser_version,
            },
            referrer: Referrer {
                url: row.referrer_url,
                domain: row.referrer_domain,
                referrer_type: row.referrer_type.parse().unwrap_or_default(),
            },
            utm: Utm {
                source: row.utm_source,
                medium: row.utm_medium,
                campaign: row.utm_campaign,
                term: row.utm_term,
                content: row.utm_content,
            },
        }
    }
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn execute(&self, plan: &QueryPlan) -> Result<Vec<GroupCount>> {
        let expr = dimension_expr(plan.group_by);
        let aggregate = match plan.project {
            Projection::Clicks => "COUNT(*)",
            Projection::UniqueVisitors => "COUNT(DISTINCT visitor_hash)",
        };

        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new("SELECT ");
        qb.push(expr)
            .push(" AS dimension, ")
            .push(aggregate)
            .push(" AS count FROM click_events");
        push_filter(&mut qb, &plan.filter);
        if plan.group_by.tagged_only() {
            qb.push(" AND ").push(expr).push(" IS NOT NULL");
        }
        qb.push(" GROUP BY dimension");
        qb.push(match plan.sort {
            SortOrder::CountDesc => " ORDER BY count DESC, dimension ASC",
            SortOrder::KeyAsc => " ORDER BY dimension ASC",
        });
        if let Some(limit) = plan.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows: Vec<(String, i64)> = qb
            .build_query_as()
            .fetch_all(self.pool.as_ref())
            .await
            .with_context(|| format!("aggregation by {:?} failed", plan.group_by))?;

        Ok(rows
            .into_iter()
            .map(|(key, count)| GroupCount {
                key,
                count: count.max(0) as u64,
            })
            .collect())
    }

    async fn window_stats(&self, filter: &EventFilter) -> Result<WindowStats> {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            "SELECT COUNT(*), MIN(timestamp_ms), MAX(timestamp_ms) FROM click_events",
        );
        push_filter(&mut qb, filter);

        let (total, first, last): (i64, Option<i64>, Option<i64>) = qb
            .build_query_as()
            .fetch_one(self.pool.as_ref())
            .await?;

        Ok(WindowStats {
            total: total.max(0) as u64,
            first_click: first.map(from_millis),
            last_click: last.map(from_millis),
        })
    }

    async fn events_page(
        &self,
        filter: &EventFilter,
        after: Option<EventCursor>,
        limit: usize,
    ) -> Result<Vec<ClickEvent>> {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new("SELECT * FROM click_events");
        push_filter(&mut qb, filter);
        if let Some(cursor) = after {
            qb.push(" AND (timestamp_ms > ")
                .push_bind(cursor.timestamp_ms)
                .push(" OR (timestamp_ms = ")
                .push_bind(cursor.timestamp_ms)
                .push(" AND id > ")
                .push_bind(cursor.id)
                .push("))");
        }
        qb.push(" ORDER BY timestamp_ms ASC, id ASC LIMIT ")
            .push_bind(limit as i64);

        let rows: Vec<EventRow> = qb
            .build_query_as()
            .fetch_all(self.pool.as_ref())
            .await?;

        Ok(rows.into_iter().map(ClickEvent::from).collect())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM click_events WHERE timestamp_ms < ?")
            .bind(cutoff.timestamp_millis())
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl EventSink for SqliteStore {
    async fn append(&self, mut event: ClickEvent) -> Result<ClickEvent> {
        let result = sqlx::query(
            r#"
            INSERT INTO click_events (
                link_id, owner_id, timestamp_ms, visitor_hash,
                country, country_code, region, city, latitude, longitude,
                device_type, device_brand, device_model,
                os_name, os_version, browser_name, browser_version,
                referrer_url, referrer_domain, referrer_type,
                utm_source, utm_medium, utm_campaign, utm_term, utm_content
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.link_id)
        .bind(&event.owner_id)
        .bind(event.timestamp.timestamp_millis())
        .bind(&event.visitor_hash)
        .bind(&event.location.country)
        .bind(&event.location.country_code)
        .bind(&event.location.region)
        .bind(&event.location.city)
        .bind(event.location.latitude)
        .bind(event.location.longitude)
        .bind(event.device.device_type.as_str())
        .bind(&event.device.brand)
        .bind(&event.device.model)
        .bind(&event.os.name)
        .bind(&event.os.version)
        .bind(&event.browser.name)
        .bind(&event.browser.version)
        .bind(&event.referrer.url)
        .bind(&event.referrer.domain)
        .bind(event.referrer.referrer_type.as_str())
        .bind(&event.utm.source)
        .bind(&event.utm.medium)
        .bind(&event.utm.campaign)
        .bind(&event.utm.term)
        .bind(&event.utm.content)
        .execute(self.pool.as_ref())
        .await?;

        event.id = result.last_insert_rowid();
        Ok(event)
    }
}

#[async_trait]
impl LinkRepository for SqliteStore {
    async fn lookup_owner(&self, link_id: &str) -> Result<Option<String>> {
        let owner = sqlx::query_scalar::<_, String>("SELECT owner_id FROM links WHERE link_id = ?")
            .bind(link_id)
            .fetch_optional(self.pool.as_ref())
            .await?;
        Ok(owner)
    }

    async fn links_for_owner(&self, owner_id: &str) -> Result<Vec<String>> {
        let links = sqlx::query_scalar::<_, String>(
            "SELECT link_id FROM links WHERE owner_id = ? ORDER BY link_id",
        )
        .bind(owner_id)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(links)
    }
}

#[async_trait]
impl RollupStore for SqliteStore {
    async fn upsert_rollup(&self, record: &RollupRecord) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        sqlx::query(
            r#"
            INSERT INTO rollups (link_id, period, period_start, period_end, payload, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (link_id, period, period_start) DO UPDATE SET
                period_end = excluded.period_end,
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.link_id)
        .bind(record.period.as_str())
        .bind(record.period_start.timestamp())
        .bind(record.period_end.timestamp())
        .bind(payload)
        .bind(Utc::now().timestamp())
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn get_rollup(
        &self,
        link_id: &str,
        period: RollupPeriod,
        period_start: DateTime<Utc>,
    ) -> Result<Option<RollupRecord>> {
        let payload = sqlx::query_scalar::<_, String>(
            r#"
            SELECT payload FROM rollups
            WHERE link_id = ? AND period = ? AND period_start = ?
            "#,
        )
        .bind(link_id)
        .bind(period.as_str())
        .bind(period_start.timestamp())
        .fetch_optional(self.pool.as_ref())
        .await?;

        payload
            .map(|p| serde_json::from_str(&p).context("corrupt rollup payload"))
            .transpose()
    }

    async fn list_rollups(
        &self,
        link_id: &str,
        period: RollupPeriod,
        window: Option<DateWindow>,
    ) -> Result<Vec<RollupRecord>> {
        let (from, to) = match window {
            Some(w) => (w.start.timestamp(), w.end.timestamp()),
            None => (i64::MIN, i64::MAX),
        };
        let payloads = sqlx::query_scalar::<_, String>(
            r#"
            SELECT payload FROM rollups
            WHERE link_id = ? AND period = ? AND period_start >= ? AND period_start < ?
            ORDER BY period_start ASC
            "#,
        )
        .bind(link_id)
        .bind(period.as_str())
        .bind(from)
        .bind(to)
        .fetch_all(self.pool.as_ref())
        .await?;

        payloads
            .iter()
            .map(|p| serde_json::from_str(p).context("corrupt rollup payload"))
            .collect()
    }

    async fn get_watermark(&self, job: &str) -> Result<Option<DateTime<Utc>>> {
        let watermark =
            sqlx::query_scalar::<_, i64>("SELECT watermark FROM job_watermarks WHERE job = ?")
                .bind(job)
                .fetch_optional(self.pool.as_ref())
                .await?;
        Ok(watermark.map(|ts| from_millis(ts * 1000)))
    }

    async fn advance_watermark(&self, job: &str, watermark: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_watermarks (job, watermark, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (job) DO UPDATE SET
                watermark = MAX(job_watermarks.watermark, excluded.watermark),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(job)
        .bind(watermark.timestamp())
        .bind(Utc::now().timestamp())
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }
}
