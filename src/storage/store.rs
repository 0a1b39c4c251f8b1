//! Store facade
//!
//! All reads and writes the server and relay path need, plus the cache
//! rebuild and monitor-clear hooks that fire on channel CRUD. Dashboard
//! aggregation fetches rows in range and buckets them in-process, which
//! keeps the SQL portable across sqlite and postgres.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, FixedOffset, TimeZone, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ActiveValue::Set, ColumnTrait, ConnectionTrait,
    Database, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Schema,
};
use std::sync::Arc;
use tracing::{error, info};

use crate::config::DatabaseConfig;
use crate::core::adaptor::{AdaptorRegistry, RelayStore, UsageLog};
use crate::core::cache::{CacheHandle, ModelCaches};
use crate::core::dashboard::{ChartPoint, TimeSpan};
use crate::core::mode::Mode;
use crate::core::model::{Channel, ChannelStatus, ChannelType, Group, GroupStatus, ModelConfig, Price};
use crate::core::monitor::HealthMonitor;
use crate::storage::entities::{
    channel, channel_test, group, model_config, public_mcp, request_log, token,
};
use crate::storage::serializer::{self, FASTJSON};
use crate::utils::error::{GatewayError, Result};

pub struct Store {
    db: DatabaseConnection,
    caches: CacheHandle,
    monitor: Arc<HealthMonitor>,
    registry: Arc<AdaptorRegistry>,
}

/// One channel probe result.
#[derive(Debug, Clone)]
pub struct ChannelTestRecord {
    pub channel_id: i32,
    pub channel_type: ChannelType,
    pub channel_name: String,
    pub model: String,
    pub actual_model: String,
    pub mode: Mode,
    pub test_at: DateTime<Utc>,
    pub took_ms: f64,
    pub success: bool,
    pub response: String,
    pub code: i32,
}

/// Filters for the dashboard chart queries.
#[derive(Debug, Clone)]
pub struct DashboardQuery {
    pub start: i64,
    pub end: i64,
    pub span: TimeSpan,
    pub tz: FixedOffset,
    pub channel: Option<i32>,
    pub model: Option<String>,
    pub group: Option<String>,
    pub token_name: Option<String>,
}

/// Aggregated chart rows plus range totals.
#[derive(Debug, Default)]
pub struct DashboardData {
    pub chart_data: Vec<ChartPoint>,
    pub total_count: i64,
    pub exception_count: i64,
    pub used_amount: f64,
}

impl Store {
    pub async fn connect(
        config: &DatabaseConfig,
        caches: CacheHandle,
        monitor: Arc<HealthMonitor>,
        registry: Arc<AdaptorRegistry>,
    ) -> Result<Self> {
        let mut options = sea_orm::ConnectOptions::new(config.url.clone());
        options.max_connections(config.max_connections);
        let db = Database::connect(options).await?;
        Ok(Self {
            db,
            caches,
            monitor,
            registry,
        })
    }

    /// Create any missing tables. Deployments that manage schema
    /// externally can skip this.
    pub async fn ensure_schema(&self) -> Result<()> {
        let backend = self.db.get_database_backend();
        let schema = Schema::new(backend);

        macro_rules! create {
            ($entity:expr) => {{
                let mut stmt = schema.create_table_from_entity($entity);
                stmt.if_not_exists();
                self.db.execute(backend.build(&stmt)).await?;
            }};
        }

        create!(channel::Entity);
        create!(channel_test::Entity);
        create!(group::Entity);
        create!(model_config::Entity);
        create!(public_mcp::Entity);
        create!(request_log::Entity);
        create!(token::Entity);
        Ok(())
    }

    /// Rebuild and publish the cache snapshot from the current tables.
    pub async fn rebuild_caches(&self) -> Result<()> {
        let channels = self.list_channels().await?;
        let model_configs = self.list_model_configs().await?;
        let groups = self.list_groups().await?;
        self.caches
            .store(ModelCaches::build(channels, model_configs, groups));
        info!("model/channel caches rebuilt");
        Ok(())
    }

    pub fn caches(&self) -> &CacheHandle {
        &self.caches
    }

    // ==================== channels ====================

    pub async fn list_channels(&self) -> Result<Vec<Channel>> {
        let rows = channel::Entity::find()
            .order_by_desc(channel::Column::Id)
            .all(&self.db)
            .await?;
        rows.into_iter().map(channel_from_row).collect()
    }

    pub async fn get_channel(&self, id: i32) -> Result<Channel> {
        let row = channel::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| GatewayError::BadRequest(format!("channel {id} not found")))?;
        channel_from_row(row)
    }

    /// Validate the key through the adaptor's `KeyValidator` side
    /// capability; a malformed compound credential is rejected before it
    /// ever reaches the selector.
    fn validate_channel_key(&self, channel: &Channel) -> Result<()> {
        if let Some(entry) = self.registry.get(channel.channel_type) {
            if let Some(validator) = &entry.key_validator {
                validator
                    .validate_key(&channel.key)
                    .map_err(GatewayError::BadRequest)?;
            }
        }
        Ok(())
    }

    pub async fn create_channel(&self, ch: Channel) -> Result<Channel> {
        self.validate_channel_key(&ch)?;
        let mut row = channel_to_row(&ch)?;
        row.id = NotSet;
        row.created_at = Set(Utc::now());
        let inserted = row.insert(&self.db).await?;
        self.after_channel_mutation(inserted.id).await;
        channel_from_row(inserted)
    }

    pub async fn update_channel(&self, ch: Channel) -> Result<()> {
        self.validate_channel_key(&ch)?;
        let mut row = channel_to_row(&ch)?;
        row.created_at = NotSet;
        row.used_amount = NotSet;
        row.request_count = NotSet;
        row.retry_count = NotSet;
        channel::Entity::update(row).exec(&self.db).await?;
        self.after_channel_mutation(ch.id).await;
        Ok(())
    }

    pub async fn delete_channel(&self, id: i32) -> Result<()> {
        channel_test::Entity::delete_many()
            .filter(channel_test::Column::ChannelId.eq(id))
            .exec(&self.db)
            .await?;
        channel::Entity::delete_by_id(id).exec(&self.db).await?;
        self.after_channel_mutation(id).await;
        Ok(())
    }

    pub async fn update_channel_status(&self, id: i32, status: ChannelStatus) -> Result<()> {
        channel::Entity::update_many()
            .col_expr(channel::Column::Status, Expr::value(i32::from(status)))
            .filter(channel::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        self.after_channel_mutation(id).await;
        Ok(())
    }

    pub async fn update_channel_balance(&self, id: i32, balance: f64) -> Result<()> {
        channel::Entity::update_many()
            .col_expr(channel::Column::Balance, Expr::value(balance))
            .col_expr(
                channel::Column::BalanceUpdatedAt,
                Expr::value(Some(Utc::now())),
            )
            .filter(channel::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn after_channel_mutation(&self, id: i32) {
        self.monitor.clear_channel(id);
        if let Err(e) = self.rebuild_caches().await {
            error!("cache rebuild after channel mutation failed: {e}");
        }
    }

    /// Persist a probe result, maintaining `last_test_error_at`: set on
    /// failure, cleared on success once the last error is over an hour
    /// old.
    pub async fn record_channel_test(&self, record: ChannelTestRecord) -> Result<()> {
        if !record.success {
            channel::Entity::update_many()
                .col_expr(
                    channel::Column::LastTestErrorAt,
                    Expr::value(Some(record.test_at)),
                )
                .filter(channel::Column::Id.eq(record.channel_id))
                .exec(&self.db)
                .await?;
        } else {
            let current = self.get_channel(record.channel_id).await?;
            let stale = current
                .last_test_error_at
                .is_some_and(|at| Utc::now() - at > chrono::Duration::hours(1));
            if stale {
                channel::Entity::update_many()
                    .col_expr(
                        channel::Column::LastTestErrorAt,
                        Expr::value(None::<DateTime<Utc>>),
                    )
                    .filter(channel::Column::Id.eq(record.channel_id))
                    .exec(&self.db)
                    .await?;
            }
        }

        channel_test::ActiveModel {
            id: NotSet,
            channel_id: Set(record.channel_id),
            channel_type: Set(record.channel_type.into()),
            channel_name: Set(record.channel_name),
            model: Set(record.model),
            actual_model: Set(record.actual_model),
            mode: Set(record.mode.as_i32()),
            test_at: Set(record.test_at),
            took_ms: Set(record.took_ms),
            success: Set(record.success),
            response: Set(record.response),
            code: Set(record.code),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    // ==================== model configs / groups / tokens ====================

    pub async fn list_model_configs(&self) -> Result<Vec<ModelConfig>> {
        let rows = model_config::Entity::find().all(&self.db).await?;
        rows.into_iter().map(model_config_from_row).collect()
    }

    pub async fn upsert_model_config(&self, mc: ModelConfig) -> Result<()> {
        let row = model_config_to_row(&mc)?;
        model_config::Entity::insert(row)
            .on_conflict(
                OnConflict::column(model_config::Column::Model)
                    .update_columns([
                        model_config::Column::Mode,
                        model_config::Column::Owner,
                        model_config::Column::InputPrice,
                        model_config::Column::OutputPrice,
                        model_config::Column::ImagePrices,
                        model_config::Column::ImageQualityPrices,
                        model_config::Column::Rpm,
                        model_config::Column::Tpm,
                        model_config::Column::Config,
                        model_config::Column::Plugin,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        self.rebuild_caches().await
    }

    pub async fn list_groups(&self) -> Result<Vec<Group>> {
        let rows = group::Entity::find().all(&self.db).await?;
        rows.into_iter().map(group_from_row).collect()
    }

    pub async fn upsert_group(&self, g: Group) -> Result<()> {
        let row = group_to_row(&g)?;
        group::Entity::insert(row)
            .on_conflict(
                OnConflict::column(group::Column::Id)
                    .update_columns([
                        group::Column::Status,
                        group::Column::AvailableSets,
                        group::Column::RpmRatio,
                        group::Column::TpmRatio,
                        group::Column::RpmOverrides,
                        group::Column::TpmOverrides,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        self.rebuild_caches().await
    }

    pub async fn upsert_token(&self, key: &str, name: &str, group_id: &str) -> Result<()> {
        let row = token::ActiveModel {
            key: Set(key.to_string()),
            name: Set(name.to_string()),
            group_id: Set(group_id.to_string()),
            status: Set(1),
        };
        token::Entity::insert(row)
            .on_conflict(
                OnConflict::column(token::Column::Key)
                    .update_columns([
                        token::Column::Name,
                        token::Column::GroupId,
                        token::Column::Status,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Resolve a bearer key to its group and token name. The group comes
    /// from the cache snapshot when possible.
    pub async fn find_token(&self, key: &str) -> Result<Option<(Arc<Group>, String)>> {
        let Some(row) = token::Entity::find_by_id(key).one(&self.db).await? else {
            return Ok(None);
        };
        if row.status != 1 {
            return Ok(None);
        }

        if let Some(group) = self.caches.load().group(&row.group_id) {
            return Ok(Some((group, row.name)));
        }

        let Some(group_row) = group::Entity::find_by_id(row.group_id.clone())
            .one(&self.db)
            .await?
        else {
            return Ok(None);
        };
        Ok(Some((Arc::new(group_from_row(group_row)?), row.name)))
    }

    // ==================== public mcp ====================

    pub async fn list_public_mcps(&self) -> Result<Vec<public_mcp::Model>> {
        Ok(public_mcp::Entity::find().all(&self.db).await?)
    }

    pub async fn upsert_public_mcp(&self, row: public_mcp::Model) -> Result<()> {
        let active = public_mcp::ActiveModel {
            id: Set(row.id),
            name: Set(row.name),
            status: Set(row.status),
            mcp_type: Set(row.mcp_type),
            endpoint: Set(row.endpoint),
            config: Set(row.config),
            created_at: Set(row.created_at),
            updated_at: Set(Utc::now()),
        };
        public_mcp::Entity::insert(active)
            .on_conflict(
                OnConflict::column(public_mcp::Column::Id)
                    .update_columns([
                        public_mcp::Column::Name,
                        public_mcp::Column::Status,
                        public_mcp::Column::McpType,
                        public_mcp::Column::Endpoint,
                        public_mcp::Column::Config,
                        public_mcp::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn delete_public_mcp(&self, id: &str) -> Result<()> {
        public_mcp::Entity::delete_by_id(id).exec(&self.db).await?;
        Ok(())
    }

    // ==================== dashboard ====================

    pub async fn dashboard_data(&self, query: &DashboardQuery) -> Result<DashboardData> {
        let start = DateTime::<Utc>::from_timestamp(query.start, 0)
            .ok_or_else(|| GatewayError::BadRequest("invalid start timestamp".into()))?;
        let end = DateTime::<Utc>::from_timestamp(query.end, 0)
            .ok_or_else(|| GatewayError::BadRequest("invalid end timestamp".into()))?;

        let mut find = request_log::Entity::find()
            .filter(request_log::Column::CreatedAt.gte(start))
            .filter(request_log::Column::CreatedAt.lte(end));
        if let Some(channel) = query.channel {
            find = find.filter(request_log::Column::ChannelId.eq(channel));
        }
        if let Some(model) = &query.model {
            find = find.filter(request_log::Column::Model.eq(model.clone()));
        }
        if let Some(group) = &query.group {
            find = find.filter(request_log::Column::GroupId.eq(group.clone()));
        }
        if let Some(token_name) = &query.token_name {
            find = find.filter(request_log::Column::TokenName.eq(token_name.clone()));
        }

        let rows = find
            .order_by_asc(request_log::Column::CreatedAt)
            .all(&self.db)
            .await?;

        let mut data = DashboardData::default();
        let mut buckets: Vec<ChartPoint> = Vec::new();
        for row in rows {
            data.total_count += 1;
            data.used_amount += row.amount;
            let is_exception = row.code != 200;
            if is_exception {
                data.exception_count += 1;
            }

            let ts = bucket_timestamp(row.created_at.timestamp(), query.span, query.tz);
            match buckets.last_mut() {
                Some(last) if last.timestamp == ts => {
                    last.request_count += 1;
                    last.used_amount += row.amount;
                    if is_exception {
                        last.exception_count += 1;
                    }
                }
                _ => buckets.push(ChartPoint {
                    timestamp: ts,
                    request_count: 1,
                    used_amount: row.amount,
                    exception_count: i64::from(is_exception),
                }),
            }
        }

        data.chart_data = buckets;
        Ok(data)
    }
}

/// Align a timestamp to its bucket in the query timezone.
pub fn bucket_timestamp(ts: i64, span: TimeSpan, tz: FixedOffset) -> i64 {
    match span {
        TimeSpan::Minute => ts - ts.rem_euclid(60),
        TimeSpan::Hour => ts - ts.rem_euclid(3600),
        TimeSpan::Day => {
            let offset = i64::from(tz.local_minus_utc());
            (ts + offset) - (ts + offset).rem_euclid(86400) - offset
        }
        TimeSpan::Month => {
            let local = tz.timestamp_opt(ts, 0).single().unwrap_or_else(|| {
                tz.timestamp_opt(0, 0).single().expect("epoch is valid")
            });
            tz.with_ymd_and_hms(local.year(), local.month(), 1, 0, 0, 0)
                .single()
                .map(|d| d.timestamp())
                .unwrap_or(ts)
        }
    }
}

#[async_trait]
impl RelayStore for Store {
    async fn get_job_channel(&self, job_id: &str) -> Option<i32> {
        request_log::Entity::find()
            .filter(request_log::Column::RequestId.eq(job_id))
            .one(&self.db)
            .await
            .ok()
            .flatten()
            .map(|row| row.channel_id)
    }

    async fn write_log(&self, log: UsageLog) {
        let row = request_log::ActiveModel {
            id: NotSet,
            request_id: Set(log.request_id),
            group_id: Set(log.group),
            token_name: Set(log.token_name),
            model: Set(log.model),
            mode: Set(log.mode.as_i32()),
            channel_id: Set(log.channel_id),
            code: Set(i32::from(log.code)),
            input_tokens: Set(log.usage.input_tokens as i64),
            output_tokens: Set(log.usage.output_tokens as i64),
            total_tokens: Set(log.usage.total_tokens as i64),
            amount: Set(log.amount),
            retry_times: Set(log.retry_times as i32),
            created_at: Set(Utc::now()),
        };
        if let Err(e) = row.insert(&self.db).await {
            error!("request log write failed: {e}");
        }
    }

    async fn add_channel_usage(&self, channel_id: i32, amount: f64, requests: i64, retries: i64) {
        let result = channel::Entity::update_many()
            .col_expr(
                channel::Column::UsedAmount,
                Expr::col(channel::Column::UsedAmount).add(amount),
            )
            .col_expr(
                channel::Column::RequestCount,
                Expr::col(channel::Column::RequestCount).add(requests),
            )
            .col_expr(
                channel::Column::RetryCount,
                Expr::col(channel::Column::RetryCount).add(retries),
            )
            .filter(channel::Column::Id.eq(channel_id))
            .exec(&self.db)
            .await;
        if let Err(e) = result {
            error!("channel counter update failed: {e}");
        }
    }
}

// ==================== row conversions ====================

fn channel_from_row(row: channel::Model) -> Result<Channel> {
    Ok(Channel {
        id: row.id,
        name: row.name,
        channel_type: ChannelType::try_from(row.channel_type).unwrap_or(ChannelType::Unknown),
        base_url: row.base_url,
        key: row.key,
        models: serializer::decode(FASTJSON, &row.models)?,
        model_mapping: serializer::decode(FASTJSON, &row.model_mapping)?,
        priority: row.priority,
        status: ChannelStatus::try_from(row.status).unwrap_or(ChannelStatus::Unknown),
        sets: serializer::decode(FASTJSON, &row.sets)?,
        config: match row.config.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(serializer::decode(FASTJSON, raw)?),
        },
        used_amount: row.used_amount,
        request_count: row.request_count,
        retry_count: row.retry_count,
        balance: row.balance,
        balance_updated_at: row.balance_updated_at,
        last_test_error_at: row.last_test_error_at,
    })
}

fn channel_to_row(ch: &Channel) -> Result<channel::ActiveModel> {
    Ok(channel::ActiveModel {
        id: Set(ch.id),
        name: Set(ch.name.clone()),
        channel_type: Set(ch.channel_type.into()),
        base_url: Set(ch.base_url.clone()),
        key: Set(ch.key.clone()),
        models: Set(serializer::encode(FASTJSON, &ch.models)?),
        model_mapping: Set(serializer::encode(FASTJSON, &ch.model_mapping)?),
        priority: Set(ch.priority),
        status: Set(ch.status.into()),
        sets: Set(serializer::encode(FASTJSON, &ch.sets)?),
        config: Set(match &ch.config {
            Some(config) => Some(serializer::encode(FASTJSON, config)?),
            None => None,
        }),
        used_amount: Set(ch.used_amount),
        request_count: Set(ch.request_count),
        retry_count: Set(ch.retry_count),
        balance: Set(ch.balance),
        balance_updated_at: Set(ch.balance_updated_at),
        last_test_error_at: Set(ch.last_test_error_at),
        created_at: Set(Utc::now()),
    })
}

fn model_config_from_row(row: model_config::Model) -> Result<ModelConfig> {
    Ok(ModelConfig {
        model: row.model,
        mode: Mode::from_i32(row.mode),
        owner: row.owner,
        price: Price {
            input_per_token: row.input_price,
            output_per_token: row.output_price,
        },
        image_prices: serializer::decode(FASTJSON, &row.image_prices)?,
        image_quality_prices: serializer::decode(FASTJSON, &row.image_quality_prices)?,
        rpm: row.rpm,
        tpm: row.tpm,
        config: serializer::decode(FASTJSON, &row.config)?,
        plugin: serializer::decode(FASTJSON, &row.plugin)?,
    })
}

fn model_config_to_row(mc: &ModelConfig) -> Result<model_config::ActiveModel> {
    Ok(model_config::ActiveModel {
        model: Set(mc.model.clone()),
        mode: Set(mc.mode.as_i32()),
        owner: Set(mc.owner.clone()),
        input_price: Set(mc.price.input_per_token),
        output_price: Set(mc.price.output_per_token),
        image_prices: Set(serializer::encode(FASTJSON, &mc.image_prices)?),
        image_quality_prices: Set(serializer::encode(FASTJSON, &mc.image_quality_prices)?),
        rpm: Set(mc.rpm),
        tpm: Set(mc.tpm),
        config: Set(serializer::encode(FASTJSON, &mc.config)?),
        plugin: Set(serializer::encode(FASTJSON, &mc.plugin)?),
    })
}

fn group_from_row(row: group::Model) -> Result<Group> {
    Ok(Group {
        id: row.id,
        status: GroupStatus::try_from(row.status).unwrap_or(GroupStatus::Disabled),
        available_sets: serializer::decode(FASTJSON, &row.available_sets)?,
        rpm_ratio: row.rpm_ratio,
        tpm_ratio: row.tpm_ratio,
        rpm_overrides: serializer::decode(FASTJSON, &row.rpm_overrides)?,
        tpm_overrides: serializer::decode(FASTJSON, &row.tpm_overrides)?,
    })
}

fn group_to_row(g: &Group) -> Result<group::ActiveModel> {
    Ok(group::ActiveModel {
        id: Set(g.id.clone()),
        status: Set(g.status.into()),
        available_sets: Set(serializer::encode(FASTJSON, &g.available_sets)?),
        rpm_ratio: Set(g.rpm_ratio),
        tpm_ratio: Set(g.tpm_ratio),
        rpm_overrides: Set(serializer::encode(FASTJSON, &g.rpm_overrides)?),
        tpm_overrides: Set(serializer::encode(FASTJSON, &g.tpm_overrides)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_alignment() {
        let utc = FixedOffset::east_opt(0).unwrap();
        assert_eq!(bucket_timestamp(3700, TimeSpan::Hour, utc), 3600);
        assert_eq!(bucket_timestamp(59, TimeSpan::Minute, utc), 0);
        assert_eq!(bucket_timestamp(86400 + 5, TimeSpan::Day, utc), 86400);

        // +08:00: local midnight is 16:00 UTC of the previous day
        let cst = FixedOffset::east_opt(8 * 3600).unwrap();
        let day = bucket_timestamp(86400, TimeSpan::Day, cst);
        assert_eq!(day, 86400 - 8 * 3600);
    }
}
