//! The three synced entities: typed rows, their transforms and schemas.

use chrono::{DateTime, NaiveDate, Utc};
use mary_core::{
    ColumnDef, ColumnType as T, CoercionError, CountPolicy, EntityKind, Money, RawRecord,
    TableEngine,
};
use mary_storage::{EntityRow, Grouping};
use serde::Serialize;

use crate::{
    count, date, labels, money, optional_id, required_id, text, timestamp, row_serde,
    EntitySchema, EntitySource, TransformContext,
};

fn nullable_count(record: &RawRecord, name: &'static str) -> Result<Option<u64>, CoercionError> {
    count(record, name, CountPolicy::Nullable)
}

#[derive(Debug, Clone, PartialEq, clickhouse::Row, Serialize)]
pub struct PlacementRow {
    pub channel_id: u8,
    pub connection_id: u32,
    pub project_id: u32,
    pub customer_xid: String,
    pub campaign_xid: String,
    pub placement_id: u32,
    pub placement_name: String,
    pub placement_type: String,
    pub status: String,
    pub labels: Vec<String>,
    pub utm_campaign: String,
    pub utm_medium: String,
    pub utm_source: String,
    #[serde(with = "row_serde::datetime64_millis")]
    pub outer_synced_at: DateTime<Utc>,
}

impl EntityRow for PlacementRow {}

pub const PLACEMENT_COLUMNS: &[ColumnDef] = &[
    ColumnDef::new("channel_id", T::UInt8),
    ColumnDef::new("connection_id", T::UInt32),
    ColumnDef::new("project_id", T::UInt32),
    ColumnDef::new("customer_xid", T::LowCardinalityString),
    ColumnDef::new("campaign_xid", T::LowCardinalityString),
    ColumnDef::new("placement_id", T::UInt32),
    ColumnDef::new("placement_name", T::LowCardinalityString),
    ColumnDef::new("placement_type", T::LowCardinalityString),
    ColumnDef::new("status", T::LowCardinalityString),
    ColumnDef::new("labels", T::LowCardinalityStringArray),
    ColumnDef::new("utm_campaign", T::String),
    ColumnDef::new("utm_medium", T::String),
    ColumnDef::new("utm_source", T::String),
    ColumnDef::new("outer_synced_at", T::DateTimeMillisUtc),
];

/// The API names the key `id` and the label `name`.
pub fn transform_placement(record: &RawRecord, ctx: &TransformContext) -> Result<PlacementRow, CoercionError> {
    Ok(PlacementRow {
        channel_id: required_id(record, "channel_id")?,
        connection_id: optional_id(record, "connection_id")?,
        project_id: optional_id(record, "project_id")?,
        customer_xid: text(record, "customer_xid")?,
        campaign_xid: text(record, "campaign_xid")?,
        placement_id: required_id(record, "id").map_err(|err| CoercionError::new("placement_id", err.reason))?,
        placement_name: text(record, "name")?,
        placement_type: text(record, "placement_type")?,
        status: text(record, "status")?,
        labels: labels(record, "labels")?,
        utm_campaign: text(record, "utm_campaign")?,
        utm_medium: text(record, "utm_medium")?,
        utm_source: text(record, "utm_source")?,
        outer_synced_at: timestamp(record, "outer_synced_at")?.unwrap_or(ctx.synced_at),
    })
}

pub const PLACEMENTS: EntitySchema<PlacementRow> = EntitySchema {
    kind: EntityKind::Placements,
    table: "mary_placements",
    columns: PLACEMENT_COLUMNS,
    engine: TableEngine::ReplacingMergeTree {
        version: "outer_synced_at",
        order_by: &["placement_id"],
    },
    source: EntitySource::ProjectPlacements,
    transform: transform_placement,
};

#[derive(Debug, Clone, PartialEq, clickhouse::Row, Serialize)]
pub struct StatRow {
    #[serde(with = "row_serde::date")]
    pub date: NaiveDate,
    pub channel_id: u8,
    pub campaign_xid: String,
    pub placement_id: u32,
    pub placement_name: String,
    pub impressions: Option<u64>,
    pub clicks: Option<u64>,
    pub orders: Option<u64>,
    pub model_orders: Option<u64>,
    pub cost_fact: Money,
    pub cpc_fact: Money,
    pub cpm_fact: Money,
    pub ctr: Money,
    pub revenue: Money,
    pub revenue_model_orders: Money,
}

impl EntityRow for StatRow {
    fn partition_date(&self) -> Option<NaiveDate> {
        Some(self.date)
    }
}

pub const STAT_COLUMNS: &[ColumnDef] = &[
    ColumnDef::new("date", T::Date),
    ColumnDef::new("channel_id", T::UInt8),
    ColumnDef::new("campaign_xid", T::LowCardinalityString),
    ColumnDef::new("placement_id", T::UInt32),
    ColumnDef::new("placement_name", T::LowCardinalityString),
    ColumnDef::new("impressions", T::NullableUInt64),
    ColumnDef::new("clicks", T::NullableUInt64),
    ColumnDef::new("orders", T::NullableUInt64),
    ColumnDef::new("model_orders", T::NullableUInt64),
    ColumnDef::new("cost_fact", T::Money),
    ColumnDef::new("cpc_fact", T::Money),
    ColumnDef::new("cpm_fact", T::Money),
    ColumnDef::new("ctr", T::Money),
    ColumnDef::new("revenue", T::Money),
    ColumnDef::new("revenue_model_orders", T::Money),
];

pub fn transform_stat(record: &RawRecord, _ctx: &TransformContext) -> Result<StatRow, CoercionError> {
    Ok(StatRow {
        date: date(record, "date")?,
        channel_id: required_id(record, "channel_id")?,
        campaign_xid: text(record, "campaign_xid")?,
        placement_id: required_id(record, "placement_id")?,
        placement_name: text(record, "placement_name")?,
        impressions: nullable_count(record, "impressions")?,
        clicks: nullable_count(record, "clicks")?,
        orders: nullable_count(record, "orders")?,
        model_orders: nullable_count(record, "model_orders")?,
        cost_fact: money(record, "cost_fact")?,
        cpc_fact: money(record, "cpc_fact")?,
        cpm_fact: money(record, "cpm_fact")?,
        ctr: money(record, "ctr")?,
        revenue: money(record, "revenue")?,
        revenue_model_orders: money(record, "revenue_model_orders")?,
    })
}

pub const STATS: EntitySchema<StatRow> = EntitySchema {
    kind: EntityKind::Stats,
    table: "mary_stats",
    columns: STAT_COLUMNS,
    engine: TableEngine::PartitionedMergeTree {
        partition_by: "date",
        order_by: &["date", "channel_id", "campaign_xid", "placement_id", "placement_name"],
    },
    source: EntitySource::DetailedStatistics {
        grouping: Grouping::Placement,
    },
    transform: transform_stat,
};

#[derive(Debug, Clone, PartialEq, clickhouse::Row, Serialize)]
pub struct AdStatRow {
    #[serde(with = "row_serde::date")]
    pub date: NaiveDate,
    pub channel_id: u8,
    pub campaign_xid: String,
    pub placement_id: u32,
    pub placement_name: String,
    pub adgroup_id: u64,
    pub adgroup_name: String,
    pub ad_id: u64,
    pub ad_name: String,
    pub ad_head: String,
    pub ad_head2: String,
    pub ad_head3: String,
    pub ad_text: String,
    pub ad_text2: String,
    pub ad_url: String,
    pub ad_format: String,
    pub impressions: Option<u64>,
    pub clicks: Option<u64>,
    pub video_views_start: Option<u64>,
    pub video_views_2_sec: Option<u64>,
    pub video_views_3_sec: Option<u64>,
    pub video_views_6_sec: Option<u64>,
    pub video_views: Option<u64>,
    pub engagements: Option<u64>,
    pub link_clicks: Option<u64>,
    pub group_clicks: Option<u64>,
    pub post_likes: Option<u64>,
    pub post_shares: Option<u64>,
    pub follows: Option<u64>,
    pub comments: Option<u64>,
    pub hides: Option<u64>,
    pub reports: Option<u64>,
    pub unsubscribes: Option<u64>,
    pub leads: Option<u64>,
    pub reach: Option<u64>,
    pub reach_total: Option<u64>,
    pub reach_total_sum: Option<u64>,
    pub viral_reach_total_sum: Option<u64>,
    pub reach_subscribers: Option<u64>,
    pub orders: Option<u64>,
    pub model_orders: Option<u64>,
    pub video_view_rate: Money,
    pub engagement_rate: Money,
    pub join_rate: Money,
    pub ctr: Money,
    pub cost: Money,
    pub cpc: Money,
    pub cpm: Money,
    pub cpv: Money,
    pub cpe: Money,
    pub cost_fact: Money,
    pub cpc_fact: Money,
    pub cpm_fact: Money,
    pub cpv_fact: Money,
    pub cpe_fact: Money,
    pub revenue: Money,
    pub revenue_model_orders: Money,
}

impl EntityRow for AdStatRow {
    fn partition_date(&self) -> Option<NaiveDate> {
        Some(self.date)
    }
}

pub const AD_STAT_COLUMNS: &[ColumnDef] = &[
    ColumnDef::new("date", T::Date),
    ColumnDef::new("channel_id", T::UInt8),
    ColumnDef::new("campaign_xid", T::LowCardinalityString),
    ColumnDef::new("placement_id", T::UInt32),
    ColumnDef::new("placement_name", T::LowCardinalityString),
    ColumnDef::new("adgroup_id", T::UInt64),
    ColumnDef::new("adgroup_name", T::LowCardinalityString),
    ColumnDef::new("ad_id", T::UInt64),
    ColumnDef::new("ad_name", T::String),
    ColumnDef::new("ad_head", T::String),
    ColumnDef::new("ad_head2", T::String),
    ColumnDef::new("ad_head3", T::String),
    ColumnDef::new("ad_text", T::String),
    ColumnDef::new("ad_text2", T::String),
    ColumnDef::new("ad_url", T::String),
    ColumnDef::new("ad_format", T::LowCardinalityString),
    ColumnDef::new("impressions", T::NullableUInt64),
    ColumnDef::new("clicks", T::NullableUInt64),
    ColumnDef::new("video_views_start", T::NullableUInt64),
    ColumnDef::new("video_views_2_sec", T::NullableUInt64),
    ColumnDef::new("video_views_3_sec", T::NullableUInt64),
    ColumnDef::new("video_views_6_sec", T::NullableUInt64),
    ColumnDef::new("video_views", T::NullableUInt64),
    ColumnDef::new("engagements", T::NullableUInt64),
    ColumnDef::new("link_clicks", T::NullableUInt64),
    ColumnDef::new("group_clicks", T::NullableUInt64),
    ColumnDef::new("post_likes", T::NullableUInt64),
    ColumnDef::new("post_shares", T::NullableUInt64),
    ColumnDef::new("follows", T::NullableUInt64),
    ColumnDef::new("comments", T::NullableUInt64),
    ColumnDef::new("hides", T::NullableUInt64),
    ColumnDef::new("reports", T::NullableUInt64),
    ColumnDef::new("unsubscribes", T::NullableUInt64),
    ColumnDef::new("leads", T::NullableUInt64),
    ColumnDef::new("reach", T::NullableUInt64),
    ColumnDef::new("reach_total", T::NullableUInt64),
    ColumnDef::new("reach_total_sum", T::NullableUInt64),
    ColumnDef::new("viral_reach_total_sum", T::NullableUInt64),
    ColumnDef::new("reach_subscribers", T::NullableUInt64),
    ColumnDef::new("orders", T::NullableUInt64),
    ColumnDef::new("model_orders", T::NullableUInt64),
    ColumnDef::new("video_view_rate", T::Money),
    ColumnDef::new("engagement_rate", T::Money),
    ColumnDef::new("join_rate", T::Money),
    ColumnDef::new("ctr", T::Money),
    ColumnDef::new("cost", T::Money),
    ColumnDef::new("cpc", T::Money),
    ColumnDef::new("cpm", T::Money),
    ColumnDef::new("cpv", T::Money),
    ColumnDef::new("cpe", T::Money),
    ColumnDef::new("cost_fact", T::Money),
    ColumnDef::new("cpc_fact", T::Money),
    ColumnDef::new("cpm_fact", T::Money),
    ColumnDef::new("cpv_fact", T::Money),
    ColumnDef::new("cpe_fact", T::Money),
    ColumnDef::new("revenue", T::Money),
    ColumnDef::new("revenue_model_orders", T::Money),
];

pub fn transform_ad_stat(record: &RawRecord, _ctx: &TransformContext) -> Result<AdStatRow, CoercionError> {
    Ok(AdStatRow {
        date: date(record, "date")?,
        channel_id: required_id(record, "channel_id")?,
        campaign_xid: text(record, "campaign_xid")?,
        placement_id: required_id(record, "placement_id")?,
        placement_name: text(record, "placement_name")?,
        adgroup_id: required_id(record, "adgroup_id")?,
        adgroup_name: text(record, "adgroup_name")?,
        ad_id: required_id(record, "ad_id")?,
        ad_name: text(record, "ad_name")?,
        ad_head: text(record, "ad_head")?,
        ad_head2: text(record, "ad_head2")?,
        ad_head3: text(record, "ad_head3")?,
        ad_text: text(record, "ad_text")?,
        ad_text2: text(record, "ad_text2")?,
        ad_url: text(record, "ad_url")?,
        ad_format: text(record, "ad_format")?,
        impressions: nullable_count(record, "impressions")?,
        clicks: nullable_count(record, "clicks")?,
        video_views_start: nullable_count(record, "video_views_start")?,
        video_views_2_sec: nullable_count(record, "video_views_2_sec")?,
        video_views_3_sec: nullable_count(record, "video_views_3_sec")?,
        video_views_6_sec: nullable_count(record, "video_views_6_sec")?,
        video_views: nullable_count(record, "video_views")?,
        engagements: nullable_count(record, "engagements")?,
        link_clicks: nullable_count(record, "link_clicks")?,
        group_clicks: nullable_count(record, "group_clicks")?,
        post_likes: nullable_count(record, "post_likes")?,
        post_shares: nullable_count(record, "post_shares")?,
        follows: nullable_count(record, "follows")?,
        comments: nullable_count(record, "comments")?,
        hides: nullable_count(record, "hides")?,
        reports: nullable_count(record, "reports")?,
        unsubscribes: nullable_count(record, "unsubscribes")?,
        leads: nullable_count(record, "leads")?,
        reach: nullable_count(record, "reach")?,
        reach_total: nullable_count(record, "reach_total")?,
        reach_total_sum: nullable_count(record, "reach_total_sum")?,
        viral_reach_total_sum: nullable_count(record, "viral_reach_total_sum")?,
        reach_subscribers: nullable_count(record, "reach_subscribers")?,
        orders: nullable_count(record, "orders")?,
        model_orders: nullable_count(record, "model_orders")?,
        video_view_rate: money(record, "video_view_rate")?,
        engagement_rate: money(record, "engagement_rate")?,
        join_rate: money(record, "join_rate")?,
        ctr: money(record, "ctr")?,
        cost: money(record, "cost")?,
        cpc: money(record, "cpc")?,
        cpm: money(record, "cpm")?,
        cpv: money(record, "cpv")?,
        cpe: money(record, "cpe")?,
        cost_fact: money(record, "cost_fact")?,
        cpc_fact: money(record, "cpc_fact")?,
        cpm_fact: money(record, "cpm_fact")?,
        cpv_fact: money(record, "cpv_fact")?,
        cpe_fact: money(record, "cpe_fact")?,
        revenue: money(record, "revenue")?,
        revenue_model_orders: money(record, "revenue_model_orders")?,
    })
}

pub const AD_STATS: EntitySchema<AdStatRow> = EntitySchema {
    kind: EntityKind::AdStats,
    table: "mary_ad_stats",
    columns: AD_STAT_COLUMNS,
    engine: TableEngine::PartitionedMergeTree {
        partition_by: "date",
        order_by: &["date", "channel_id", "campaign_xid", "placement_id", "adgroup_id", "ad_id"],
    },
    source: EntitySource::DetailedStatistics { grouping: Grouping::Ad },
    transform: transform_ad_stat,
};
