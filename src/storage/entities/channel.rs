//! Channel row
//!
//! JSON-valued columns (`models`, `model_mapping`, `sets`, `config`) are
//! TEXT encoded through the `fastjson` serializer.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "channels")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub name: String,
    #[sea_orm(column_name = "type")]
    pub channel_type: i32,
    pub base_url: String,
    #[sea_orm(column_type = "Text")]
    pub key: String,
    #[sea_orm(column_type = "Text")]
    pub models: String,
    #[sea_orm(column_type = "Text")]
    pub model_mapping: String,
    pub priority: i32,
    pub status: i32,
    #[sea_orm(column_type = "Text")]
    pub sets: String,
    #[sea_orm(column_type = "Text", nullable)]
    pub config: Option<String>,
    pub used_amount: f64,
    pub request_count: i64,
    pub retry_count: i64,
    pub balance: f64,
    pub balance_updated_at: Option<DateTimeUtc>,
    pub last_test_error_at: Option<DateTimeUtc>,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::channel_test::Entity")]
    ChannelTests,
}

impl Related<super::channel_test::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ChannelTests.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
