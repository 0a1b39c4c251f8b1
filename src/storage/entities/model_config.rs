//! Declared model row

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "model_configs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub model: String,
    pub mode: i32,
    pub owner: String,
    pub input_price: f64,
    pub output_price: f64,
    #[sea_orm(column_type = "Text")]
    pub image_prices: String,
    #[sea_orm(column_type = "Text")]
    pub image_quality_prices: String,
    pub rpm: i64,
    pub tpm: i64,
    #[sea_orm(column_type = "Text")]
    pub config: String,
    #[sea_orm(column_type = "Text")]
    pub plugin: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
