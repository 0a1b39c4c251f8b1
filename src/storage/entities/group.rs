//! Group (tenant) row

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "groups")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub status: i32,
    #[sea_orm(column_type = "Text")]
    pub available_sets: String,
    pub rpm_ratio: f64,
    pub tpm_ratio: f64,
    #[sea_orm(column_type = "Text")]
    pub rpm_overrides: String,
    #[sea_orm(column_type = "Text")]
    pub tpm_overrides: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::token::Entity")]
    Tokens,
}

impl Related<super::token::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tokens.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
