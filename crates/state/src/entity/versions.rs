//! versions entity
//!
//! One build attempt of an app. `version_number` is unique within an app and
//! assigned monotonically. Terminal states are `completed`, `failed`, and
//! `promoted`; `promoted` is reachable only from `completed`.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "versions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub app_id: String,
    pub version_number: i32,
    pub status: VersionStatus,
    /// Key of the packaged source tree in the artifact store. Non-null only
    /// once the object actually exists there.
    pub artifact_key: Option<String>,
    pub deploy_url: Option<String>,
    pub deploy_id: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub build_log: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTimeUtc,
    pub completed_at: Option<DateTimeUtc>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "building")]
    Building,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "promoted")]
    Promoted,
}

impl VersionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VersionStatus::Completed | VersionStatus::Failed | VersionStatus::Promoted
        )
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::apps::Entity",
        from = "Column::AppId",
        to = "super::apps::Column::Id"
    )]
    App,
    #[sea_orm(has_many = "super::comments::Entity")]
    Comments,
}

impl Related<super::apps::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::App.def()
    }
}

impl Related<super::comments::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Comments.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
