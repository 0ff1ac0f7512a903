use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum PaymentStatus {
    Authorized,
    Captured,
    Canceled,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payments")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub payment_collection_id: String,
    pub provider_id: String,
    /// Gateway-side authorization id (PaymentIntent id).
    pub provider_reference: String,
    pub amount: Decimal,
    pub currency_code: String,
    pub status: String,
    pub captured_amount: Option<Decimal>,
    pub captured_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::payment_collection::Entity",
        from = "Column::PaymentCollectionId",
        to = "super::payment_collection::Column::Id"
    )]
    PaymentCollection,
}

impl Related<super::payment_collection::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PaymentCollection.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
