use async_trait::async_trait;
use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::entities::product;
use crate::errors::ServiceError;

/// Point-in-time view of a product as the ordering core needs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductSnapshot {
    pub id: Uuid,
    pub mall_id: Uuid,
    pub name: String,
    pub barcode: String,
    pub price: Decimal,
    pub stock: i32,
    pub available: bool,
}

impl From<product::Model> for ProductSnapshot {
    fn from(model: product::Model) -> Self {
        Self {
            id: model.id,
            mall_id: model.mall_id,
            name: model.name,
            barcode: model.barcode,
            price: model.price,
            stock: model.stock_quantity,
            available: model.is_available,
        }
    }
}

/// Read-only product lookup.
///
/// Availability is reported, not filtered. Callers decide what an unavailable
/// product means for them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn get(&self, product_id: Uuid) -> Result<ProductSnapshot, ServiceError>;

    async fn get_by_barcode(&self, barcode: &str) -> Result<ProductSnapshot, ServiceError>;

    /// Missing ids are omitted from the result.
    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<ProductSnapshot>, ServiceError>;
}

/// `Catalog` over the `products` table.
#[derive(Clone)]
pub struct DbCatalog {
    db: Arc<DatabaseConnection>,
}

impl DbCatalog {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Catalog for DbCatalog {
    #[instrument(skip(self))]
    async fn get(&self, product_id: Uuid) -> Result<ProductSnapshot, ServiceError> {
        product::Entity::find_by_id(product_id)
            .one(&*self.db)
            .await?
            .map(ProductSnapshot::from)
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))
    }

    #[instrument(skip(self))]
    async fn get_by_barcode(&self, barcode: &str) -> Result<ProductSnapshot, ServiceError> {
        product::Entity::find()
            .filter(product::Column::Barcode.eq(barcode))
            .one(&*self.db)
            .await?
            .map(ProductSnapshot::from)
            .ok_or_else(|| {
                ServiceError::NotFound(format!("No product with barcode {}", barcode))
            })
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<ProductSnapshot>, ServiceError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = product::Entity::find()
            .filter(product::Column::Id.is_in(ids.to_vec()))
            .all(&*self.db)
            .await?;
        Ok(rows.into_iter().map(ProductSnapshot::from).collect())
    }
}
