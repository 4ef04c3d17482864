//! Authoritative stock check-and-decrement.
//!
//! Everything here runs on a caller-supplied transaction so the decrement
//! commits or rolls back together with the order it pays for. Locks are taken
//! cart first, then products one row at a time in ascending id order, so two
//! checkouts sharing products always queue instead of deadlocking.

use sea_orm::{
    sea_query::Expr, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QuerySelect,
};
use std::collections::BTreeMap;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::entities::{cart, product};
use crate::errors::ServiceError;

/// A product row as read under its lock, with the quantity taken from it.
#[derive(Debug, Clone)]
pub struct ReservedLine {
    pub product: product::Model,
    pub quantity: i32,
}

/// Locks the user's cart row. `None` when the user has no cart yet.
///
/// The row is touched before it is read. On SQLite a transaction that reads
/// first and writes later cannot wait for the writer lock and fails at once
/// with "database is locked"; writing first makes it queue on the busy
/// timeout instead. On Postgres the update takes the same row lock.
pub async fn lock_cart<C>(conn: &C, user_id: Uuid) -> Result<Option<cart::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    cart::Entity::update_many()
        .col_expr(cart::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
        .filter(cart::Column::UserId.eq(user_id))
        .exec(conn)
        .await?;

    Ok(cart::Entity::find()
        .filter(cart::Column::UserId.eq(user_id))
        .lock_exclusive()
        .one(conn)
        .await?)
}

/// Sums requested quantities per product. The result iterates in lock order.
pub fn lock_order<I>(lines: I) -> Result<BTreeMap<Uuid, i32>, ServiceError>
where
    I: IntoIterator<Item = (Uuid, i32)>,
{
    let mut wanted = BTreeMap::new();
    for (product_id, quantity) in lines {
        if quantity <= 0 {
            return Err(ServiceError::InvalidInput(format!(
                "Quantity for product {} must be positive",
                product_id
            )));
        }
        let slot = wanted.entry(product_id).or_insert(0i32);
        *slot = slot
            .checked_add(quantity)
            .ok_or_else(|| ServiceError::InvalidInput("Quantity is too large".to_string()))?;
    }
    Ok(wanted)
}

/// Locks every product, checks every line, then decrements every product.
///
/// Any shortfall aborts before the first write, naming the product. The
/// decrement itself is guarded by `stock_quantity >= q`, so even a backend
/// that ignores `FOR UPDATE` can never drive stock negative.
#[instrument(skip(conn, lines))]
pub async fn reserve<C, I>(conn: &C, lines: I) -> Result<Vec<ReservedLine>, ServiceError>
where
    C: ConnectionTrait,
    I: IntoIterator<Item = (Uuid, i32)>,
{
    let wanted = lock_order(lines)?;

    let mut locked = Vec::with_capacity(wanted.len());
    for (&product_id, &quantity) in &wanted {
        let row = product::Entity::find_by_id(product_id)
            .lock_exclusive()
            .one(conn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} not found", product_id))
            })?;
        locked.push(ReservedLine {
            product: row,
            quantity,
        });
    }

    if let Some(short) = locked
        .iter()
        .find(|line| line.product.stock_quantity < line.quantity)
    {
        warn!(product_id = %short.product.id, requested = short.quantity,
              available = short.product.stock_quantity, "insufficient stock at checkout");
        return Err(ServiceError::insufficient_stock(
            short.product.id,
            &short.product.name,
            short.quantity,
            short.product.stock_quantity,
        ));
    }

    for line in &locked {
        let result = product::Entity::update_many()
            .col_expr(
                product::Column::StockQuantity,
                Expr::col(product::Column::StockQuantity).sub(line.quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
            .filter(product::Column::Id.eq(line.product.id))
            .filter(product::Column::StockQuantity.gte(line.quantity))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            let available = current_stock(conn, line.product.id).await?;
            return Err(ServiceError::insufficient_stock(
                line.product.id,
                &line.product.name,
                line.quantity,
                available,
            ));
        }
        debug!(product_id = %line.product.id, quantity = line.quantity, "stock decremented");
    }

    Ok(locked)
}

/// Returns quantities to stock in lock order. Products that no longer exist
/// are skipped; the restored `(product_id, quantity)` pairs are returned.
#[instrument(skip(conn, lines))]
pub async fn restock<C, I>(conn: &C, lines: I) -> Result<Vec<(Uuid, i32)>, ServiceError>
where
    C: ConnectionTrait,
    I: IntoIterator<Item = (Uuid, i32)>,
{
    let wanted = lock_order(lines)?;
    let mut restored = Vec::with_capacity(wanted.len());

    for (product_id, quantity) in wanted {
        let exists = product::Entity::find_by_id(product_id)
            .lock_exclusive()
            .one(conn)
            .await?
            .is_some();
        if !exists {
            debug!(%product_id, "skipping restock of deleted product");
            continue;
        }

        product::Entity::update_many()
            .col_expr(
                product::Column::StockQuantity,
                Expr::col(product::Column::StockQuantity).add(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
            .filter(product::Column::Id.eq(product_id))
            .exec(conn)
            .await?;
        restored.push((product_id, quantity));
    }

    Ok(restored)
}

async fn current_stock<C>(conn: &C, product_id: Uuid) -> Result<i32, ServiceError>
where
    C: ConnectionTrait,
{
    Ok(product::Entity::find_by_id(product_id)
        .one(conn)
        .await?
        .map(|p| p.stock_quantity)
        .unwrap_or(0))
}
