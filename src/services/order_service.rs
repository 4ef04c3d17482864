use crate::{
    config::AppConfig,
    db::set_lock_timeout,
    entities::{order, order_item, OrderStatus, PaymentStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        inventory_reservation,
        invoicing::Invoice,
        pricing::money,
    },
};
use chrono::Utc;
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// An order header together with its line snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderWithItems {
    #[serde(flatten)]
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

/// Read access to orders and their post-checkout lifecycle.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            db,
            event_sender,
            config,
        }
    }

    /// Lists a user's orders, newest first. `page` is 1-based.
    #[instrument(skip(self))]
    pub async fn list_orders(
        &self,
        user_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<order::Model>, u64), ServiceError> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, self.config.max_page_size);

        let paginator = order::Entity::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .order_by_desc(order::Column::Id)
            .paginate(&*self.db, per_page);

        let total = paginator.num_items().await?;
        let orders = paginator
            .fetch_page(page - 1)
            .await?
            .into_iter()
            .map(normalize_order)
            .collect();

        Ok((orders, total))
    }

    /// Orders belonging to other users are reported as missing.
    #[instrument(skip(self))]
    pub async fn get_order(
        &self,
        order_id: Uuid,
        user_id: Uuid,
    ) -> Result<OrderWithItems, ServiceError> {
        let order = order::Entity::find_by_id(order_id)
            .filter(order::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| order_not_found(order_id))?;

        let items = load_items(&*self.db, order.id).await?;
        Ok(OrderWithItems {
            order: normalize_order(order),
            items,
        })
    }

    /// Read-only invoice snapshot of one of the user's orders.
    #[instrument(skip(self))]
    pub async fn invoice(&self, order_id: Uuid, user_id: Uuid) -> Result<Invoice, ServiceError> {
        let order = self.get_order(order_id, user_id).await?;
        Ok(Invoice::from_order(&order))
    }

    /// Cancels a pending order.
    ///
    /// A paid order is marked refunded; moving the money is someone else's job.
    /// Stock goes back only when `restock_on_cancel` is set.
    #[instrument(skip(self))]
    pub async fn cancel(&self, order_id: Uuid, user_id: Uuid) -> Result<order::Model, ServiceError> {
        let txn = self.db.begin().await?;
        set_lock_timeout(&txn, self.config.checkout_lock_timeout()).await?;
        let current = lock_order(&txn, order_id, Some(user_id)).await?;

        if current.status != OrderStatus::Pending {
            return Err(ServiceError::InvalidTransition(format!(
                "Order {} is {} and can no longer be cancelled",
                current.order_number, current.status
            )));
        }

        let old_payment = current.payment_status;
        let new_payment = if old_payment == PaymentStatus::Paid {
            PaymentStatus::Refunded
        } else {
            old_payment
        };

        let mut active: order::ActiveModel = current.into();
        active.status = Set(OrderStatus::Cancelled);
        active.payment_status = Set(new_payment);
        active.updated_at = Set(Utc::now());
        let updated = active.update(&txn).await?;

        let restored = if self.config.restock_on_cancel {
            let items = load_items(&txn, order_id).await?;
            inventory_reservation::restock(
                &txn,
                items
                    .iter()
                    .filter_map(|item| item.product_id.map(|id| (id, item.quantity))),
            )
            .await?
        } else {
            Vec::new()
        };

        txn.commit().await?;

        counter!("paymall_orders_cancelled_total", 1);
        info!(order_id = %order_id, restocked = restored.len(), "Order cancelled");

        self.event_sender
            .send_or_log(Event::OrderCancelled(order_id))
            .await;
        if new_payment != old_payment {
            self.event_sender
                .send_or_log(Event::PaymentStatusChanged {
                    order_id,
                    old_status: old_payment,
                    new_status: new_payment,
                })
                .await;
        }
        for (product_id, quantity) in restored {
            self.event_sender
                .send_or_log(Event::StockRestored {
                    product_id,
                    quantity,
                    order_id,
                })
                .await;
        }

        Ok(normalize_order(updated))
    }

    /// Fulfillment hook: `Pending -> Processing -> Completed`.
    #[instrument(skip(self))]
    pub async fn update_fulfillment_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
    ) -> Result<order::Model, ServiceError> {
        let txn = self.db.begin().await?;
        set_lock_timeout(&txn, self.config.checkout_lock_timeout()).await?;
        let current = lock_order(&txn, order_id, None).await?;
        let old_status = current.status;

        if !old_status.can_advance_to(new_status) {
            return Err(ServiceError::InvalidTransition(format!(
                "Order {} cannot move from {} to {}",
                current.order_number, old_status, new_status
            )));
        }

        let mut active: order::ActiveModel = current.into();
        active.status = Set(new_status);
        active.updated_at = Set(Utc::now());
        let updated = active.update(&txn).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            })
            .await;

        Ok(normalize_order(updated))
    }

    /// Payment hook, driven by whoever talks to the payment provider.
    #[instrument(skip(self))]
    pub async fn update_payment_status(
        &self,
        order_id: Uuid,
        new_status: PaymentStatus,
    ) -> Result<order::Model, ServiceError> {
        let txn = self.db.begin().await?;
        set_lock_timeout(&txn, self.config.checkout_lock_timeout()).await?;
        let current = lock_order(&txn, order_id, None).await?;
        let old_status = current.payment_status;

        if !old_status.can_transition_to(new_status) {
            return Err(ServiceError::InvalidTransition(format!(
                "Payment for order {} cannot move from {} to {}",
                current.order_number, old_status, new_status
            )));
        }

        let mut active: order::ActiveModel = current.into();
        active.payment_status = Set(new_status);
        active.updated_at = Set(Utc::now());
        let updated = active.update(&txn).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::PaymentStatusChanged {
                order_id,
                old_status,
                new_status,
            })
            .await;

        Ok(normalize_order(updated))
    }
}

/// Locks an order row, optionally scoped to its owner.
///
/// Touches the row first so SQLite takes the writer lock before any read,
/// as `inventory_reservation::lock_cart` does for carts.
async fn lock_order<C>(
    conn: &C,
    order_id: Uuid,
    owner: Option<Uuid>,
) -> Result<order::Model, ServiceError>
where
    C: ConnectionTrait,
{
    let mut touch = order::Entity::update_many()
        .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(order::Column::Id.eq(order_id));
    let mut find = order::Entity::find_by_id(order_id);
    if let Some(user_id) = owner {
        touch = touch.filter(order::Column::UserId.eq(user_id));
        find = find.filter(order::Column::UserId.eq(user_id));
    }

    touch.exec(conn).await?;
    find.lock_exclusive()
        .one(conn)
        .await?
        .ok_or_else(|| order_not_found(order_id))
}

pub(crate) async fn load_items<C>(
    conn: &C,
    order_id: Uuid,
) -> Result<Vec<order_item::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    Ok(order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .order_by_asc(order_item::Column::CreatedAt)
        .order_by_asc(order_item::Column::ProductName)
        .all(conn)
        .await?
        .into_iter()
        .map(normalize_item)
        .collect())
}

fn order_not_found(order_id: Uuid) -> ServiceError {
    ServiceError::NotFound(format!("Order {} not found", order_id))
}

/// Money columns come back from some backends without their scale.
pub(crate) fn normalize_order(mut order: order::Model) -> order::Model {
    order.subtotal = money(order.subtotal);
    order.tax = money(order.tax);
    order.discount = money(order.discount);
    order.total = money(order.total);
    order
}

pub(crate) fn normalize_item(mut item: order_item::Model) -> order_item::Model {
    item.product_price = money(item.product_price);
    item.total_price = money(item.total_price);
    item
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::PaymentMethod;
    use rust_decimal_macros::dec;
    use sea_orm::{DbBackend, MockDatabase, MockExecResult};
    use tokio::sync::mpsc;

    fn pending_order(user_id: Uuid) -> order::Model {
        let now = Utc::now();
        order::Model {
            id: Uuid::new_v4(),
            order_number: "ORD-00000000AA".to_string(),
            user_id,
            mall_id: None,
            status: OrderStatus::Pending,
            payment_status: PaymentStatus::Pending,
            payment_method: PaymentMethod::Card,
            subtotal: dec!(100.00),
            tax: dec!(18.00),
            discount: dec!(10.00),
            total: dec!(108.00),
            created_at: now,
            updated_at: now,
        }
    }

    fn exec(rows_affected: u64) -> MockExecResult {
        MockExecResult {
            last_insert_id: 0,
            rows_affected,
        }
    }

    #[tokio::test]
    async fn cancel_bounds_lock_waits_before_locking_the_order() {
        let user_id = Uuid::new_v4();
        let pending = pending_order(user_id);
        let cancelled = order::Model {
            status: OrderStatus::Cancelled,
            ..pending.clone()
        };

        let db = Arc::new(
            MockDatabase::new(DbBackend::Postgres)
                .append_exec_results([exec(0), exec(1)])
                .append_query_results([vec![pending.clone()], vec![cancelled]])
                .into_connection(),
        );
        let config = AppConfig::new(
            "postgres://localhost/paymall".to_string(),
            "127.0.0.1".to_string(),
            8080,
            "test".to_string(),
        );
        let expected = format!(
            "SET LOCAL lock_timeout = '{}ms'",
            config.checkout_lock_timeout_ms
        );
        let (tx, _rx) = mpsc::channel(16);
        let service =
            OrderService::new(db.clone(), Arc::new(EventSender::new(tx)), Arc::new(config));

        let updated = service.cancel(pending.id, user_id).await.unwrap();
        assert_eq!(updated.status, OrderStatus::Cancelled);

        drop(service);
        let db = Arc::try_unwrap(db).ok().expect("service released the pool");
        let log = format!("{:?}", db.into_transaction_log());
        let timeout_at = log.find(&expected).expect("lock timeout was not set");
        let lock_at = log.find("FOR UPDATE").expect("order row was not locked");
        assert!(timeout_at < lock_at);
    }
}
