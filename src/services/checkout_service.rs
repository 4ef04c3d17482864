use crate::{
    config::AppConfig,
    db::{set_lock_timeout, with_retry, BusyRetryPolicy, RetryConfig},
    entities::{cart_item, order, order_item, product, OrderStatus, PaymentMethod, PaymentStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        cart_service::is_unique_violation,
        inventory_reservation::{self, ReservedLine},
        order_service::{normalize_item, normalize_order, OrderWithItems},
        pricing::{line_total, money},
    },
};
use chrono::Utc;
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Produces a candidate order number from the configured prefix.
pub type OrderNumberFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CheckoutInput {
    /// `card` (or `credit`), `upi` or `cash`, case-insensitive
    #[validate(length(min = 1, max = 20))]
    pub payment_method: String,
    /// Payment already settled at the till
    #[serde(default)]
    pub payment_captured: bool,
}

/// Cart-to-order conversion.
///
/// One checkout is one transaction: lock the cart, lock and decrement stock,
/// write the order and its item snapshots, empty the cart. Any failure rolls
/// all of it back. Lock contention and timeouts surface as `Busy` and are
/// retried with backoff before reaching the caller.
#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
    order_numbers: OrderNumberFn,
}

struct Committed {
    order: OrderWithItems,
    cart_id: Uuid,
    reserved: Vec<ReservedLine>,
}

impl CheckoutService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            db,
            event_sender,
            config,
            order_numbers: Arc::new(generate_order_number),
        }
    }

    /// Replaces the order number source.
    pub fn with_order_numbers(mut self, order_numbers: OrderNumberFn) -> Self {
        self.order_numbers = order_numbers;
        self
    }

    #[instrument(skip(self, input), fields(payment_method = %input.payment_method))]
    pub async fn checkout(
        &self,
        user_id: Uuid,
        input: CheckoutInput,
    ) -> Result<OrderWithItems, ServiceError> {
        input.validate()?;
        let payment_method = parse_payment_method(&input.payment_method)?;
        let payment_status = if input.payment_captured {
            PaymentStatus::Paid
        } else {
            PaymentStatus::Pending
        };

        let retry = RetryConfig::with_max_attempts(self.config.checkout_max_attempts);
        let outcome = with_retry(&retry, BusyRetryPolicy, || {
            self.attempt(user_id, payment_method, payment_status)
        })
        .await;

        match outcome {
            Ok(committed) => {
                counter!("paymall_checkout_total", 1, "outcome" => "success");
                self.publish(&committed).await;
                info!(
                    order_id = %committed.order.order.id,
                    order_number = %committed.order.order.order_number,
                    total = %committed.order.order.total,
                    "Checkout completed"
                );
                Ok(committed.order)
            }
            Err(err) => {
                counter!("paymall_checkout_total", 1, "outcome" => err.code());
                Err(err)
            }
        }
    }

    /// One attempt. The deadline covers everything up to COMMIT; the commit
    /// itself always runs to completion so its outcome is never lost.
    async fn attempt(
        &self,
        user_id: Uuid,
        payment_method: PaymentMethod,
        payment_status: PaymentStatus,
    ) -> Result<Committed, ServiceError> {
        let txn = self.db.begin().await?;
        set_lock_timeout(&txn, self.config.checkout_lock_timeout()).await?;

        let staged = tokio::time::timeout(
            self.config.checkout_timeout(),
            self.stage(&txn, user_id, payment_method, payment_status),
        )
        .await;

        let committed = match staged {
            Ok(result) => result?,
            Err(_) => {
                txn.rollback().await?;
                return Err(ServiceError::Busy(format!(
                    "checkout did not finish within {:?}",
                    self.config.checkout_timeout()
                )));
            }
        };

        txn.commit().await?;
        Ok(committed)
    }

    /// Everything a checkout writes, left uncommitted on `txn`.
    async fn stage(
        &self,
        txn: &DatabaseTransaction,
        user_id: Uuid,
        payment_method: PaymentMethod,
        payment_status: PaymentStatus,
    ) -> Result<Committed, ServiceError> {
        let cart = inventory_reservation::lock_cart(txn, user_id)
            .await?
            .ok_or(ServiceError::EmptyCart)?;

        let lines = cart_item::Entity::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .all(txn)
            .await?;
        if lines.is_empty() {
            return Err(ServiceError::EmptyCart);
        }

        let reserved = inventory_reservation::reserve(
            txn,
            lines.iter().map(|line| (line.product_id, line.quantity)),
        )
        .await?;

        let locked: HashMap<Uuid, &product::Model> = reserved
            .iter()
            .map(|line| (line.product.id, &line.product))
            .collect();
        let priced: Vec<(&cart_item::Model, &product::Model)> = lines
            .iter()
            .map(|line| {
                locked
                    .get(&line.product_id)
                    .map(|product| (line, *product))
                    .ok_or_else(|| {
                        ServiceError::InternalError(format!(
                            "product {} was not reserved",
                            line.product_id
                        ))
                    })
            })
            .collect::<Result<_, _>>()?;

        let totals = self
            .config
            .pricing_policy()
            .totals(priced.iter().map(|(line, product)| (product.price, line.quantity)));
        let mall_id = originating_mall(priced.iter().map(|(_, product)| product.mall_id));

        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let header = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(String::new()),
            user_id: Set(user_id),
            mall_id: Set(mall_id),
            status: Set(OrderStatus::Pending),
            payment_status: Set(payment_status),
            payment_method: Set(payment_method),
            subtotal: Set(totals.subtotal),
            tax: Set(totals.tax_amount),
            discount: Set(totals.discount_amount),
            total: Set(totals.total_amount),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let order = self.insert_with_unique_number(txn, header).await?;

        let mut items = Vec::with_capacity(priced.len());
        for (line, product) in &priced {
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(Some(product.id)),
                product_name: Set(product.name.clone()),
                product_price: Set(money(product.price)),
                product_barcode: Set(product.barcode.clone()),
                quantity: Set(line.quantity),
                total_price: Set(money(line_total(product.price, line.quantity))),
                created_at: Set(now),
            }
            .insert(txn)
            .await?;
            items.push(normalize_item(item));
        }

        cart_item::Entity::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .exec(txn)
            .await?;

        Ok(Committed {
            order: OrderWithItems {
                order: normalize_order(order),
                items,
            },
            cart_id: cart.id,
            reserved,
        })
    }

    /// Inserts the header under a savepoint, drawing a fresh number whenever
    /// the previous one collides.
    async fn insert_with_unique_number(
        &self,
        txn: &DatabaseTransaction,
        header: order::ActiveModel,
    ) -> Result<order::Model, ServiceError> {
        let max_attempts = self.config.order_number_max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let number = (self.order_numbers)(&self.config.order_number_prefix);
            let mut candidate = header.clone();
            candidate.order_number = Set(number.clone());

            let savepoint = txn.begin().await?;
            match candidate.insert(&savepoint).await {
                Ok(inserted) => {
                    savepoint.commit().await?;
                    return Ok(inserted);
                }
                Err(err) if is_unique_violation(&err) => {
                    savepoint.rollback().await?;
                    warn!(attempt, order_number = %number, "order number collision");
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(ServiceError::Busy(format!(
            "no unique order number after {} attempts",
            max_attempts
        )))
    }

    async fn publish(&self, committed: &Committed) {
        let order = &committed.order.order;
        self.event_sender
            .send_or_log(Event::OrderCreated {
                order_id: order.id,
                order_number: order.order_number.clone(),
                user_id: order.user_id,
                total: order.total,
                created_at: order.created_at,
            })
            .await;
        for line in &committed.reserved {
            self.event_sender
                .send_or_log(Event::StockDecremented {
                    product_id: line.product.id,
                    quantity: line.quantity,
                    order_id: order.id,
                })
                .await;
        }
        self.event_sender
            .send_or_log(Event::CartCleared(committed.cart_id))
            .await;
    }
}

pub fn parse_payment_method(raw: &str) -> Result<PaymentMethod, ServiceError> {
    PaymentMethod::from_str(raw.trim()).map_err(|_| {
        ServiceError::InvalidInput(format!(
            "Unsupported payment method '{}'; expected card, upi or cash",
            raw
        ))
    })
}

/// `{prefix}-{10 upper-case hex digits}` from a fresh v4 UUID.
pub fn generate_order_number(prefix: &str) -> String {
    let mut buf = Uuid::encode_buffer();
    let hex = Uuid::new_v4().simple().encode_upper(&mut buf);
    format!("{}-{}", prefix, &hex[..10])
}

/// The mall every line shares, if there is exactly one.
fn originating_mall<I>(malls: I) -> Option<Uuid>
where
    I: IntoIterator<Item = Uuid>,
{
    let distinct: BTreeSet<Uuid> = malls.into_iter().collect();
    if distinct.len() == 1 {
        distinct.into_iter().next()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn order_numbers_are_prefixed_upper_hex() {
        let number = generate_order_number("ORD");
        let (prefix, hex) = number.split_once('-').unwrap();
        assert_eq!(prefix, "ORD");
        assert_eq!(hex.len(), 10);
        assert!(hex
            .chars()
            .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
        assert_ne!(generate_order_number("ORD"), generate_order_number("ORD"));
    }

    #[test]
    fn payment_methods_parse_at_the_boundary() {
        assert_eq!(parse_payment_method(" Card ").unwrap(), PaymentMethod::Card);
        assert_eq!(parse_payment_method("credit").unwrap(), PaymentMethod::Card);
        assert_eq!(parse_payment_method("UPI").unwrap(), PaymentMethod::Upi);
        assert_matches!(
            parse_payment_method("cheque"),
            Err(ServiceError::InvalidInput(_))
        );
    }

    #[test]
    fn mall_is_kept_only_when_shared() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(originating_mall([a, a]), Some(a));
        assert_eq!(originating_mall([a, b]), None);
        assert_eq!(originating_mall(std::iter::empty()), None);
    }
}
