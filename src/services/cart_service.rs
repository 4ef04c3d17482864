use crate::{
    config::AppConfig,
    entities::{cart, cart_item},
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        catalog::{Catalog, ProductSnapshot},
        pricing::{line_total, money, CartTotals},
    },
};
use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set, SqlErr,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Per-user shopping cart.
///
/// Lines hold only `(product, quantity)`; every read prices them against the
/// live catalog. Stock checks here are advisory: they read without locking and
/// only spare the shopper a doomed checkout. The authoritative check runs in
/// [`crate::services::inventory_reservation`].
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    catalog: Arc<dyn Catalog>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
}

/// One priced cart line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartLineView {
    pub id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub barcode: String,
    pub mall_id: Uuid,
    pub unit_price: Decimal,
    pub quantity: i32,
    pub line_total: Decimal,
    /// Live stock, for display only
    pub stock: i32,
    pub available: bool,
}

/// A cart priced against the live catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartView {
    pub cart_id: Uuid,
    pub user_id: Uuid,
    pub lines: Vec<CartLineView>,
    /// Number of distinct lines
    pub total_items: usize,
    #[serde(flatten)]
    pub totals: CartTotals,
}

impl CartService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        catalog: Arc<dyn Catalog>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            db,
            catalog,
            event_sender,
            config,
        }
    }

    /// Returns the user's cart, creating it on first access.
    ///
    /// Two concurrent first accesses race on the unique `user_id`; the loser
    /// re-reads the winner's row, so a user never ends up with two carts.
    #[instrument(skip(self))]
    pub async fn get_or_create_cart(&self, user_id: Uuid) -> Result<cart::Model, ServiceError> {
        if let Some(existing) = self.find_cart(user_id).await? {
            return Ok(existing);
        }

        let now = Utc::now();
        let new_cart = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match new_cart.insert(&*self.db).await {
            Ok(created) => {
                info!(cart_id = %created.id, "Created cart");
                Ok(created)
            }
            Err(err) if is_unique_violation(&err) => self
                .find_cart(user_id)
                .await?
                .ok_or_else(|| ServiceError::InternalError("cart vanished after conflict".into())),
            Err(err) => Err(err.into()),
        }
    }

    #[instrument(skip(self))]
    pub async fn get_cart(&self, user_id: Uuid) -> Result<CartView, ServiceError> {
        let cart = self.get_or_create_cart(user_id).await?;
        self.build_view(&cart).await
    }

    /// Adds `quantity` of a product, merging into an existing line for the
    /// same product. The merged quantity is what gets checked against stock.
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartView, ServiceError> {
        ensure_positive(quantity)?;
        let product = self.catalog.get(product_id).await?;
        self.add_product(user_id, product, quantity).await
    }

    /// Barcode scan flow. Behaves exactly like [`Self::add_item`].
    #[instrument(skip(self))]
    pub async fn add_item_by_barcode(
        &self,
        user_id: Uuid,
        barcode: &str,
        quantity: i32,
    ) -> Result<CartView, ServiceError> {
        ensure_positive(quantity)?;
        let product = self.catalog.get_by_barcode(barcode.trim()).await?;
        self.add_product(user_id, product, quantity).await
    }

    async fn add_product(
        &self,
        user_id: Uuid,
        product: ProductSnapshot,
        quantity: i32,
    ) -> Result<CartView, ServiceError> {
        if !product.available {
            return Err(ServiceError::NotFound(format!(
                "Product {} is not available",
                product.id
            )));
        }
        if product.stock < quantity {
            return Err(ServiceError::insufficient_stock(
                product.id,
                &product.name,
                quantity,
                product.stock,
            ));
        }

        let cart = self.get_or_create_cart(user_id).await?;
        let lines = self.load_lines(cart.id).await?;

        if !self.config.allow_mixed_mall_carts {
            self.ensure_same_mall(&lines, &product).await?;
        }

        let existing = lines.iter().find(|line| line.product_id == product.id);
        let saved = match existing {
            Some(line) => {
                let merged = line.quantity.checked_add(quantity).ok_or_else(|| {
                    ServiceError::InvalidInput("Quantity is too large".to_string())
                })?;
                if merged > product.stock {
                    return Err(ServiceError::insufficient_stock(
                        product.id,
                        &product.name,
                        merged,
                        product.stock,
                    ));
                }
                self.set_line_quantity(line.clone(), merged).await?
            }
            None => self.insert_line(cart.id, &product, quantity).await?,
        };

        counter!("paymall_cart_items_added_total", 1);
        self.event_sender
            .send_or_log(Event::CartItemAdded {
                cart_id: cart.id,
                product_id: product.id,
                quantity,
            })
            .await;
        info!(cart_id = %cart.id, line_id = %saved.id, quantity = saved.quantity, "Added item to cart");

        self.build_view(&cart).await
    }

    /// Inserts a new line. If another request inserted the same product in the
    /// meantime, the quantities are merged into that line instead.
    async fn insert_line(
        &self,
        cart_id: Uuid,
        product: &ProductSnapshot,
        quantity: i32,
    ) -> Result<cart_item::Model, ServiceError> {
        let now = Utc::now();
        let line = cart_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            cart_id: Set(cart_id),
            product_id: Set(product.id),
            quantity: Set(quantity),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match line.insert(&*self.db).await {
            Ok(inserted) => Ok(inserted),
            Err(err) if is_unique_violation(&err) => {
                let winner = cart_item::Entity::find()
                    .filter(cart_item::Column::CartId.eq(cart_id))
                    .filter(cart_item::Column::ProductId.eq(product.id))
                    .one(&*self.db)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::InternalError("cart line vanished after conflict".into())
                    })?;
                let merged = winner.quantity.saturating_add(quantity);
                if merged > product.stock {
                    return Err(ServiceError::insufficient_stock(
                        product.id,
                        &product.name,
                        merged,
                        product.stock,
                    ));
                }
                self.set_line_quantity(winner, merged).await
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Replaces a line's quantity.
    #[instrument(skip(self))]
    pub async fn update_item_quantity(
        &self,
        user_id: Uuid,
        line_id: Uuid,
        quantity: i32,
    ) -> Result<CartView, ServiceError> {
        ensure_positive(quantity)?;
        let cart = self.get_or_create_cart(user_id).await?;
        let line = self.find_line(cart.id, line_id).await?;

        let product = self.catalog.get(line.product_id).await?;
        if quantity > product.stock {
            return Err(ServiceError::insufficient_stock(
                product.id,
                &product.name,
                quantity,
                product.stock,
            ));
        }

        self.set_line_quantity(line, quantity).await?;
        self.event_sender
            .send_or_log(Event::CartItemUpdated {
                cart_id: cart.id,
                item_id: line_id,
                quantity,
            })
            .await;

        self.build_view(&cart).await
    }

    #[instrument(skip(self))]
    pub async fn remove_item(&self, user_id: Uuid, line_id: Uuid) -> Result<CartView, ServiceError> {
        let cart = self.get_or_create_cart(user_id).await?;
        let result = cart_item::Entity::delete_many()
            .filter(cart_item::Column::Id.eq(line_id))
            .filter(cart_item::Column::CartId.eq(cart.id))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!(
                "Cart item {} not found",
                line_id
            )));
        }

        self.event_sender
            .send_or_log(Event::CartItemRemoved {
                cart_id: cart.id,
                item_id: line_id,
            })
            .await;

        self.build_view(&cart).await
    }

    #[instrument(skip(self))]
    pub async fn clear_cart(&self, user_id: Uuid) -> Result<CartView, ServiceError> {
        let cart = self.get_or_create_cart(user_id).await?;
        let result = cart_item::Entity::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .exec(&*self.db)
            .await?;

        if result.rows_affected > 0 {
            self.event_sender
                .send_or_log(Event::CartCleared(cart.id))
                .await;
        }

        self.build_view(&cart).await
    }

    async fn find_cart(&self, user_id: Uuid) -> Result<Option<cart::Model>, ServiceError> {
        Ok(cart::Entity::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await?)
    }

    async fn find_line(&self, cart_id: Uuid, line_id: Uuid) -> Result<cart_item::Model, ServiceError> {
        cart_item::Entity::find_by_id(line_id)
            .filter(cart_item::Column::CartId.eq(cart_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart item {} not found", line_id)))
    }

    async fn load_lines(&self, cart_id: Uuid) -> Result<Vec<cart_item::Model>, ServiceError> {
        Ok(cart_item::Entity::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    async fn set_line_quantity(
        &self,
        line: cart_item::Model,
        quantity: i32,
    ) -> Result<cart_item::Model, ServiceError> {
        let mut active: cart_item::ActiveModel = line.into();
        active.quantity = Set(quantity);
        active.updated_at = Set(Utc::now());
        Ok(active.update(&*self.db).await?)
    }

    async fn ensure_same_mall(
        &self,
        lines: &[cart_item::Model],
        incoming: &ProductSnapshot,
    ) -> Result<(), ServiceError> {
        let ids: Vec<Uuid> = lines
            .iter()
            .map(|line| line.product_id)
            .filter(|id| *id != incoming.id)
            .collect();
        let malls: BTreeSet<Uuid> = self
            .catalog
            .get_many(&ids)
            .await?
            .into_iter()
            .map(|product| product.mall_id)
            .collect();

        match malls.iter().find(|mall| **mall != incoming.mall_id) {
            Some(cart_mall) => Err(ServiceError::InvalidInput(format!(
                "Cart holds products from mall {}; product {} belongs to mall {}",
                cart_mall, incoming.id, incoming.mall_id
            ))),
            None => Ok(()),
        }
    }

    async fn build_view(&self, cart: &cart::Model) -> Result<CartView, ServiceError> {
        let lines = self.load_lines(cart.id).await?;
        let ids: Vec<Uuid> = lines.iter().map(|line| line.product_id).collect();
        let products: HashMap<Uuid, ProductSnapshot> = self
            .catalog
            .get_many(&ids)
            .await?
            .into_iter()
            .map(|product| (product.id, product))
            .collect();

        let lines: Vec<CartLineView> = lines
            .into_iter()
            .filter_map(|line| {
                let product = products.get(&line.product_id)?;
                Some(CartLineView {
                    id: line.id,
                    product_id: product.id,
                    product_name: product.name.clone(),
                    barcode: product.barcode.clone(),
                    mall_id: product.mall_id,
                    unit_price: money(product.price),
                    quantity: line.quantity,
                    line_total: money(line_total(product.price, line.quantity)),
                    stock: product.stock,
                    available: product.available,
                })
            })
            .collect();

        let totals = self
            .config
            .pricing_policy()
            .totals(lines.iter().map(|line| (line.unit_price, line.quantity)));

        Ok(CartView {
            cart_id: cart.id,
            user_id: cart.user_id,
            total_items: lines.len(),
            lines,
            totals,
        })
    }
}

fn ensure_positive(quantity: i32) -> Result<(), ServiceError> {
    if quantity <= 0 {
        return Err(ServiceError::InvalidInput(
            "Quantity must be a positive integer".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::catalog::MockCatalog;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;

    fn snapshot(stock: i32, available: bool) -> ProductSnapshot {
        ProductSnapshot {
            id: Uuid::new_v4(),
            mall_id: Uuid::new_v4(),
            name: "Basmati Rice 1kg".into(),
            barcode: "8901234567890".into(),
            price: dec!(100),
            stock,
            available,
        }
    }

    fn service(catalog: MockCatalog) -> CartService {
        // Every case below fails before touching the database.
        let db = DatabaseConnection::Disconnected;
        let (tx, _rx) = mpsc::channel(8);
        CartService::new(
            Arc::new(db),
            Arc::new(catalog),
            Arc::new(EventSender::new(tx)),
            Arc::new(AppConfig::new(
                "sqlite::memory:".into(),
                "127.0.0.1".into(),
                8080,
                "test".into(),
            )),
        )
    }

    #[tokio::test]
    async fn rejects_non_positive_quantity_without_lookup() {
        let mut catalog = MockCatalog::new();
        catalog.expect_get().never();
        let svc = service(catalog);

        assert_matches!(
            svc.add_item(Uuid::new_v4(), Uuid::new_v4(), 0).await,
            Err(ServiceError::InvalidInput(_))
        );
        assert_matches!(
            svc.add_item(Uuid::new_v4(), Uuid::new_v4(), -3).await,
            Err(ServiceError::InvalidInput(_))
        );
    }

    #[tokio::test]
    async fn unavailable_product_is_not_found() {
        let product = snapshot(10, false);
        let mut catalog = MockCatalog::new();
        let returned = product.clone();
        catalog
            .expect_get()
            .returning(move |_| Ok(returned.clone()));

        let result = service(catalog).add_item(Uuid::new_v4(), product.id, 1).await;
        assert_matches!(result, Err(ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn quantity_above_stock_names_the_product() {
        let product = snapshot(2, true);
        let mut catalog = MockCatalog::new();
        let returned = product.clone();
        catalog
            .expect_get()
            .returning(move |_| Ok(returned.clone()));

        let result = service(catalog).add_item(Uuid::new_v4(), product.id, 3).await;
        assert_matches!(
            result,
            Err(ServiceError::InsufficientStock { product_id, requested: 3, available: 2, .. })
                if product_id == product.id
        );
    }

    #[tokio::test]
    async fn unknown_barcode_propagates_not_found() {
        let mut catalog = MockCatalog::new();
        catalog
            .expect_get_by_barcode()
            .withf(|barcode| barcode == "000")
            .returning(|_| Err(ServiceError::NotFound("no such barcode".into())));

        let result = service(catalog)
            .add_item_by_barcode(Uuid::new_v4(), " 000 ", 1)
            .await;
        assert_matches!(result, Err(ServiceError::NotFound(_)));
    }

    #[test]
    fn unique_violation_detection_ignores_other_errors() {
        assert!(!is_unique_violation(&DbErr::Custom("boom".into())));
    }
}
