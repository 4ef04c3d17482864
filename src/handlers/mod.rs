pub mod carts;
pub mod common;
pub mod health;
pub mod orders;

use crate::{
    config::AppConfig,
    events::EventSender,
    services::{CartService, Catalog, CheckoutService, DbCatalog, OrderService},
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub cart: Arc<CartService>,
    pub checkout: Arc<CheckoutService>,
    pub orders: Arc<OrderService>,
}

impl AppServices {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
    ) -> Self {
        let catalog: Arc<dyn Catalog> = Arc::new(DbCatalog::new(db.clone()));
        let cart = Arc::new(CartService::new(
            db.clone(),
            catalog,
            event_sender.clone(),
            config.clone(),
        ));
        let checkout = Arc::new(CheckoutService::new(
            db.clone(),
            event_sender.clone(),
            config.clone(),
        ));
        let orders = Arc::new(OrderService::new(db, event_sender, config));

        Self {
            cart,
            checkout,
            orders,
        }
    }

    /// Swaps in a checkout service built elsewhere, e.g. with a fixed order number source.
    pub fn with_checkout(mut self, checkout: CheckoutService) -> Self {
        self.checkout = Arc::new(checkout);
        self
    }
}
