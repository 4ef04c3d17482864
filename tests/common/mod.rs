#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::Utc;
use paymall_api::{
    config::AppConfig,
    db,
    entities::{mall, product},
    events,
    handlers::common::USER_ID_HEADER,
    services::{CartService, CheckoutInput, CheckoutService, OrderService},
    AppState,
};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

/// Application state over a throwaway SQLite file with migrations applied.
///
/// The pool holds a single connection unless a test raises
/// `db_max_connections`; tests that do exercise SQLite's writer lock across
/// connections.
pub struct TestApp {
    pub state: AppState,
    _dir: TempDir,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(customize: impl FnOnce(&mut AppConfig)) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let db_path = dir.path().join("paymall_test.db");

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.db_acquire_timeout_secs = 30;
        customize(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let (state, event_rx) = AppState::build(Arc::new(pool), cfg);
        let event_task = tokio::spawn(events::process_events(event_rx));

        Self {
            state,
            _dir: dir,
            _event_task: event_task,
        }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.state.db
    }

    pub fn cart(&self) -> &CartService {
        &self.state.services.cart
    }

    pub fn checkout(&self) -> &CheckoutService {
        &self.state.services.checkout
    }

    pub fn orders(&self) -> &OrderService {
        &self.state.services.orders
    }

    /// A checkout service sharing this app's pool and config.
    pub fn checkout_service(&self) -> CheckoutService {
        CheckoutService::new(
            self.state.db.clone(),
            self.state.event_sender.clone(),
            self.state.config.clone(),
        )
    }

    pub fn router(&self) -> Router {
        paymall_api::app_router(self.state.clone())
    }

    pub async fn seed_mall(&self, name: &str) -> mall::Model {
        mall::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            is_active: Set(true),
            created_at: Set(Utc::now()),
        }
        .insert(self.db())
        .await
        .expect("seed mall")
    }

    pub async fn seed_product(
        &self,
        mall_id: Uuid,
        name: &str,
        price: Decimal,
        stock: i32,
    ) -> product::Model {
        let now = Utc::now();
        let mut barcode = Uuid::new_v4().simple().to_string();
        barcode.truncate(13);
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            mall_id: Set(mall_id),
            name: Set(name.to_string()),
            barcode: Set(barcode),
            price: Set(price),
            stock_quantity: Set(stock),
            is_available: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db())
        .await
        .expect("seed product")
    }

    pub async fn product(&self, product_id: Uuid) -> product::Model {
        product::Entity::find_by_id(product_id)
            .one(self.db())
            .await
            .expect("load product")
            .expect("product exists")
    }

    pub async fn stock_of(&self, product_id: Uuid) -> i32 {
        self.product(product_id).await.stock_quantity
    }

    pub async fn set_price(&self, product_id: Uuid, price: Decimal) {
        let mut active: product::ActiveModel = self.product(product_id).await.into();
        active.price = Set(price);
        active.update(self.db()).await.expect("update price");
    }

    pub async fn set_available(&self, product_id: Uuid, available: bool) {
        let mut active: product::ActiveModel = self.product(product_id).await.into();
        active.is_available = Set(available);
        active.update(self.db()).await.expect("update availability");
    }

    pub async fn set_stock(&self, product_id: Uuid, stock: i32) {
        let mut active: product::ActiveModel = self.product(product_id).await.into();
        active.stock_quantity = Set(stock);
        active.update(self.db()).await.expect("update stock");
    }

    /// Sends a request through the full router and returns status and JSON body.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        user_id: Option<Uuid>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user_id) = user_id {
            builder = builder.header(USER_ID_HEADER, user_id.to_string());
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("build request");

        let response = self.router().oneshot(request).await.expect("router call");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }
}

pub fn card() -> CheckoutInput {
    CheckoutInput {
        payment_method: "card".to_string(),
        payment_captured: false,
    }
}

pub fn paid_with(method: &str) -> CheckoutInput {
    CheckoutInput {
        payment_method: method.to_string(),
        payment_captured: true,
    }
}
