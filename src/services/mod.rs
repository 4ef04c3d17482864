// Catalog seam and pricing rules
pub mod catalog;
pub mod pricing;

// Pre-checkout cart
pub mod cart_service;

// Cart-to-order conversion
pub mod checkout_service;
pub mod inventory_reservation;

// Post-checkout lifecycle
pub mod invoicing;
pub mod order_service;

pub use cart_service::{CartLineView, CartService, CartView};
pub use catalog::{Catalog, DbCatalog, ProductSnapshot};
pub use checkout_service::{CheckoutInput, CheckoutService};
pub use invoicing::Invoice;
pub use order_service::{OrderService, OrderWithItems};
pub use pricing::{CartTotals, PricingPolicy};
