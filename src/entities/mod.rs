pub mod cart;
pub mod cart_item;
pub mod mall;
pub mod order;
pub mod order_item;
pub mod product; // Catalog backing table and the stock rows checkout locks

pub use order::{OrderStatus, PaymentMethod, PaymentStatus};
