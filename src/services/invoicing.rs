use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::entities::PaymentMethod;
use crate::services::order_service::OrderWithItems;

pub const INVOICE_TITLE: &str = "PayMall Invoice";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub quantity: i32,
    pub description: String,
    pub unit_price: Decimal,
    pub amount: Decimal,
}

/// Everything a renderer needs, taken from the stored order only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub title: String,
    pub order_number: String,
    pub file_name: String,
    /// e.g. `05 Mar 2024`
    pub issued_on: String,
    pub payment_method: PaymentMethod,
    pub lines: Vec<InvoiceLine>,
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
}

impl Invoice {
    pub fn from_order(source: &OrderWithItems) -> Self {
        let order = &source.order;
        Self {
            title: INVOICE_TITLE.to_string(),
            order_number: order.order_number.clone(),
            file_name: format!("invoice_{}.pdf", order.order_number),
            issued_on: order.created_at.format("%d %b %Y").to_string(),
            payment_method: order.payment_method,
            lines: source
                .items
                .iter()
                .map(|item| InvoiceLine {
                    quantity: item.quantity,
                    description: item.product_name.clone(),
                    unit_price: item.product_price,
                    amount: item.total_price,
                })
                .collect(),
            subtotal: order.subtotal,
            tax: order.tax,
            discount: order.discount,
            total: order.total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{order, order_item, OrderStatus, PaymentStatus};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    #[test]
    fn invoice_reflects_stored_snapshot() {
        let created_at = Utc.with_ymd_and_hms(2024, 3, 5, 10, 30, 0).unwrap();
        let order_id = Uuid::new_v4();
        let source = OrderWithItems {
            order: order::Model {
                id: order_id,
                order_number: "ORD-0A1B2C3D4E".into(),
                user_id: Uuid::new_v4(),
                mall_id: None,
                status: OrderStatus::Pending,
                payment_status: PaymentStatus::Paid,
                payment_method: PaymentMethod::Upi,
                subtotal: dec!(250.00),
                tax: dec!(45.00),
                discount: dec!(25.00),
                total: dec!(270.00),
                created_at,
                updated_at: created_at,
            },
            items: vec![order_item::Model {
                id: Uuid::new_v4(),
                order_id,
                product_id: None,
                product_name: "Green Tea".into(),
                product_price: dec!(125.00),
                product_barcode: "111".into(),
                quantity: 2,
                total_price: dec!(250.00),
                created_at,
            }],
        };

        let invoice = Invoice::from_order(&source);
        assert_eq!(invoice.file_name, "invoice_ORD-0A1B2C3D4E.pdf");
        assert_eq!(invoice.issued_on, "05 Mar 2024");
        assert_eq!(invoice.lines.len(), 1);
        assert_eq!(invoice.lines[0].description, "Green Tea");
        assert_eq!(invoice.lines[0].amount, dec!(250.00));
        assert_eq!(invoice.total, dec!(270.00));
    }
}
