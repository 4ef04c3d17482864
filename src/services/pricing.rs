use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Cart money figures, all at two decimal places.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartTotals {
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub discount_amount: Decimal,
    pub total_amount: Decimal,
}

impl CartTotals {
    pub fn zero() -> Self {
        Self {
            subtotal: money(Decimal::ZERO),
            tax_amount: money(Decimal::ZERO),
            discount_amount: money(Decimal::ZERO),
            total_amount: money(Decimal::ZERO),
        }
    }
}

/// Tax and discount rates applied to a cart subtotal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricingPolicy {
    pub tax_rate: Decimal,
    pub discount_rate: Decimal,
}

impl PricingPolicy {
    pub fn new(tax_rate: Decimal, discount_rate: Decimal) -> Self {
        Self {
            tax_rate,
            discount_rate,
        }
    }

    /// Prices `(unit_price, quantity)` lines.
    ///
    /// Tax and discount are each rounded to cents with banker's rounding before
    /// the total is formed, so `total == subtotal + tax - discount` holds exactly.
    pub fn totals<I>(&self, lines: I) -> CartTotals
    where
        I: IntoIterator<Item = (Decimal, i32)>,
    {
        let subtotal: Decimal = lines
            .into_iter()
            .map(|(price, quantity)| line_total(price, quantity))
            .sum();

        if subtotal.is_zero() {
            return CartTotals::zero();
        }

        let tax_amount = (subtotal * self.tax_rate).round_dp(2);
        let discount_amount = (subtotal * self.discount_rate).round_dp(2);

        CartTotals {
            subtotal: money(subtotal),
            tax_amount: money(tax_amount),
            discount_amount: money(discount_amount),
            total_amount: money(subtotal + tax_amount - discount_amount),
        }
    }
}

pub fn line_total(price: Decimal, quantity: i32) -> Decimal {
    price * Decimal::from(quantity)
}

/// Normalizes a value to exactly two decimal places for storage and display.
pub fn money(value: Decimal) -> Decimal {
    let mut rounded = value.round_dp(2);
    rounded.rescale(2);
    rounded
}
