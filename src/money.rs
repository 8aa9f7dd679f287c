//! Integer-cents money arithmetic.
//!
//! The core computes all monetary amounts in integer cents; decimal values
//! exist only at the external edge (seller price entry, reporting). Every
//! arithmetic path is checked so overflow surfaces as a typed error instead
//! of silently wrapping.

use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::errors::ServiceError;

pub type Cents = i64;

/// Basis points divisor: 825 bps = 8.25%.
const BASIS_POINTS_SCALE: i64 = 10_000;

/// `quantity * unit_price`, checked.
pub fn line_total(quantity: i32, unit_price_cents: Cents) -> Result<Cents, ServiceError> {
    (quantity as i64)
        .checked_mul(unit_price_cents)
        .ok_or_else(|| ServiceError::InternalError("line total overflow".to_string()))
}

/// Sum of line totals, checked.
pub fn subtotal(lines: impl IntoIterator<Item = (i32, Cents)>) -> Result<Cents, ServiceError> {
    let mut acc: Cents = 0;
    for (quantity, unit_price_cents) in lines {
        let line = line_total(quantity, unit_price_cents)?;
        acc = acc
            .checked_add(line)
            .ok_or_else(|| ServiceError::InternalError("subtotal overflow".to_string()))?;
    }
    Ok(acc)
}

/// Tax on a subtotal at the configured basis-point rate, truncated toward
/// zero. 2000 cents at 825 bps yields 165 cents.
pub fn tax_for(subtotal_cents: Cents, rate_basis_points: u32) -> Result<Cents, ServiceError> {
    subtotal_cents
        .checked_mul(rate_basis_points as i64)
        .map(|v| v / BASIS_POINTS_SCALE)
        .ok_or_else(|| ServiceError::InternalError("tax computation overflow".to_string()))
}

/// `subtotal + tax + shipping`, checked. Always recomputed from parts; the
/// total is never incremented in place.
pub fn order_total(
    subtotal_cents: Cents,
    tax_cents: Cents,
    shipping_cents: Cents,
) -> Result<Cents, ServiceError> {
    subtotal_cents
        .checked_add(tax_cents)
        .and_then(|v| v.checked_add(shipping_cents))
        .ok_or_else(|| ServiceError::InternalError("order total overflow".to_string()))
}

/// Decimal dollars for external presentation.
pub fn cents_to_decimal(cents: Cents) -> Decimal {
    Decimal::new(cents, 2)
}

/// Parse an externally supplied decimal dollar amount into cents. Rejects
/// negative amounts and sub-cent precision.
pub fn decimal_to_cents(amount: Decimal) -> Result<Cents, ServiceError> {
    if amount.is_sign_negative() {
        return Err(ServiceError::ValidationError(
            "amount must not be negative".to_string(),
        ));
    }
    let scaled = amount
        .checked_mul(Decimal::new(100, 0))
        .ok_or_else(|| ServiceError::ValidationError("amount out of range".to_string()))?;
    if scaled.fract() != Decimal::ZERO {
        return Err(ServiceError::ValidationError(
            "amount has sub-cent precision".to_string(),
        ));
    }
    scaled
        .to_i64()
        .ok_or_else(|| ServiceError::ValidationError("amount out of range".to_string()))
}
