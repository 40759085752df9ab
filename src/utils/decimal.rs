//! Decimal arithmetic utilities for quantity and ratio calculations.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Round down to lot size (quantity precision).
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size == Decimal::ZERO {
        return value;
    }
    (value / lot_size).floor() * lot_size
}

/// Number of decimal places allowed by a LOT_SIZE step string.
///
/// `"0.00100000"` -> 3, `"1.00000000"` -> 0, `"10.00000000"` -> -1.
/// Returns `None` when the step has no significant digit.
pub fn lot_precision(step_size: &str) -> Option<i32> {
    let step = step_size.trim();
    let first_one = step.find('1')?;
    let dot = step.find('.').unwrap_or(step.len());

    if first_one < dot {
        // Step >= 1: count integer digits after the leading one
        Some(1 - (dot - first_one) as i32)
    } else {
        Some((first_one - dot) as i32)
    }
}

/// The lot step (`10^-precision`) for a given precision.
pub fn step_for_precision(precision: i32) -> Decimal {
    if precision >= 0 {
        Decimal::new(1, precision.min(28) as u32)
    } else {
        Decimal::from(10i64.pow(precision.unsigned_abs().min(18)))
    }
}

/// Floor a quantity to `precision` decimal places (negative precision floors to tens, hundreds...).
pub fn floor_to_precision(value: Decimal, precision: i32) -> Decimal {
    round_down_to_lot(value, step_for_precision(precision)).normalize()
}

/// Signed percentage change of `value` relative to `base`.
///
/// Returns `None` for a non-positive base.
pub fn percent_change(value: Decimal, base: Decimal) -> Option<Decimal> {
    if base <= Decimal::ZERO {
        return None;
    }
    Some((value - base) / base * dec!(100))
}
