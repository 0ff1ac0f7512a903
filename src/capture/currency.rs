//! Conversion between the major-unit decimals stored on orders and the
//! minor-unit integers the payment gateway speaks.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::errors::ServiceError;

/// ISO 4217 currencies without a minor unit.
const ZERO_DECIMAL_CURRENCIES: [&str; 16] = [
    "BIF", "CLP", "DJF", "GNF", "JPY", "KMF", "KRW", "MGA", "PYG", "RWF", "UGX", "VND", "VUV",
    "XAF", "XOF", "XPF",
];

/// Number of minor-unit digits for `currency_code`.
pub fn minor_unit_exponent(currency_code: &str) -> u32 {
    let code = currency_code.trim().to_ascii_uppercase();
    if ZERO_DECIMAL_CURRENCIES.contains(&code.as_str()) {
        0
    } else {
        2
    }
}

/// Converts a major-unit amount (e.g. `60.00` USD) into minor units (`6000`).
///
/// Every comparison against gateway amounts goes through here.
pub fn to_minor_units(amount: Decimal, currency_code: &str) -> Result<i64, ServiceError> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(ServiceError::ValidationError(format!(
            "amount {} {} is negative",
            amount, currency_code
        )));
    }

    let scale = Decimal::from(10_i64.pow(minor_unit_exponent(currency_code)));
    let minor = amount
        .checked_mul(scale)
        .ok_or_else(|| {
            ServiceError::ValidationError(format!("amount {} overflows minor units", amount))
        })?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);

    minor.to_i64().ok_or_else(|| {
        ServiceError::ValidationError(format!("amount {} overflows minor units", amount))
    })
}

/// Converts minor units back to a major-unit decimal.
pub fn from_minor_units(amount: i64, currency_code: &str) -> Decimal {
    Decimal::new(amount, minor_unit_exponent(currency_code))
}
