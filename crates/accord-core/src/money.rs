//! Value model: decimal money, ISO-4217 currencies, and conversion rates (spec §4.1).

use crate::error::Error;
use rust_decimal::prelude::*;
use rust_decimal::RoundingStrategy;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Side of a journal line. Amounts are always non-negative (R4); this enum carries
/// direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Debit,
    Credit,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Debit => Side::Credit,
            Side::Credit => Side::Debit,
        }
    }
}

/// ISO-4217 currency code plus its minor-unit decimal place count.
///
/// Only a fixed table of currencies is recognized; unknown codes are rejected at
/// construction (R16) rather than silently accepted with a guessed precision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency(String);

impl Currency {
    pub fn new(code: impl Into<String>) -> Result<Self, Error> {
        let code = code.into().to_ascii_uppercase();
        if decimal_places_for(&code).is_none() {
            return Err(Error::UnrecognizedCurrency(format!(
                "unrecognized ISO-4217 currency code '{code}'"
            )));
        }
        Ok(Self(code))
    }

    pub fn code(&self) -> &str {
        &self.0
    }

    pub fn decimal_places(&self) -> u32 {
        decimal_places_for(&self.0).expect("constructed Currency always has a known table entry")
    }

    /// Smallest representable unit for this currency, used as the reconciliation/
    /// balance-check tolerance (R17).
    pub fn tolerance(&self) -> Decimal {
        Decimal::new(1, self.decimal_places())
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn decimal_places_for(code: &str) -> Option<u32> {
    match code {
        "JPY" | "KRW" | "VND" | "CLP" | "ISK" | "HUF" => Some(0),
        "BHD" | "KWD" | "OMR" | "JOD" | "TND" => Some(3),
        // The overwhelming majority of ISO-4217 currencies use two decimal places.
        "USD" | "EUR" | "GBP" | "CAD" | "AUD" | "CHF" | "CNY" | "SEK" | "NOK" | "DKK" | "NZD"
        | "SGD" | "HKD" | "MXN" | "BRL" | "INR" | "ZAR" | "PLN" | "TRY" | "AED" | "SAR" => Some(2),
        _ => None,
    }
}

/// Arbitrary-precision, non-negative monetary amount paired with a currency.
///
/// No floating point is ever accepted as an amount source (R16); values are built
/// from decimal strings or integers only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    amount: Decimal,
    currency: Currency,
}

impl Money {
    /// Construct from a decimal string, rejecting negative amounts for line storage.
    pub fn from_str_amount(amount: &str, currency: Currency) -> Result<Self, Error> {
        let amount = Decimal::from_str_exact(amount)
            .map_err(|e| Error::InvalidQuantity(format!("invalid decimal amount '{amount}': {e}")))?;
        Self::new(amount, currency)
    }

    pub fn new(amount: Decimal, currency: Currency) -> Result<Self, Error> {
        if amount.is_sign_negative() {
            return Err(Error::NegativeAmount(format!(
                "money amounts must be non-negative, got {amount}"
            )));
        }
        Ok(Self { amount, currency })
    }

    pub fn zero(currency: Currency) -> Self {
        Self {
            amount: Decimal::ZERO,
            currency,
        }
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    /// Adds two amounts of the same currency. Cross-currency addition is a
    /// programming error, not a runtime coercion (R19).
    pub fn checked_add(&self, other: &Money) -> Result<Money, Error> {
        if self.currency != other.currency {
            return Err(Error::InvalidQuantity(format!(
                "cannot add {} to {}: currency mismatch",
                other.currency, self.currency
            )));
        }
        Ok(Money {
            amount: self.amount + other.amount,
            currency: self.currency.clone(),
        })
    }

    /// Subtracts, allowing a negative intermediate result for residual/variance
    /// computation; callers decide whether the result is valid for storage.
    pub fn checked_sub_signed(&self, other: &Money) -> Result<Decimal, Error> {
        if self.currency != other.currency {
            return Err(Error::InvalidQuantity(format!(
                "cannot subtract {} from {}: currency mismatch",
                other.currency, self.currency
            )));
        }
        Ok(self.amount - other.amount)
    }

    /// Scales by a plain decimal multiplier (e.g. a tax rate, an allocation weight).
    pub fn checked_mul_scalar(&self, scalar: Decimal) -> Result<Money, Error> {
        let scaled = self.amount * scalar;
        if scaled.is_sign_negative() {
            return Err(Error::NegativeAmount(format!(
                "scaling {} by {} produced a negative amount",
                self.amount, scalar
            )));
        }
        Ok(Money {
            amount: scaled,
            currency: self.currency.clone(),
        })
    }

    /// Rounds to the currency's decimal-place count using banker's rounding
    /// (round-half-to-even), per spec §4.1.
    pub fn rounded(&self) -> Money {
        let places = self.currency.decimal_places();
        Money {
            amount: self
                .amount
                .round_dp_with_strategy(places, RoundingStrategy::MidpointNearestEven),
            currency: self.currency.clone(),
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

/// A conversion rate between two currencies, captured at a point in time by callers
/// (the kernel does not fetch rates itself).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rate {
    pub from: Currency,
    pub to: Currency,
    pub rate: Decimal,
}

impl Rate {
    pub fn new(from: Currency, to: Currency, rate: Decimal) -> Result<Self, Error> {
        if rate.is_sign_negative() || rate.is_zero() {
            return Err(Error::InvalidQuantity(format!(
                "conversion rate must be strictly positive, got {rate}"
            )));
        }
        Ok(Self { from, to, rate })
    }

    pub fn convert(&self, money: &Money) -> Result<Money, Error> {
        if money.currency() != &self.from {
            return Err(Error::InvalidQuantity(format!(
                "rate converts from {} but money is denominated in {}",
                self.from,
                money.currency()
            )));
        }
        Money::new(money.amount() * self.rate, self.to.clone()).map(|m| m.rounded())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn usd() -> Currency {
        Currency::new("USD").unwrap()
    }

    #[test]
    fn rejects_unknown_currency() {
        assert!(Currency::new("ZZZ").is_err());
    }

    #[test]
    fn rejects_negative_amount() {
        assert!(Money::new(dec!(-1.00), usd()).is_err());
    }

    #[test]
    fn add_requires_currency_identity() {
        let a = Money::new(dec!(10.00), usd()).unwrap();
        let b = Money::new(dec!(5.00), Currency::new("EUR").unwrap()).unwrap();
        assert!(a.checked_add(&b).is_err());
    }

    #[test]
    fn banker_rounding_rounds_half_to_even() {
        let m = Money::new(dec!(10.005), usd()).unwrap();
        assert_eq!(m.rounded().amount(), dec!(10.00));
        let m = Money::new(dec!(10.015), usd()).unwrap();
        assert_eq!(m.rounded().amount(), dec!(10.02));
    }

    #[test]
    fn jpy_has_zero_decimal_places() {
        let jpy = Currency::new("jpy").unwrap();
        assert_eq!(jpy.decimal_places(), 0);
        assert_eq!(jpy.tolerance(), Decimal::ONE);
    }

    #[test]
    fn rate_converts_and_rounds() {
        let rate = Rate::new(usd(), Currency::new("EUR").unwrap(), dec!(0.9)).unwrap();
        let converted = rate
            .convert(&Money::new(dec!(100.00), usd()).unwrap())
            .unwrap();
        assert_eq!(converted.amount(), dec!(90.00));
    }
}
