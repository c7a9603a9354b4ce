//! Monetary types for bankcore.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{BankError, Result};

/// Exclusive upper bound on amounts and balances (10^16), the range of a
/// `NUMERIC(20,4)` column.
pub const BALANCE_LIMIT: Decimal = Decimal::from_parts(0x6FC1_0000, 0x0023_86F2, 0, false, 0);

/// Apply a signed change to a balance, refusing results at or past
/// [`BALANCE_LIMIT`].
pub fn checked_balance(balance: Decimal, delta: Decimal) -> Result<Decimal> {
    balance
        .checked_add(delta)
        .filter(|next| next.abs() < BALANCE_LIMIT)
        .ok_or_else(|| BankError::Validation {
            message: format!(
                "Balance {} changed by {} leaves the supported range",
                balance, delta
            ),
            field: Some("amount".to_string()),
        })
}

/// A strictly positive transfer amount.
///
/// Balances are plain `Decimal`s (they may be zero); anything that moves
/// money goes through `Amount` so a non-positive value never reaches storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    /// Maximum number of fractional digits accepted on input.
    pub const MAX_SCALE: u32 = 4;

    /// Validate and wrap an amount.
    pub fn new(value: Decimal) -> Result<Self> {
        if value <= Decimal::ZERO {
            return Err(BankError::Validation {
                message: format!("Amount must be positive, got {}", value),
                field: Some("amount".to_string()),
            });
        }
        if value >= BALANCE_LIMIT {
            return Err(BankError::Validation {
                message: format!("Amount {} exceeds the supported range", value),
                field: Some("amount".to_string()),
            });
        }
        if value.normalize().scale() > Self::MAX_SCALE {
            return Err(BankError::Validation {
                message: format!(
                    "Amount {} has more than {} decimal places",
                    value,
                    Self::MAX_SCALE
                ),
                field: Some("amount".to_string()),
            });
        }
        Ok(Self(value.normalize()))
    }

    /// Parse and validate a decimal string.
    pub fn parse(value: &str) -> Result<Self> {
        let decimal = Decimal::from_str(value.trim()).map_err(|e| BankError::Validation {
            message: format!("Invalid amount '{}': {}", value, e),
            field: Some("amount".to_string()),
        })?;
        Self::new(decimal)
    }

    /// Get the decimal value.
    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = BankError;

    fn try_from(value: Decimal) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

/// ISO 4217 currency code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency(String);

impl Currency {
    /// Create a new currency from code.
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().to_uppercase())
    }

    /// Get the currency code.
    pub fn code(&self) -> &str {
        &self.0
    }

    pub fn usd() -> Self {
        Self::new("USD")
    }

    pub fn eur() -> Self {
        Self::new("EUR")
    }

    pub fn tnd() -> Self {
        Self::new("TND")
    }
}

impl Default for Currency {
    fn default() -> Self {
        Self::tnd()
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Currency {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
