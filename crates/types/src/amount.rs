//! Monetary amounts
//!
//! Every balance, reward and fee is a [`Decimal`] normalised to
//! [`AMOUNT_SCALE`] fractional digits. Products and quotients always round
//! toward zero so the platform never pays out more than it computed.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Monetary amount in the unit of its [`TokenType`].
pub type Amount = Decimal;

/// Number of fractional digits kept on every stored amount.
pub const AMOUNT_SCALE: u32 = 8;

/// Truncate an amount to [`AMOUNT_SCALE`] digits (round-down).
pub fn round_down(value: Decimal) -> Amount {
    value.round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::ToZero)
}

/// `a × b`, rounded down. Saturates instead of overflowing.
pub fn mul_round_down(a: Decimal, b: Decimal) -> Amount {
    round_down(a.checked_mul(b).unwrap_or(Decimal::MAX))
}

/// `a ÷ b`, rounded down. Division by zero yields zero.
pub fn div_round_down(a: Decimal, b: Decimal) -> Amount {
    if b.is_zero() {
        return Decimal::ZERO;
    }
    round_down(a.checked_div(b).unwrap_or(Decimal::ZERO))
}

/// Asset a balance column, flow or transfer is denominated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TokenType {
    /// Stable settlement unit, held in `usdt_points`.
    Usdt,
    /// Platform reward token, held in `token_points`.
    Token,
}

impl TokenType {
    pub const ALL: [TokenType; 2] = [TokenType::Usdt, TokenType::Token];

    pub fn symbol(self) -> &'static str {
        match self {
            TokenType::Usdt => "USDT",
            TokenType::Token => "TOKEN",
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for TokenType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "USDT" => Ok(TokenType::Usdt),
            "TOKEN" => Ok(TokenType::Token),
            other => Err(format!("unknown token type '{other}'")),
        }
    }
}
