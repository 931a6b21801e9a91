// Copyright 2021-Present Datadog, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest value the `nanos` field may carry, in absolute value.
pub const MAX_NANOS: i32 = 999_999_999;

const NANOS_PER_UNIT: i32 = 1_000_000_000;

/// An amount of money in a given currency.
///
/// `units` is the whole-unit part and `nanos` the fractional part in
/// billionths of a unit. For a valid amount both fields agree in sign (or one
/// of them is zero) and `nanos` stays within `±999_999_999`.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Money {
    /// Three-letter currency code, e.g. `"USD"`.
    pub currency_code: String,
    /// Whole units of the amount.
    pub units: i64,
    /// Nanos of the amount, carrying the same sign as `units`.
    pub nanos: i32,
}

/// Error returned by money validation and arithmetic.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum MoneyError {
    /// The currency code is not exactly three ASCII letters.
    #[error("the currency code must be exactly 3 letters, got `{0}`")]
    InvalidCurrencyCode(String),
    /// `units` and `nanos` carry opposite signs.
    #[error("the signs of the units and nanos fields must agree")]
    SignMismatch,
    /// `nanos` falls outside `±999_999_999`.
    #[error("the nanos field must be between -999999999 and 999999999, got {0}")]
    NanosOutOfRange(i32),
    /// The two amounts are denominated in different currencies.
    #[error("money values must share a currency code to be added: `{left}` vs `{right}`")]
    CurrencyMismatch {
        /// Currency code of the left operand.
        left: String,
        /// Currency code of the right operand.
        right: String,
    },
    /// The addition overflowed the `units` field. The error carries the
    /// saturated amount so that callers treating saturation as success can
    /// still recover a value.
    #[error("money addition overflow")]
    Overflow {
        /// The saturated sum, `±(i64::MAX, 999_999_999)` with matching signs.
        saturated: Money,
    },
}

impl Money {
    /// Builds an amount from its raw components. No validation is performed;
    /// call [`Money::validate`] to check the invariants.
    pub fn new(currency_code: impl Into<String>, units: i64, nanos: i32) -> Self {
        Money {
            currency_code: currency_code.into(),
            units,
            nanos,
        }
    }

    /// Checks the amount invariants: a three-letter currency code, agreeing
    /// signs, and `nanos` within range.
    pub fn validate(&self) -> Result<(), MoneyError> {
        if self.currency_code.len() != 3 || !self.currency_code.bytes().all(|b| b.is_ascii_alphabetic())
        {
            return Err(MoneyError::InvalidCurrencyCode(self.currency_code.clone()));
        }
        if (self.units > 0 && self.nanos < 0) || (self.units < 0 && self.nanos > 0) {
            return Err(MoneyError::SignMismatch);
        }
        if self.nanos < -MAX_NANOS || self.nanos > MAX_NANOS {
            return Err(MoneyError::NanosOutOfRange(self.nanos));
        }
        Ok(())
    }

    /// Returns the sign of the amount: `1`, `-1`, or `0`.
    pub fn amount_sign(&self) -> i32 {
        if self.units > 0 {
            1
        } else if self.units < 0 {
            -1
        } else if self.nanos > 0 {
            1
        } else if self.nanos < 0 {
            -1
        } else {
            0
        }
    }

    /// Adds two amounts of the same currency.
    ///
    /// On overflow of the `units` field, returns [`MoneyError::Overflow`]
    /// carrying the saturated sum. The nanos sum carries `±1` into `units`
    /// when it crosses one billion, and the result is renormalized if the two
    /// fields end up with opposite signs.
    pub fn try_add(&self, other: &Money) -> Result<Money, MoneyError> {
        if self.currency_code != other.currency_code {
            return Err(MoneyError::CurrencyMismatch {
                left: self.currency_code.clone(),
                right: other.currency_code.clone(),
            });
        }

        let mut carry: i64 = 0;
        let mut sum_nanos = self.nanos + other.nanos;
        if sum_nanos >= NANOS_PER_UNIT {
            carry = 1;
            sum_nanos -= NANOS_PER_UNIT;
        } else if sum_nanos <= -NANOS_PER_UNIT {
            carry = -1;
            sum_nanos += NANOS_PER_UNIT;
        }

        // Overflow is detected by sign below, so the intermediate sums must
        // wrap rather than trap.
        let sum_units_no_carry = self.units.wrapping_add(other.units);
        let mut sum_units = sum_units_no_carry.wrapping_add(carry);

        // The two fields may disagree in sign at this point, for example
        // (-2 units, -7 nanos) + (5 units, 3 nanos). Transfer one unit if so.
        if sum_units > 0 && sum_nanos < 0 {
            sum_units -= 1;
            sum_nanos += NANOS_PER_UNIT;
        } else if sum_units < 0 && sum_nanos > 0 {
            sum_units += 1;
            sum_nanos -= NANOS_PER_UNIT;
        }

        let sign_left = self.amount_sign();
        let sign_right = other.amount_sign();

        if sign_left > 0 && sign_right > 0 && sum_units <= 0 {
            return Err(MoneyError::Overflow {
                saturated: Money::new(self.currency_code.clone(), i64::MAX, MAX_NANOS),
            });
        }
        // A negative overflow can hide behind the carry: the carry-less sum
        // may wrap exactly to zero while adding the carry turns it negative
        // again, so both sums have to be inspected.
        if sign_left < 0 && sign_right < 0 && (sum_units_no_carry >= 0 || sum_units >= 0) {
            return Err(MoneyError::Overflow {
                saturated: Money::new(self.currency_code.clone(), i64::MIN, -MAX_NANOS),
            });
        }

        Ok(Money::new(self.currency_code.clone(), sum_units, sum_nanos))
    }

    /// Adds two amounts of the same currency, saturating on overflow.
    ///
    /// Calling this with mismatched currencies is a contract violation; in
    /// release builds the mismatch yields an empty amount.
    pub fn saturating_add(&self, other: &Money) -> Money {
        match self.try_add(other) {
            Ok(sum) => sum,
            Err(MoneyError::Overflow { saturated }) => saturated,
            Err(error) => {
                debug_assert!(false, "money addition failed: {error}");
                Money::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usd(units: i64, nanos: i32) -> Money {
        Money::new("USD", units, nanos)
    }

    #[test]
    fn test_validate_accepts_well_formed_amounts() {
        assert!(usd(0, 0).validate().is_ok());
        assert!(usd(3, 500_000_000).validate().is_ok());
        assert!(usd(-3, -500_000_000).validate().is_ok());
        assert!(usd(0, -MAX_NANOS).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_currency_code() {
        for code in ["", "US", "USDX", "U1D"] {
            let money = Money::new(code, 1, 0);
            assert!(matches!(
                money.validate(),
                Err(MoneyError::InvalidCurrencyCode(_))
            ));
        }
    }

    #[test]
    fn test_validate_rejects_opposite_signs() {
        assert_eq!(usd(1, -1).validate(), Err(MoneyError::SignMismatch));
        assert_eq!(usd(-1, 1).validate(), Err(MoneyError::SignMismatch));
    }

    #[test]
    fn test_validate_rejects_out_of_range_nanos() {
        assert!(matches!(
            usd(1, NANOS_PER_UNIT).validate(),
            Err(MoneyError::NanosOutOfRange(_))
        ));
        assert!(matches!(
            usd(-1, -NANOS_PER_UNIT).validate(),
            Err(MoneyError::NanosOutOfRange(_))
        ));
    }

    #[test]
    fn test_add_carries_nanos_into_units() {
        let sum = usd(1, 600_000_000).try_add(&usd(2, 700_000_000)).unwrap();
        assert_eq!(sum, usd(4, 300_000_000));

        let sum = usd(-1, -600_000_000)
            .try_add(&usd(-2, -700_000_000))
            .unwrap();
        assert_eq!(sum, usd(-4, -300_000_000));
    }

    #[test]
    fn test_add_renormalizes_opposite_signs() {
        let sum = usd(-2, -700_000_000).try_add(&usd(5, 300_000_000)).unwrap();
        assert_eq!(sum, usd(2, 600_000_000));

        let sum = usd(2, 700_000_000).try_add(&usd(-5, -300_000_000)).unwrap();
        assert_eq!(sum, usd(-2, -600_000_000));
    }

    #[test]
    fn test_add_is_commutative() {
        let amounts = [
            usd(0, 0),
            usd(1, 999_999_999),
            usd(-7, -100),
            usd(i64::MAX - 1, 0),
        ];
        for left in &amounts {
            for right in &amounts {
                assert_eq!(left.try_add(right), right.try_add(left));
            }
        }
    }

    #[test]
    fn test_add_is_associative_without_overflow() {
        let a = usd(1, 900_000_000);
        let b = usd(2, 200_000_000);
        let c = usd(-1, -500_000_000);
        let left = a.try_add(&b).unwrap().try_add(&c).unwrap();
        let right = a.try_add(&b.try_add(&c).unwrap()).unwrap();
        assert_eq!(left, right);
    }

    #[test]
    fn test_add_rejects_currency_mismatch() {
        let result = usd(1, 0).try_add(&Money::new("EUR", 1, 0));
        assert!(matches!(result, Err(MoneyError::CurrencyMismatch { .. })));
    }

    #[test]
    fn test_add_saturates_on_positive_overflow() {
        let result = usd(i64::MAX, MAX_NANOS).try_add(&usd(1, 0));
        match result {
            Err(MoneyError::Overflow { saturated }) => {
                assert_eq!(saturated, usd(i64::MAX, MAX_NANOS));
            }
            other => panic!("expected overflow, got {other:?}"),
        }
    }

    #[test]
    fn test_add_saturates_on_negative_overflow() {
        let result = usd(i64::MIN, -MAX_NANOS).try_add(&usd(-1, 0));
        match result {
            Err(MoneyError::Overflow { saturated }) => {
                assert_eq!(saturated, usd(i64::MIN, -MAX_NANOS));
            }
            other => panic!("expected overflow, got {other:?}"),
        }
    }

    #[test]
    fn test_add_detects_negative_overflow_hidden_by_carry() {
        // The carry-less unit sum wraps exactly to zero; only the nanos carry
        // pushes the sum back into negative territory.
        let left = usd(i64::MIN, -600_000_000);
        let right = usd(i64::MIN, -600_000_000);
        let result = left.try_add(&right);
        assert!(matches!(result, Err(MoneyError::Overflow { .. })));
    }

    #[test]
    fn test_saturating_add_returns_saturated_amount() {
        let sum = usd(i64::MAX, MAX_NANOS).saturating_add(&usd(1, 0));
        assert_eq!(sum, usd(i64::MAX, MAX_NANOS));

        let sum = usd(1, 0).saturating_add(&usd(2, 500));
        assert_eq!(sum, usd(3, 500));
    }

    #[test]
    fn test_amount_sign() {
        assert_eq!(usd(3, 0).amount_sign(), 1);
        assert_eq!(usd(0, 3).amount_sign(), 1);
        assert_eq!(usd(-3, 0).amount_sign(), -1);
        assert_eq!(usd(0, -3).amount_sign(), -1);
        assert_eq!(usd(0, 0).amount_sign(), 0);
    }
}
