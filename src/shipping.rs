use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Parcel dimensions handed to the rate collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parcel {
    pub weight_grams: i32,
    pub quantity: i32,
}

/// One priced delivery option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingOption {
    pub carrier: String,
    pub price: Decimal,
    pub eta_days: u32,
}

/// Shipping rate collaborator. Pure: no side effects, and the returned
/// prices are trusted as of call time only — the checkout orchestrator
/// re-quotes and compares rather than trusting the caller-supplied price.
pub trait ShippingRates: Send + Sync {
    fn quote(&self, origin_zip: &str, dest_zip: &str, parcels: &[Parcel]) -> Vec<ShippingOption>;
}

/// Deterministic weight-banded rate table used in development and tests.
pub struct TableRates;

impl TableRates {
    fn total_weight(parcels: &[Parcel]) -> i64 {
        parcels
            .iter()
            .map(|p| i64::from(p.weight_grams) * i64::from(p.quantity))
            .sum()
    }
}

impl ShippingRates for TableRates {
    fn quote(&self, _origin_zip: &str, _dest_zip: &str, parcels: &[Parcel]) -> Vec<ShippingOption> {
        let weight = Self::total_weight(parcels);
        // One surcharge step per started 5kg above the first.
        let surcharge_steps = Decimal::from((weight.max(1) - 1) / 5_000);

        vec![
            ShippingOption {
                carrier: "standard".to_string(),
                price: dec!(10.00) + surcharge_steps * dec!(2.50),
                eta_days: 5,
            },
            ShippingOption {
                carrier: "express".to_string(),
                price: dec!(25.00) + surcharge_steps * dec!(4.00),
                eta_days: 2,
            },
        ]
    }
}
