//! Per-token pricing table.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const PER_MILLION: Decimal = dec!(1_000_000);

/// (input, output) price per million tokens, matched by model-name substring.
const PRICING: &[(&str, Decimal, Decimal)] = &[
    ("haiku", dec!(1), dec!(5)),
    ("sonnet", dec!(3), dec!(15)),
    ("opus", dec!(15), dec!(75)),
    ("gpt-4o-mini", dec!(0.15), dec!(0.60)),
    ("gpt-4o", dec!(2.50), dec!(10)),
];

const DEFAULT_PRICING: (Decimal, Decimal) = (dec!(3), dec!(15));

/// Price per (input, output) token for `model`.
pub fn model_cost(model: &str) -> (Decimal, Decimal) {
    let lower = model.to_lowercase();
    let (input, output) = PRICING
        .iter()
        .find(|(needle, _, _)| lower.contains(needle))
        .map(|(_, i, o)| (*i, *o))
        .unwrap_or(DEFAULT_PRICING);
    (input / PER_MILLION, output / PER_MILLION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haiku_is_cheaper_than_sonnet() {
        let (hi, ho) = model_cost("claude-3-5-haiku-latest");
        let (si, so) = model_cost("claude-sonnet-4-20250514");
        assert!(hi < si);
        assert!(ho < so);
        assert_eq!(si, dec!(0.000003));
    }

    #[test]
    fn mini_matches_before_full_gpt4o() {
        assert_eq!(model_cost("gpt-4o-mini").0, dec!(0.00000015));
        assert_eq!(model_cost("gpt-4o").0, dec!(0.0000025));
    }

    #[test]
    fn unknown_model_uses_default() {
        assert_eq!(model_cost("some-new-model"), model_cost("sonnet"));
    }
}
