//! Per-model token prices (USD per token).

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// `(input, output)` price per token for a model, matched by prefix.
///
/// Unknown models cost zero so usage is still counted.
pub fn model_cost(model: &str) -> (Decimal, Decimal) {
    let m = model.to_lowercase();
    if m.starts_with("claude-opus") || m.starts_with("claude-3-opus") {
        (dec!(0.000015), dec!(0.000075))
    } else if m.starts_with("claude-sonnet") || m.starts_with("claude-3-5-sonnet") {
        (dec!(0.000003), dec!(0.000015))
    } else if m.contains("haiku") {
        (dec!(0.0000008), dec!(0.000004))
    } else if m.starts_with("gpt-4o-mini") {
        (dec!(0.00000015), dec!(0.0000006))
    } else if m.starts_with("gpt-4o") {
        (dec!(0.0000025), dec!(0.00001))
    } else if m.starts_with("gpt-4.1") {
        (dec!(0.000002), dec!(0.000008))
    } else {
        (Decimal::ZERO, Decimal::ZERO)
    }
}

/// Cost of one call.
pub fn call_cost(model: &str, input_tokens: u32, output_tokens: u32) -> Decimal {
    let (input, output) = model_cost(model);
    input * Decimal::from(input_tokens) + output * Decimal::from(output_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mini_matched_before_base_model() {
        assert_eq!(model_cost("gpt-4o-mini").0, dec!(0.00000015));
        assert_eq!(model_cost("gpt-4o").0, dec!(0.0000025));
    }

    #[test]
    fn unknown_model_is_free() {
        assert_eq!(call_cost("mystery", 1000, 1000), Decimal::ZERO);
    }

    #[test]
    fn call_cost_sums_both_directions() {
        assert_eq!(
            call_cost("claude-sonnet-4-20250514", 1000, 100),
            dec!(0.003) + dec!(0.0015)
        );
    }
}
