//! Model price table and cost computation.
//!
//! Prices are USD per million tokens. Lookup is longest-prefix so dated
//! model variants (e.g. `gpt-4o-2024-11-20`) resolve to their family price.
//! Unpriced models (local Ollama/LM Studio models, unknown ids) yield no
//! cost rather than a guess.

use crate::types::{Cost, Usage};

/// Price of one model family, USD per 1M tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    /// Cost per million input tokens.
    pub input_per_mtok: f64,
    /// Cost per million output tokens.
    pub output_per_mtok: f64,
}

/// Longest-prefix price table. Order within the table does not matter;
/// lookup picks the longest matching prefix.
const PRICES: &[(&str, ModelPrice)] = &[
    ("gpt-4o-mini", ModelPrice { input_per_mtok: 0.15, output_per_mtok: 0.60 }),
    ("gpt-4o", ModelPrice { input_per_mtok: 2.50, output_per_mtok: 10.00 }),
    ("gpt-4-turbo", ModelPrice { input_per_mtok: 10.00, output_per_mtok: 30.00 }),
    ("gpt-3.5-turbo", ModelPrice { input_per_mtok: 0.50, output_per_mtok: 1.50 }),
    ("o1-mini", ModelPrice { input_per_mtok: 1.10, output_per_mtok: 4.40 }),
    ("o1", ModelPrice { input_per_mtok: 15.00, output_per_mtok: 60.00 }),
    ("claude-3-5-sonnet", ModelPrice { input_per_mtok: 3.00, output_per_mtok: 15.00 }),
    ("claude-3-5-haiku", ModelPrice { input_per_mtok: 0.80, output_per_mtok: 4.00 }),
    ("claude-3-opus", ModelPrice { input_per_mtok: 15.00, output_per_mtok: 75.00 }),
    ("claude-3-haiku", ModelPrice { input_per_mtok: 0.25, output_per_mtok: 1.25 }),
    ("gemini-1.5-pro", ModelPrice { input_per_mtok: 1.25, output_per_mtok: 5.00 }),
    ("gemini-1.5-flash", ModelPrice { input_per_mtok: 0.075, output_per_mtok: 0.30 }),
    ("gemini-2.0-flash", ModelPrice { input_per_mtok: 0.10, output_per_mtok: 0.40 }),
    ("mistral-large", ModelPrice { input_per_mtok: 2.00, output_per_mtok: 6.00 }),
    ("mistral-small", ModelPrice { input_per_mtok: 0.20, output_per_mtok: 0.60 }),
    ("llama-3.3-70b", ModelPrice { input_per_mtok: 0.59, output_per_mtok: 0.79 }),
    ("llama-3.1-8b", ModelPrice { input_per_mtok: 0.05, output_per_mtok: 0.08 }),
    ("grok-2", ModelPrice { input_per_mtok: 2.00, output_per_mtok: 10.00 }),
    ("sonar-pro", ModelPrice { input_per_mtok: 3.00, output_per_mtok: 15.00 }),
    ("sonar", ModelPrice { input_per_mtok: 1.00, output_per_mtok: 1.00 }),
];

/// Look up the price for a model id, longest prefix wins.
pub fn price_for(model: &str) -> Option<ModelPrice> {
    PRICES
        .iter()
        .filter(|(prefix, _)| model.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, price)| *price)
}

/// Compute the cost of a request, `None` when the model is unpriced.
pub fn compute(model: &str, usage: &Usage) -> Option<Cost> {
    let price = price_for(model)?;
    let input = usage.input_tokens as f64 / 1_000_000.0 * price.input_per_mtok;
    let output = usage.output_tokens as f64 / 1_000_000.0 * price.output_per_mtok;
    Some(Cost {
        input,
        output,
        total: input + output,
        currency: "USD".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_prefix_wins() {
        // "gpt-4o-mini" must not resolve to the "gpt-4o" family.
        let mini = price_for("gpt-4o-mini-2024-07-18").expect("priced");
        assert_eq!(mini.input_per_mtok, 0.15);

        let full = price_for("gpt-4o-2024-11-20").expect("priced");
        assert_eq!(full.input_per_mtok, 2.50);
    }

    #[test]
    fn test_unpriced_model_is_none() {
        assert!(price_for("llama3.2:3b").is_none());
        assert!(price_for("my-fine-tune").is_none());
    }

    #[test]
    fn test_compute_cost() {
        let usage = Usage::new(1_000_000, 1_000_000);
        let cost = compute("gpt-4o", &usage).expect("priced");
        assert!((cost.input - 2.50).abs() < 1e-9);
        assert!((cost.output - 10.00).abs() < 1e-9);
        assert!((cost.total - 12.50).abs() < 1e-9);
        assert_eq!(cost.currency, "USD");
    }

    #[test]
    fn test_compute_unpriced_is_none() {
        assert!(compute("unknown-model", &Usage::new(10, 10)).is_none());
    }
}
