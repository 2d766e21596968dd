//! Cart state: line items keyed by menu item id plus customizations, with
//! totals derived fresh on every read.
//!
//! Monetary values stay unrounded `f64` sums internally; rounding happens
//! only at display time via [`format_amount`]. Quantities never reach zero
//! while a line is present; a decrement past one removes the line.

use serde::{Deserialize, Serialize};

use crate::error::CartError;

/// Upper bound on a unit price accepted into the cart.
const MAX_UNIT_PRICE: f64 = 1_000_000.0;
/// Upper bound on a line quantity.
const MAX_QUANTITY: u32 = 999;

/// A menu selection entering the cart. Two selections with the same `id` but
/// different `customizations` produce distinct cart lines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemInput {
    pub id: String,
    pub name: String,
    pub unit_price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub customizations: String,
}

/// One cart line. `quantity >= 1` always holds while the line exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: String,
    pub name: String,
    pub unit_price: f64,
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub customizations: String,
}

impl LineItem {
    pub fn line_total(&self) -> f64 {
        self.unit_price * self.quantity as f64
    }
}

/// Derived money snapshot: `total == subtotal + tax`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub subtotal: f64,
    pub tax: f64,
    pub total: f64,
}

/// The active cart: insertion-ordered line items. Order is irrelevant to
/// correctness but kept stable for list rendering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cart {
    items: Vec<LineItem>,
}

fn validate_input(input: &ItemInput) -> Result<(), CartError> {
    if input.name.trim().is_empty() {
        return Err(CartError::InvalidItem("item name is empty".into()));
    }
    if !input.unit_price.is_finite() {
        return Err(CartError::InvalidItem(format!(
            "unit price must be a finite number, got {}",
            input.unit_price
        )));
    }
    if input.unit_price < 0.0 {
        return Err(CartError::InvalidItem(format!(
            "unit price must be non-negative, got {}",
            input.unit_price
        )));
    }
    if input.unit_price > MAX_UNIT_PRICE {
        return Err(CartError::InvalidItem(format!(
            "unit price exceeds maximum allowed ({MAX_UNIT_PRICE})"
        )));
    }
    Ok(())
}

impl Cart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[LineItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn position(&self, id: &str, customizations: &str) -> Option<usize> {
        self.items
            .iter()
            .position(|line| line.id == id && line.customizations == customizations)
    }

    /// Merge `quantity_delta` units of a selection into the cart. Inserts a
    /// new line when no line shares `(id, customizations)`. A zero delta is
    /// a no-op that still validates the input.
    pub fn upsert(&mut self, input: &ItemInput, quantity_delta: u32) -> Result<(), CartError> {
        validate_input(input)?;
        if quantity_delta == 0 {
            return Ok(());
        }

        match self.position(&input.id, &input.customizations) {
            Some(idx) => {
                let line = &mut self.items[idx];
                line.quantity = line.quantity.saturating_add(quantity_delta).min(MAX_QUANTITY);
            }
            None => {
                self.items.push(LineItem {
                    id: input.id.clone(),
                    name: input.name.clone(),
                    unit_price: input.unit_price,
                    quantity: quantity_delta.min(MAX_QUANTITY),
                    description: input.description.clone(),
                    customizations: input.customizations.clone(),
                });
            }
        }
        Ok(())
    }

    /// Add a single unit of a selection.
    pub fn add(&mut self, input: &ItemInput) -> Result<(), CartError> {
        self.upsert(input, 1)
    }

    /// Set a line's quantity exactly (not additive). A quantity of zero
    /// removes the line. Setting an absent line is a no-op.
    pub fn set_quantity(&mut self, id: &str, customizations: &str, quantity: u32) {
        match self.position(id, customizations) {
            Some(idx) if quantity == 0 => {
                self.items.remove(idx);
            }
            Some(idx) => {
                self.items[idx].quantity = quantity.min(MAX_QUANTITY);
            }
            None => {}
        }
    }

    /// Add one unit to an existing line. Returns `false` when the line is
    /// absent (use `upsert` to insert).
    pub fn increment(&mut self, id: &str, customizations: &str) -> bool {
        match self.position(id, customizations) {
            Some(idx) => {
                let line = &mut self.items[idx];
                line.quantity = line.quantity.saturating_add(1).min(MAX_QUANTITY);
                true
            }
            None => false,
        }
    }

    /// Remove one unit from an existing line; at quantity 1 the line itself
    /// is removed. Returns `false` when the line is absent.
    pub fn decrement(&mut self, id: &str, customizations: &str) -> bool {
        match self.position(id, customizations) {
            Some(idx) => {
                if self.items[idx].quantity <= 1 {
                    self.items.remove(idx);
                } else {
                    self.items[idx].quantity -= 1;
                }
                true
            }
            None => false,
        }
    }

    /// Remove a line entirely. Idempotent: removing an absent line is fine.
    pub fn remove(&mut self, id: &str, customizations: &str) {
        if let Some(idx) = self.position(id, customizations) {
            self.items.remove(idx);
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Compute totals from the current lines and the configured tax rate.
    /// No intermediate rounding; format at display time.
    pub fn totals(&self, tax_rate: f64) -> Totals {
        let subtotal: f64 = self.items.iter().map(LineItem::line_total).sum();
        let tax = subtotal * tax_rate;
        Totals {
            subtotal,
            tax,
            total: subtotal + tax,
        }
    }
}

/// Display-time rounding to two decimal places.
pub fn format_amount(value: f64) -> String {
    format!("{value:.2}")
}
