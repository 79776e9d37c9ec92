//! Domain manager errors.

use cartwire_core::{Money, SessionId};
use thiserror::Error;

/// Cart operation failures.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CartError {
    /// No cart exists for the session.
    #[error("no cart for session {0}")]
    CartNotFound(SessionId),

    /// The cart has no line with the given identity.
    #[error("item {product_id} not in cart")]
    ItemNotFound {
        /// Product identifier.
        product_id: String,
        /// Variant identifier.
        variant_id: Option<String>,
    },

    /// Line quantities must lie within `1..=MAX_LINE_QUANTITY`.
    #[error("quantity {0} is out of range")]
    InvalidQuantity(i64),

    /// Unit prices must not be negative.
    #[error("unit price {0} is negative")]
    InvalidPrice(Money),

    /// A line or cart total does not fit in the money type.
    #[error("cart total overflows")]
    TotalOverflow,
}

impl CartError {
    /// Stable wire code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CartNotFound(_) => "cart_not_found",
            Self::ItemNotFound { .. } => "item_not_found",
            Self::InvalidQuantity(_) => "invalid_quantity",
            Self::InvalidPrice(_) => "invalid_price",
            Self::TotalOverflow => "total_overflow",
        }
    }
}

/// Result type for cart operations.
pub type Result<T> = std::result::Result<T, CartError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(CartError::CartNotFound(SessionId::from("s")).code(), "cart_not_found");
        assert_eq!(
            CartError::ItemNotFound {
                product_id: "p".into(),
                variant_id: None
            }
            .code(),
            "item_not_found"
        );
        assert_eq!(CartError::InvalidQuantity(0).code(), "invalid_quantity");
        assert_eq!(CartError::InvalidPrice(Money::from_cents(-1)).code(), "invalid_price");
        assert_eq!(CartError::TotalOverflow.code(), "total_overflow");
    }

    #[test]
    fn display_names_the_session() {
        let err = CartError::CartNotFound(SessionId::from("s-42"));
        assert_eq!(err.to_string(), "no cart for session s-42");
    }
}
