//! Admission-time content rules.

use crate::config::ValidationConfig;
use crate::error::ValidationError;

use super::model::RawItem;

/// Applies the configured content rules to raw items before admission.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    config: ValidationConfig,
}

impl Validator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Check one item. The first violated rule is reported.
    pub fn validate(&self, raw: &RawItem) -> Result<(), ValidationError> {
        let title = raw.title.trim();
        let has_identity = [raw.offer_id.as_deref(), raw.market_id.as_deref(), raw.url.as_deref()]
            .into_iter()
            .flatten()
            .any(|s| !s.trim().is_empty());

        if title.is_empty() {
            return Err(if has_identity {
                ValidationError::MissingTitle
            } else {
                ValidationError::MissingIdentity
            });
        }

        match raw.price {
            None if self.config.require_price => return Err(ValidationError::MissingPrice),
            None => {}
            Some(price) => {
                if let Some(min) = self.config.min_price {
                    if price < min {
                        return Err(ValidationError::PriceBelow {
                            price: price.to_string(),
                            min: min.to_string(),
                        });
                    }
                }
                if let Some(max) = self.config.max_price {
                    if price > max {
                        return Err(ValidationError::PriceAbove {
                            price: price.to_string(),
                            max: max.to_string(),
                        });
                    }
                }
            }
        }

        let lowered = title.to_lowercase();
        if let Some(word) = self
            .config
            .stop_words
            .iter()
            .find(|w| !w.is_empty() && lowered.contains(w.as_str()))
        {
            return Err(ValidationError::StopWord { word: word.clone() });
        }

        Ok(())
    }
}
