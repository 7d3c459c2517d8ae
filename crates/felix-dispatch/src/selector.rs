// Compiled message predicates: property selectors, discriminators and no-local.
use felix_common::ids::ConnectionId;
use felix_storage::{MessageFilter, StorageError, StoredMessage};

use crate::{DispatchError, Result};

/// Pre-parsed property predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    Equals { property: String, value: String },
    Exists(String),
    /// Numeric comparison; a non-numeric property value is an evaluation error.
    GreaterThan { property: String, value: f64 },
    LessThan { property: String, value: f64 },
    And(Vec<Selector>),
    Or(Vec<Selector>),
    Not(Box<Selector>),
}

impl Selector {
    pub fn equals(property: impl Into<String>, value: impl Into<String>) -> Self {
        Selector::Equals {
            property: property.into(),
            value: value.into(),
        }
    }

    pub fn exists(property: impl Into<String>) -> Self {
        Selector::Exists(property.into())
    }

    pub fn greater_than(property: impl Into<String>, value: f64) -> Self {
        Selector::GreaterThan {
            property: property.into(),
            value,
        }
    }

    pub fn less_than(property: impl Into<String>, value: f64) -> Self {
        Selector::LessThan {
            property: property.into(),
            value,
        }
    }

    /// Rejects structurally meaningless selectors at attach time.
    pub fn validate(&self) -> Result<()> {
        match self {
            Selector::Equals { property, .. }
            | Selector::Exists(property)
            | Selector::GreaterThan { property, .. }
            | Selector::LessThan { property, .. } => {
                if property.trim().is_empty() {
                    return Err(DispatchError::InvalidSelector(
                        "empty property name".to_string(),
                    ));
                }
                if let Selector::GreaterThan { value, .. } | Selector::LessThan { value, .. } =
                    self
                    && !value.is_finite()
                {
                    return Err(DispatchError::InvalidSelector(format!(
                        "non-finite comparison value on {property}"
                    )));
                }
                Ok(())
            }
            Selector::And(terms) | Selector::Or(terms) => {
                if terms.is_empty() {
                    return Err(DispatchError::InvalidSelector(
                        "empty conjunction or disjunction".to_string(),
                    ));
                }
                terms.iter().try_for_each(Selector::validate)
            }
            Selector::Not(inner) => inner.validate(),
        }
    }

    pub fn evaluate(&self, message: &StoredMessage) -> felix_storage::Result<bool> {
        match self {
            Selector::Equals { property, value } => {
                Ok(message.property(property) == Some(value.as_str()))
            }
            Selector::Exists(property) => Ok(message.property(property).is_some()),
            Selector::GreaterThan { property, value } => {
                Ok(numeric(message, property)?.is_some_and(|actual| actual > *value))
            }
            Selector::LessThan { property, value } => {
                Ok(numeric(message, property)?.is_some_and(|actual| actual < *value))
            }
            Selector::And(terms) => {
                for term in terms {
                    if !term.evaluate(message)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Selector::Or(terms) => {
                for term in terms {
                    if term.evaluate(message)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Selector::Not(inner) => inner.evaluate(message).map(|matched| !matched),
        }
    }
}

fn numeric(message: &StoredMessage, property: &str) -> felix_storage::Result<Option<f64>> {
    match message.property(property) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<f64>().map(Some).map_err(|_| {
            StorageError::Filter(format!("property {property} is not numeric: {raw}"))
        }),
    }
}

/// Topic-style discriminator. A trailing `/*` matches the prefix and any
/// deeper segment.
///
/// ```
/// use felix_dispatch::Discriminator;
///
/// let disc = Discriminator::parse("orders/*").expect("valid");
/// assert!(disc.matches("orders/eu"));
/// assert!(!disc.matches("invoices/eu"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discriminator {
    Exact(String),
    Prefix(String),
}

impl Discriminator {
    pub fn parse(input: &str) -> Result<Self> {
        if input.is_empty() {
            return Err(DispatchError::InvalidSelector(
                "empty discriminator".to_string(),
            ));
        }
        match input.strip_suffix("/*") {
            Some(prefix) if !prefix.contains('*') => {
                Ok(Discriminator::Prefix(format!("{prefix}/")))
            }
            _ if input.contains('*') => Err(DispatchError::InvalidSelector(format!(
                "wildcard only allowed as trailing segment: {input}"
            ))),
            _ => Ok(Discriminator::Exact(input.to_string())),
        }
    }

    pub fn matches(&self, discriminator: &str) -> bool {
        match self {
            Discriminator::Exact(exact) => exact == discriminator,
            Discriminator::Prefix(prefix) => discriminator.starts_with(prefix.as_str()),
        }
    }
}

/// Everything a consumer key filters on. A filter with no constraints is
/// "general": it matches every message.
#[derive(Debug, Clone, Default)]
pub struct ConsumerFilter {
    selector: Option<Selector>,
    discriminator: Option<Discriminator>,
    // Connection whose own messages are excluded.
    no_local: Option<ConnectionId>,
}

impl ConsumerFilter {
    pub fn new(
        selector: Option<Selector>,
        discriminator: Option<Discriminator>,
        no_local: Option<ConnectionId>,
    ) -> Result<Self> {
        if let Some(selector) = &selector {
            selector.validate()?;
        }
        Ok(Self {
            selector,
            discriminator,
            no_local,
        })
    }

    pub fn is_specific(&self) -> bool {
        self.selector.is_some() || self.discriminator.is_some() || self.no_local.is_some()
    }

    pub fn matches(&self, message: &StoredMessage) -> felix_storage::Result<bool> {
        if let Some(connection) = self.no_local
            && message.producer_connection() == Some(connection)
        {
            return Ok(false);
        }
        if let Some(discriminator) = &self.discriminator {
            match message.discriminator() {
                Some(value) if discriminator.matches(value) => {}
                _ => return Ok(false),
            }
        }
        match &self.selector {
            Some(selector) => selector.evaluate(message),
            None => Ok(true),
        }
    }

    /// Like [`ConsumerFilter::matches`], logging evaluation failures and
    /// treating them as a non-match.
    pub fn matches_lenient(&self, message: &StoredMessage) -> bool {
        match self.matches(message) {
            Ok(matched) => matched,
            Err(err) => {
                tracing::warn!(
                    message_id = %message.id(),
                    error = %err,
                    "selector evaluation failed",
                );
                metrics::counter!("felix_dispatch_store_filter_errors_total").increment(1);
                false
            }
        }
    }
}

impl MessageFilter for ConsumerFilter {
    fn filter_matches(&self, message: &StoredMessage) -> felix_storage::Result<bool> {
        self.matches(message)
    }
}
