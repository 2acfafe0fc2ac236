//! Per-entity field policies used by the conflict resolver

use std::collections::BTreeMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Total order of the values a status field moves through, earliest first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusOrder(Vec<String>);

impl StatusOrder {
    pub fn new<I, S>(states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(states.into_iter().map(Into::into).collect())
    }

    /// Position of `value` in the order.
    ///
    /// `None` for non-string values and states the order does not know.
    pub fn rank(&self, value: &serde_json::Value) -> Option<usize> {
        let state = value.as_str()?;
        self.0.iter().position(|known| known == state)
    }

    pub fn states(&self) -> &[String] {
        &self.0
    }
}

/// How concurrent writes to one field are settled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum FieldPolicy {
    /// The later state in the order wins, regardless of version
    Status { order: StatusOrder },
    /// Differing values are never merged automatically
    Monetary,
    /// Highest version wins, ties broken by the greater `updated_by`
    LastWriterWins,
}

/// Field policies declared for one entity type.
///
/// Fields without a declaration fall back to [`FieldPolicy::LastWriterWins`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntityPolicy {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldPolicy>,
}

impl EntityPolicy {
    #[must_use]
    pub fn with_status(mut self, field: impl Into<String>, order: StatusOrder) -> Self {
        self.fields.insert(field.into(), FieldPolicy::Status { order });
        self
    }

    #[must_use]
    pub fn with_monetary(mut self, field: impl Into<String>) -> Self {
        self.fields.insert(field.into(), FieldPolicy::Monetary);
        self
    }

    pub fn field(&self, name: &str) -> &FieldPolicy {
        static UNDECLARED: FieldPolicy = FieldPolicy::LastWriterWins;
        self.fields.get(name).unwrap_or(&UNDECLARED)
    }
}

/// Entity type to policy mapping supplied by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyRegistry {
    entities: BTreeMap<String, EntityPolicy>,
}

impl PolicyRegistry {
    /// A registry with no declarations: every field of every entity is LWW
    pub fn empty() -> Self {
        Self {
            entities: BTreeMap::new(),
        }
    }

    /// Built-in restaurant entities: order, delivery and payment.
    pub fn restaurant_defaults() -> Self {
        Self::empty()
            .with_entity(
                "order",
                EntityPolicy::default()
                    .with_status(
                        "status",
                        StatusOrder::new([
                            "placed",
                            "accepted",
                            "preparing",
                            "ready",
                            "picked_up",
                            "en_route",
                            "delivered",
                            "completed",
                        ]),
                    )
                    .with_monetary("cash_amount")
                    .with_monetary("total"),
            )
            .with_entity(
                "delivery",
                EntityPolicy::default().with_status(
                    "status",
                    StatusOrder::new([
                        "assigned",
                        "accepted",
                        "picked_up",
                        "en_route",
                        "delivered",
                    ]),
                ),
            )
            .with_entity(
                "payment",
                EntityPolicy::default()
                    .with_status(
                        "status",
                        StatusOrder::new(["pending", "authorized", "captured", "settled"]),
                    )
                    .with_monetary("amount")
                    .with_monetary("tip"),
            )
    }

    #[must_use]
    pub fn with_entity(mut self, entity_type: impl Into<String>, policy: EntityPolicy) -> Self {
        self.entities.insert(entity_type.into(), policy);
        self
    }

    /// Policy for `entity_type`, or the all-LWW policy when undeclared
    pub fn policy_for(&self, entity_type: &str) -> &EntityPolicy {
        static UNDECLARED: OnceLock<EntityPolicy> = OnceLock::new();
        self.entities
            .get(entity_type)
            .unwrap_or_else(|| UNDECLARED.get_or_init(EntityPolicy::default))
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::restaurant_defaults()
    }
}
