use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Storage key of an item document.
pub type ItemKey = String;

/// A shopping-list entry as stored in the collection.
///
/// The document key is not part of the body; see [`ItemWithId`] for the
/// read-side shape that joins it back in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Epoch milliseconds of the first write. Zero means "not yet written".
    #[serde(default)]
    pub created: i64,
    /// Epoch milliseconds of the latest write.
    #[serde(default)]
    pub updated: i64,

    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub bought: bool,
    #[serde(default)]
    pub shop: String,
    #[serde(default)]
    pub description: Option<String>,
    /// When the purchase is planned, if scheduled.
    #[serde(default)]
    pub when: Option<DateTime<Utc>>,
}

impl Item {
    pub fn new(title: impl Into<String>, amount: f64, unit: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            amount,
            unit: unit.into(),
            ..Default::default()
        }
    }

    pub fn with_shop(mut self, shop: impl Into<String>) -> Self {
        self.shop = shop.into();
        self
    }

    pub fn with_bought(mut self, bought: bool) -> Self {
        self.bought = bought;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_when(mut self, when: DateTime<Utc>) -> Self {
        self.when = Some(when);
        self
    }
}

/// An item together with its storage key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemWithId {
    pub id: ItemKey,
    #[serde(flatten)]
    pub item: Item,
}

impl ItemWithId {
    pub fn new(id: impl Into<String>, item: Item) -> Self {
        Self {
            id: id.into(),
            item,
        }
    }
}

/// Single row produced by the count statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Total {
    pub total: u64,
}

/// Build a namespaced key, e.g. `item_key("item", "Milk") == "item:Milk"`.
pub fn item_key(prefix: &str, id: &str) -> ItemKey {
    format!("{}:{}", prefix, id)
}

/// Mint a fresh, time-ordered item key.
pub fn new_item_key() -> ItemKey {
    uuid::Uuid::now_v7().to_string()
}

/// Current wall-clock time in epoch milliseconds.
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
