//! Sample shopping list used to initialise a fresh deployment.

use crate::error::Result;
use crate::item::{item_key, Item, ItemWithId};
use crate::store::ItemStore;

/// Key prefix of seeded items.
pub const SEED_PREFIX: &str = "item";

/// The sample entries, keyed by title.
pub fn sample_items() -> Vec<Item> {
    let entry = |title: &str, amount: f64, shop: &str, bought: bool| {
        Item::new(title, amount, "pc")
            .with_shop(shop)
            .with_bought(bought)
    };
    vec![
        entry("Cottage Cheese", 1.0, "Rewe", false),
        entry("Avocado", 2.0, "Edeka", true),
        entry("Banana", 1.0, "Edeka", true),
        entry("Milk", 2.0, "Edeka", true),
        entry("Bread", 1.0, "Edeka", true),
        entry("Sausages", 1.0, "Edeka", true),
        entry("Meat", 1.0, "Edeka", true),
        entry("Creme Fraiche", 1.0, "Edeka", true),
        entry("Wine", 1.0, "Edeka", true),
        entry("Napkins", 1.0, "Edeka", true),
        entry("Tomatoes", 1.0, "Edeka", true),
        entry("Cucumber", 1.0, "Edeka", true),
        entry("Ananas", 1.0, "Edeka", true),
        entry("Plums", 1.0, "Edeka", true),
        entry("Clementines", 1.0, "Edeka", true),
    ]
}

/// Upsert the sample list under `item:<title>` keys.
///
/// Re-running keeps each item's original `created` stamp.
pub async fn seed_sample_items(store: &ItemStore) -> Result<Vec<ItemWithId>> {
    let mut stored = Vec::new();
    for item in sample_items() {
        let key = item_key(SEED_PREFIX, &item.title);
        stored.push(store.upsert_item(&key, item).await?);
    }
    tracing::info!("Seeded {} sample items", stored.len());
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn sample_titles_are_unique() {
        let items = sample_items();
        let titles: HashSet<_> = items.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles.len(), items.len());
        assert_eq!(items.iter().filter(|i| !i.bought).count(), 1);
    }
}
