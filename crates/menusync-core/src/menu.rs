// Menu documents
// Decision: A menu is stored as one document; products are embedded and addressed by their sheet id

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Availability of a product inside a menu
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    Available,
    NotAvailable,
    Deleted,
}

impl ProductStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductStatus::Available => "available",
            ProductStatus::NotAvailable => "not_available",
            ProductStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ProductStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProductStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(ProductStatus::Available),
            "not_available" => Ok(ProductStatus::NotAvailable),
            "deleted" => Ok(ProductStatus::Deleted),
            other => Err(format!("unknown product status: {other}")),
        }
    }
}

/// A sellable item of a menu
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_combo: bool,
    pub price: f64,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
    pub status: ProductStatus,
    /// Ids of the attribute groups offered with this product
    #[serde(default)]
    pub attributes: Vec<String>,
}

/// A group of options (e.g. "Sauces", pick 0..2)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeGroup {
    pub id: String,
    pub name: String,
    pub min: i32,
    pub max: i32,
    /// Ids of the attributes in this group
    #[serde(default)]
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub id: String,
    pub name: String,
    pub min: i32,
    pub max: i32,
    pub price: f64,
}

/// A restaurant menu produced by parsing a spreadsheet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Menu {
    pub id: Uuid,
    pub name: String,
    pub restaurant_id: String,
    #[serde(default)]
    pub products: Vec<Product>,
    #[serde(default)]
    pub attribute_groups: Vec<AttributeGroup>,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Menu {
    /// Create an empty menu for a restaurant
    pub fn new(restaurant_name: impl Into<String>) -> Self {
        let name = restaurant_name.into();
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            restaurant_id: restaurant_id_from_name(&name),
            name,
            products: Vec::new(),
            attribute_groups: Vec::new(),
            attributes: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn product(&self, product_id: &str) -> Option<&Product> {
        self.products.iter().find(|p| p.id == product_id)
    }

    pub fn product_mut(&mut self, product_id: &str) -> Option<&mut Product> {
        self.products.iter_mut().find(|p| p.id == product_id)
    }

    /// Set the status of an embedded product.
    ///
    /// Returns `None` when the product is not part of this menu, otherwise
    /// whether the stored status actually changed.
    pub fn set_product_status(&mut self, product_id: &str, status: ProductStatus) -> Option<bool> {
        let product = self.product_mut(product_id)?;
        let changed = product.status != status;
        product.status = status;
        if changed {
            self.updated_at = Utc::now();
        }
        Some(changed)
    }
}

/// Derive the restaurant id from its display name ("Casa Pepe" -> "casa-pepe")
pub fn restaurant_id_from_name(name: &str) -> String {
    name.to_lowercase().replace(' ', "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(id: &str, status: ProductStatus) -> Product {
        Product {
            id: id.to_string(),
            name: format!("product {id}"),
            is_combo: false,
            price: 10.0,
            category: "Mains".to_string(),
            description: String::new(),
            status,
            attributes: vec![],
        }
    }

    #[test]
    fn test_restaurant_id_from_name() {
        assert_eq!(restaurant_id_from_name("Casa Pepe"), "casa-pepe");
        assert_eq!(restaurant_id_from_name("BURGER  Hub"), "burger--hub");
        assert_eq!(restaurant_id_from_name("solo"), "solo");
    }

    #[test]
    fn test_new_menu_derives_restaurant_id() {
        let menu = Menu::new("The Green Fork");
        assert_eq!(menu.name, "The Green Fork");
        assert_eq!(menu.restaurant_id, "the-green-fork");
        assert!(menu.products.is_empty());
    }

    #[test]
    fn test_set_product_status() {
        let mut menu = Menu::new("Test");
        menu.products.push(product("p1", ProductStatus::Available));

        assert_eq!(
            menu.set_product_status("p1", ProductStatus::NotAvailable),
            Some(true)
        );
        assert_eq!(
            menu.set_product_status("p1", ProductStatus::NotAvailable),
            Some(false)
        );
        assert_eq!(menu.set_product_status("missing", ProductStatus::Deleted), None);
        assert_eq!(
            menu.product("p1").map(|p| p.status),
            Some(ProductStatus::NotAvailable)
        );
    }

    #[test]
    fn test_product_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&ProductStatus::NotAvailable).unwrap(),
            "\"not_available\""
        );
        assert_eq!(
            "deleted".parse::<ProductStatus>().unwrap(),
            ProductStatus::Deleted
        );
        assert!("sold_out".parse::<ProductStatus>().is_err());
    }
}
