//! Spreadsheet row layout to [`Menu`] conversion
//!
//! Expected columns (A..N), first row is a header:
//!
//! ```text
//! A id | B name | C is_combo | D price | E description
//! F group id | G group name | H group min | I group max
//! J attribute id | K attribute name | L attribute min | M attribute max | N attribute price
//! ```
//!
//! A row with a single cell (or a first cell and an empty second cell) starts
//! a category. A row with at least four cells and a first cell is a product.
//! Any other row with column F set declares an attribute group and, when
//! column J is set, one of its attributes; the group is attached to the
//! product read most recently.

use std::collections::HashMap;

use crate::menu::{Attribute, AttributeGroup, Menu, Product, ProductStatus};

/// Cell range fetched from the sheet
pub const SHEET_RANGE: &str = "A:N";

const COL_ID: usize = 0;
const COL_NAME: usize = 1;
const COL_IS_COMBO: usize = 2;
const COL_PRICE: usize = 3;
const COL_DESCRIPTION: usize = 4;
const COL_GROUP_ID: usize = 5;
const COL_GROUP_NAME: usize = 6;
const COL_GROUP_MIN: usize = 7;
const COL_GROUP_MAX: usize = 8;
const COL_ATTR_ID: usize = 9;
const COL_ATTR_NAME: usize = 10;
const COL_ATTR_MIN: usize = 11;
const COL_ATTR_MAX: usize = 12;
const COL_ATTR_PRICE: usize = 13;

/// Build a menu from raw sheet rows.
///
/// Returns `None` when the sheet has no rows at all. Numbers that do not
/// parse are left at zero.
pub fn menu_from_rows(rows: &[Vec<String>], restaurant_name: &str) -> Option<Menu> {
    if rows.is_empty() {
        return None;
    }

    let mut menu = Menu::new(restaurant_name);
    let mut category = String::new();
    let mut current: Option<Product> = None;
    let mut group_index: HashMap<String, usize> = HashMap::new();
    let mut attribute_index: HashMap<String, usize> = HashMap::new();

    for row in rows.iter().skip(1) {
        if row.is_empty() {
            continue;
        }

        if is_category_row(row) {
            category = row[COL_ID].clone();
            continue;
        }

        if !row[COL_ID].is_empty() && row.len() >= 4 {
            if let Some(product) = current.take() {
                menu.products.push(product);
            }
            current = Some(Product {
                id: row[COL_ID].clone(),
                name: cell(row, COL_NAME).to_string(),
                is_combo: cell(row, COL_IS_COMBO).eq_ignore_ascii_case("true"),
                price: parse_f64(cell(row, COL_PRICE)),
                category: category.clone(),
                description: cell(row, COL_DESCRIPTION).to_string(),
                status: ProductStatus::Available,
                attributes: Vec::new(),
            });
            continue;
        }

        let group_id = cell(row, COL_GROUP_ID);
        if group_id.is_empty() {
            continue;
        }

        let group_pos = *group_index.entry(group_id.to_string()).or_insert_with(|| {
            menu.attribute_groups.push(AttributeGroup {
                id: group_id.to_string(),
                name: cell(row, COL_GROUP_NAME).to_string(),
                min: parse_i32(cell(row, COL_GROUP_MIN)),
                max: parse_i32(cell(row, COL_GROUP_MAX)),
                attributes: Vec::new(),
            });
            menu.attribute_groups.len() - 1
        });

        let attribute_id = cell(row, COL_ATTR_ID);
        if attribute_id.is_empty() {
            continue;
        }

        attribute_index
            .entry(attribute_id.to_string())
            .or_insert_with(|| {
                menu.attributes.push(Attribute {
                    id: attribute_id.to_string(),
                    name: cell(row, COL_ATTR_NAME).to_string(),
                    min: parse_i32(cell(row, COL_ATTR_MIN)),
                    max: parse_i32(cell(row, COL_ATTR_MAX)),
                    price: parse_f64(cell(row, COL_ATTR_PRICE)),
                });
                menu.attributes.len() - 1
            });

        let group = &mut menu.attribute_groups[group_pos];
        if !group.attributes.iter().any(|a| a == attribute_id) {
            group.attributes.push(attribute_id.to_string());
        }

        if let Some(product) = current.as_mut() {
            if !product.attributes.iter().any(|g| g == group_id) {
                product.attributes.push(group_id.to_string());
            }
        }
    }

    if let Some(product) = current.take() {
        menu.products.push(product);
    }

    Some(menu)
}

fn is_category_row(row: &[String]) -> bool {
    row.len() == 1 || (!row[COL_ID].is_empty() && row[COL_NAME].is_empty())
}

fn cell(row: &[String], index: usize) -> &str {
    row.get(index).map(|s| s.as_str()).unwrap_or("")
}

fn parse_f64(value: &str) -> f64 {
    value.trim().parse().unwrap_or(0.0)
}

fn parse_i32(value: &str) -> i32 {
    value.trim().parse().unwrap_or(0)
}
