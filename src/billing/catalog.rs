//! Product catalog: which purchasable product grants how many credits.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A purchasable credit pack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Billing provider's product identifier.
    pub id: String,
    /// Short name used by checkout links ("small", "medium", ...).
    pub slug: String,
    /// Credits granted per paid order.
    pub credits: u32,
}

impl Product {
    fn new(id: &str, slug: &str, credits: u32) -> Self {
        Self {
            id: id.to_string(),
            slug: slug.to_string(),
            credits,
        }
    }
}

/// Credit packs sold through Polar.
pub fn default_products() -> Vec<Product> {
    vec![
        Product::new("1abe9287-6989-4203-a36d-0ac1b62caa50", "small", 50),
        Product::new("8b80fb8a-9ce8-4f1f-a17a-6c187e2f0571", "medium", 200),
        Product::new("e63b831e-76a9-4a65-9aae-ce415b2961cc", "large", 400),
    ]
}

/// Fixed lookup from product id to credit amount.
#[derive(Debug, Clone)]
pub struct ProductCatalog {
    products: Vec<Product>,
}

impl ProductCatalog {
    /// Build a catalog, rejecting empty or duplicate ids and slugs.
    pub fn new(products: Vec<Product>) -> anyhow::Result<Self> {
        let mut ids = HashSet::new();
        let mut slugs = HashSet::new();
        for product in &products {
            if product.id.trim().is_empty() {
                anyhow::bail!("Product id cannot be empty (slug: {})", product.slug);
            }
            if !ids.insert(product.id.as_str()) {
                anyhow::bail!("Duplicate product id in catalog: {}", product.id);
            }
            if !slugs.insert(product.slug.as_str()) {
                anyhow::bail!("Duplicate product slug in catalog: {}", product.slug);
            }
        }
        Ok(Self { products })
    }

    /// Credits granted for a product, or `None` if the id is not in the catalog.
    pub fn credits_for(&self, product_id: &str) -> Option<u32> {
        self.products
            .iter()
            .find(|p| p.id == product_id)
            .map(|p| p.credits)
    }

    pub fn find_by_slug(&self, slug: &str) -> Option<&Product> {
        self.products.iter().find(|p| p.slug == slug)
    }

    pub fn products(&self) -> &[Product] {
        &self.products
    }
}

impl Default for ProductCatalog {
    fn default() -> Self {
        Self {
            products: default_products(),
        }
    }
}
