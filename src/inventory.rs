// Copyright 2026 Branch Mesh Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::InventoryError;

pub type ProductId = String;

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

/// A single catalogue row. Copies are handed out to callers; the live row
/// only ever lives inside [`InventoryStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub description: String,
    pub category: String,
    pub price: f64,
    pub qty: u64,
    pub min_stock: u64,
    pub updated_at: i64,
}

/// Derived stock status, computed from `qty`/`min_stock` on demand rather
/// than stored redundantly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockStatus {
    OutOfStock,
    LowStock,
    Overstocked,
    Normal,
}

impl Product {
    /// Validates the fields that must hold for a product to be admitted
    /// into the store: non-empty id, non-negative price.
    fn validate(&self) -> Result<(), InventoryError> {
        if self.id.trim().is_empty() {
            return Err(InventoryError::EmptyProductId);
        }
        if self.price < 0.0 {
            return Err(InventoryError::NegativeQuantity);
        }
        Ok(())
    }

    pub fn status(&self) -> StockStatus {
        if self.qty == 0 {
            StockStatus::OutOfStock
        } else if self.qty <= self.min_stock {
            StockStatus::LowStock
        } else if self.qty > self.min_stock.saturating_mul(3) {
            StockStatus::Overstocked
        } else {
            StockStatus::Normal
        }
    }

    fn touch(&mut self) {
        self.updated_at = now_millis();
    }
}

/// Replenishment target: how many units a product needs to reach `2 *
/// min_stock`, or zero if it is already there or above.
pub fn replenishment_needed(product: &Product) -> u64 {
    let target = product.min_stock.saturating_mul(2);
    target.saturating_sub(product.qty)
}

/// Running counters kept alongside the catalogue. Not a ledger of
/// individual transactions, just aggregate tallies for diagnostics.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct InventoryStats {
    pub transactions: u64,
    pub items_sold: u64,
    pub items_received: u64,
    pub last_modified: i64,
}

struct Inner {
    products: HashMap<ProductId, Product>,
    stats: InventoryStats,
}

/// Thread-safe per-branch product catalogue.
///
/// A single `RwLock` covers both the product map and the running counters
/// so that a mutation which touches both (e.g. `reduce`, which decrements
/// qty and bumps `items_sold`) is atomic with respect to any reader: a
/// caller observes a full pre-state or a full post-state, never a torn row.
#[derive(Clone)]
pub struct InventoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl Default for InventoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InventoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                products: HashMap::new(),
                stats: InventoryStats::default(),
            })),
        }
    }

    /// Seeds the store with an initial catalogue, as supplied by the
    /// launcher at boot. Invalid rows are skipped rather than aborting the
    /// whole seed.
    pub fn seeded(products: impl IntoIterator<Item = Product>) -> Self {
        let store = Self::new();
        for product in products {
            if let Err(e) = store.add(product.clone()) {
                tracing::warn!(product_id = %product.id, error = %e, "skipping invalid seed product");
            }
        }
        store
    }

    pub fn add(&self, mut product: Product) -> Result<(), InventoryError> {
        product.validate()?;
        let mut inner = self.inner.write();
        if inner.products.contains_key(&product.id) {
            return Err(InventoryError::AlreadyExists(product.id));
        }
        product.touch();
        inner.products.insert(product.id.clone(), product);
        inner.stats.transactions += 1;
        inner.stats.last_modified = now_millis();
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Product> {
        self.inner.read().products.get(id).cloned()
    }

    pub fn list(&self) -> Vec<Product> {
        self.inner.read().products.values().cloned().collect()
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        let removed = inner.products.remove(id).is_some();
        if removed {
            inner.stats.transactions += 1;
            inner.stats.last_modified = now_millis();
        }
        removed
    }

    pub fn update_qty(&self, id: &str, new_qty: u64) -> Result<(), InventoryError> {
        let mut inner = self.inner.write();
        let current_qty = inner
            .products
            .get(id)
            .map(|p| p.qty)
            .ok_or_else(|| InventoryError::NotFound(id.to_string()))?;
        let product = inner.products.get_mut(id).expect("checked above");
        product.qty = new_qty;
        product.touch();
        match new_qty.cmp(&current_qty) {
            std::cmp::Ordering::Greater => inner.stats.items_received += new_qty - current_qty,
            std::cmp::Ordering::Less => inner.stats.items_sold += current_qty - new_qty,
            std::cmp::Ordering::Equal => {}
        }
        inner.stats.transactions += 1;
        inner.stats.last_modified = now_millis();
        Ok(())
    }

    pub fn reduce(&self, id: &str, n: u64) -> Result<(), InventoryError> {
        if n == 0 {
            return Err(InventoryError::NegativeQuantity);
        }
        let mut inner = self.inner.write();
        let product = inner
            .products
            .get_mut(id)
            .ok_or_else(|| InventoryError::NotFound(id.to_string()))?;
        if product.qty < n {
            return Err(InventoryError::InsufficientStock {
                id: id.to_string(),
                have: product.qty,
                requested: n,
            });
        }
        product.qty -= n;
        product.touch();
        inner.stats.items_sold += n;
        inner.stats.transactions += 1;
        inner.stats.last_modified = now_millis();
        Ok(())
    }

    pub fn add_stock(&self, id: &str, n: u64) -> Result<(), InventoryError> {
        if n == 0 {
            return Err(InventoryError::NegativeQuantity);
        }
        let mut inner = self.inner.write();
        let product = inner
            .products
            .get_mut(id)
            .ok_or_else(|| InventoryError::NotFound(id.to_string()))?;
        product.qty += n;
        product.touch();
        inner.stats.items_received += n;
        inner.stats.transactions += 1;
        inner.stats.last_modified = now_millis();
        Ok(())
    }

    /// Equivalent to [`InventoryStore::reduce`], tagged as the source side
    /// of a stock transfer. `to_branch` is accepted for symmetry with
    /// `receive` and logging but carries no further behaviour here.
    pub fn transfer_out(
        &self,
        id: &str,
        n: u64,
        to_branch: &str,
    ) -> Result<(), InventoryError> {
        self.reduce(id, n).inspect_err(|e| {
            tracing::debug!(product_id = id, %to_branch, error = %e, "transfer-out refused");
        })
    }

    /// Equivalent to [`InventoryStore::add_stock`], tagged as the
    /// destination side of a stock transfer.
    pub fn receive(&self, id: &str, n: u64) -> Result<(), InventoryError> {
        self.add_stock(id, n)
    }

    /// Snapshot of products at or below their reorder point.
    pub fn low_stock(&self) -> Vec<Product> {
        self.inner
            .read()
            .products
            .values()
            .filter(|p| p.qty <= p.min_stock)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> InventoryStats {
        self.inner.read().stats
    }
}
