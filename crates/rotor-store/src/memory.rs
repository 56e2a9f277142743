//! In-process provider backed by a concurrent map.
//!
//! Filter evaluation mirrors the SQL the SQLite provider generates, so the
//! two are interchangeable in tests and single-node embeddings.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::document::Document;
use crate::error::{Result, StoreError};
use crate::filter::Filter;
use crate::provider::StorageProvider;

/// Thread-safe in-memory document store.
#[derive(Default)]
pub struct MemoryProvider {
    docs: DashMap<String, Value>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents across all collections.
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    fn key<T: Document>(id: &str) -> String {
        format!("{}/{}", T::COLLECTION, id)
    }
}

#[async_trait]
impl<T: Document> StorageProvider<T> for MemoryProvider {
    async fn insert(&self, entity: &T) -> Result<()> {
        let doc = serde_json::to_value(entity)?;
        if !doc.is_object() {
            return Err(StoreError::NotAnObject {
                id: entity.id().to_string(),
            });
        }
        self.docs.insert(Self::key::<T>(entity.id()), doc);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<T>> {
        match self.docs.get(&Self::key::<T>(id)) {
            Some(doc) => Ok(Some(serde_json::from_value(doc.value().clone())?)),
            None => Ok(None),
        }
    }

    async fn find(&self, filter: &Filter) -> Result<Vec<T>> {
        let prefix = format!("{}/", T::COLLECTION);
        let mut out = Vec::new();
        for entry in self.docs.iter() {
            if entry.key().starts_with(&prefix) && filter.matches(entry.value()) {
                out.push(serde_json::from_value(entry.value().clone())?);
            }
        }
        Ok(out)
    }

    async fn find_first(&self, filter: &Filter, order_field: &str) -> Result<Option<T>> {
        let prefix = format!("{}/", T::COLLECTION);
        let mut best: Option<(f64, Value)> = None;
        for entry in self.docs.iter() {
            if !entry.key().starts_with(&prefix) || !filter.matches(entry.value()) {
                continue;
            }
            let Some(key) = order_key(entry.value().get(order_field)) else {
                continue;
            };
            if best.as_ref().is_none_or(|(k, _)| key < *k) {
                best = Some((key, entry.value().clone()));
            }
        }
        match best {
            Some((_, doc)) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    async fn conditional_update(
        &self,
        id: &str,
        field: &str,
        observed: Option<&Value>,
        new: &Value,
    ) -> Result<bool> {
        let Some(mut entry) = self.docs.get_mut(&Self::key::<T>(id)) else {
            return Ok(false);
        };
        let current = entry.value().get(field).filter(|v| !v.is_null());
        if current != observed {
            return Ok(false);
        }
        if let Value::Object(map) = entry.value_mut() {
            map.insert(field.to_string(), new.clone());
            Ok(true)
        } else {
            Err(StoreError::NotAnObject { id: id.to_string() })
        }
    }
}

/// Sort key for `find_first`: the field's numeric value, or the smallest
/// element for arrays. `None` (missing / null / empty list) sorts last by
/// being excluded.
fn order_key(field: Option<&Value>) -> Option<f64> {
    match field? {
        Value::Number(n) => n.as_f64(),
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_f64())
            .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Probe {
        id: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        next_check: Option<i64>,
    }

    impl Document for Probe {
        const COLLECTION: &'static str = "probes";

        fn id(&self) -> &str {
            &self.id
        }
    }

    fn probe(id: &str, status: &str, next_check: Option<i64>) -> Probe {
        Probe {
            id: id.into(),
            status: status.into(),
            next_check,
        }
    }

    #[tokio::test]
    async fn insert_and_get_round_trip() {
        let store = MemoryProvider::new();
        let p = probe("a", "active", Some(100));
        store.insert(&p).await.unwrap();
        let got: Option<Probe> = store.get("a").await.unwrap();
        assert_eq!(got, Some(p));
        let missing: Option<Probe> = store.get("zzz").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn find_applies_filter() {
        let store = MemoryProvider::new();
        store.insert(&probe("a", "active", Some(50))).await.unwrap();
        store.insert(&probe("b", "idle", Some(50))).await.unwrap();
        store.insert(&probe("c", "active", None)).await.unwrap();

        let active: Vec<Probe> = store.find(&Filter::eq("status", "active")).await.unwrap();
        assert_eq!(active.len(), 2);

        let due: Vec<Probe> = store
            .find(&Filter::or(
                Filter::lt("next_check", 100),
                Filter::exists("next_check", false),
            ))
            .await
            .unwrap();
        let mut ids: Vec<_> = due.iter().map(|p| p.id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn find_first_orders_by_field() {
        let store = MemoryProvider::new();
        store.insert(&probe("late", "active", Some(900))).await.unwrap();
        store.insert(&probe("soon", "active", Some(100))).await.unwrap();
        store.insert(&probe("never", "active", None)).await.unwrap();

        let first: Option<Probe> = store.find_first(&Filter::all(), "next_check").await.unwrap();
        assert_eq!(first.unwrap().id, "soon");
    }

    #[tokio::test]
    async fn conditional_update_applies_only_on_match() {
        let store = MemoryProvider::new();
        store.insert(&probe("a", "active", Some(100))).await.unwrap();

        // Stale observation loses.
        let lost = StorageProvider::<Probe>::conditional_update(
            &store,
            "a",
            "next_check",
            Some(&json!(999)),
            &json!(200),
        )
        .await
        .unwrap();
        assert!(!lost);
        let got: Probe = store.get("a").await.unwrap().unwrap();
        assert_eq!(got.next_check, Some(100));

        // Matching observation wins.
        let won = StorageProvider::<Probe>::conditional_update(
            &store,
            "a",
            "next_check",
            Some(&json!(100)),
            &json!(200),
        )
        .await
        .unwrap();
        assert!(won);
        let got: Probe = store.get("a").await.unwrap().unwrap();
        assert_eq!(got.next_check, Some(200));
    }

    #[tokio::test]
    async fn conditional_update_from_absent_field() {
        let store = MemoryProvider::new();
        store.insert(&probe("a", "active", None)).await.unwrap();

        let ok = StorageProvider::<Probe>::conditional_update(
            &store,
            "a",
            "next_check",
            None,
            &json!(500),
        )
        .await
        .unwrap();
        assert!(ok);
        let got: Probe = store.get("a").await.unwrap().unwrap();
        assert_eq!(got.next_check, Some(500));

        // Unknown id is a clean false, not an error.
        let gone = StorageProvider::<Probe>::conditional_update(
            &store,
            "ghost",
            "next_check",
            None,
            &json!(1),
        )
        .await
        .unwrap();
        assert!(!gone);
    }
}
