//! Per-user favorite ensaios
//!
//! Favorites live in `users/{user_id}/favorites`, one document per ensaio,
//! keyed by the ensaio id. They are read straight from the store, uncached.

use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::debug;

use crate::RequestError;
use crate::clock::{Clock, SystemClock, to_rfc3339};
use crate::document_store::{Document, DocumentStore, WriteMode};

fn favorites_collection(user_id: &str) -> String {
    format!("users/{}/favorites", user_id)
}

pub struct FavoritesService<S: DocumentStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: DocumentStore> FavoritesService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn add_favorite(&self, user_id: &str, ensaio_id: &str) -> Result<(), RequestError> {
        let mut fields = Map::new();
        fields.insert("ensaioId".to_owned(), json!(ensaio_id));
        fields.insert(
            "createdAt".to_owned(),
            Value::String(to_rfc3339(self.clock.now_millis())),
        );

        self.store
            .set(&favorites_collection(user_id), ensaio_id, fields, WriteMode::Replace)
            .await
            .map_err(|e| RequestError::from_upstream(e.into(), "Favorites addFavorite"))?;
        debug!("User {} favorited ensaio {}", user_id, ensaio_id);
        Ok(())
    }

    pub async fn remove_favorite(
        &self,
        user_id: &str,
        ensaio_id: &str,
    ) -> Result<(), RequestError> {
        self.store
            .delete(&favorites_collection(user_id), ensaio_id)
            .await
            .map_err(|e| RequestError::from_upstream(e.into(), "Favorites removeFavorite"))
    }

    pub async fn get_favorites(&self, user_id: &str) -> Result<Vec<Document>, RequestError> {
        self.store
            .query(&favorites_collection(user_id), &[], None)
            .await
            .map_err(|e| RequestError::from_upstream(e.into(), "Favorites getFavorites"))
    }

    pub async fn is_favorite(&self, user_id: &str, ensaio_id: &str) -> Result<bool, RequestError> {
        let doc = self
            .store
            .get(&favorites_collection(user_id), ensaio_id)
            .await
            .map_err(|e| RequestError::from_upstream(e.into(), "Favorites isFavorite"))?;
        Ok(doc.is_some())
    }
}
