//! Lab test ("ensaio") lookups

use crate::RequestError;
use crate::auth::AuthProvider;
use crate::document_store::{Condition, Document, DocumentStore};
use crate::gateway::{DocumentOptions, Gateway, QueryOptions};

pub const ENSAIOS_COLLECTION: &str = "ensaios";
/// Page size of a category listing
pub const CATEGORY_LIMIT: usize = 50;

impl<S: DocumentStore, A: AuthProvider> Gateway<S, A> {
    pub async fn get_ensaio_details(&self, id: &str) -> Result<Document, RequestError> {
        self.get_document(ENSAIOS_COLLECTION, id, DocumentOptions::default())
            .await
    }

    /// First [`CATEGORY_LIMIT`] ensaios whose `category` equals `category`.
    pub async fn get_ensaios_by_category(
        &self,
        category: &str,
    ) -> Result<Vec<Document>, RequestError> {
        self.query_collection(
            ENSAIOS_COLLECTION,
            &[Condition::eq("category", category)],
            QueryOptions {
                limit: Some(CATEGORY_LIMIT),
                ..QueryOptions::default()
            },
        )
        .await
    }
}
