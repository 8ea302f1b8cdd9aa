use crate::core::query::Query;
use crate::local::local_documents_view::LocalDocumentsView;
use crate::local::persistence::LocalState;
use crate::model::{DocumentMap, User};

/// How a query was answered from the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryStrategy {
    FullScan,
    IndexLookup,
}

/// Picks between an index-assisted lookup and a collection scan.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryEngine;

impl QueryEngine {
    pub fn get_documents_matching_query(
        &self,
        state: &LocalState,
        user: &User,
        query: &Query,
    ) -> (DocumentMap, QueryStrategy) {
        let view = LocalDocumentsView::new(state, user);
        if !query.is_document_query() {
            if let Some(candidates) = state.index().candidate_keys(query) {
                if !candidates.is_empty() {
                    return (
                        view.get_documents_matching_query(query, Some(&candidates)),
                        QueryStrategy::IndexLookup,
                    );
                }
                log::debug!("index miss for {}, scanning", query.canonical_id());
            }
        }
        (
            view.get_documents_matching_query(query, None),
            QueryStrategy::FullScan,
        )
    }
}
