//! Completion of background photo uploads

use std::collections::HashMap;

use super::SyncContext;
use crate::db::{RecordFilter, RecordStore, WriteBatch};
use crate::error::Result;
use crate::models::{SyncStatus, Visit};
use crate::util::now_utc;

/// Swap placeholder tokens on a visit for their uploaded URLs.
///
/// The rewritten visit becomes `pending` again so the next round pushes it.
/// Returns false when the visit is gone or none of its photos matched.
pub(crate) async fn apply_photo_uploads(
    ctx: &SyncContext,
    visit_id: &str,
    uploads: &HashMap<String, String>,
) -> Result<bool> {
    let visits = RecordStore::<Visit>::fetch(
        ctx.store.as_ref(),
        &RecordFilter::Id(visit_id.to_string()),
    )
    .await?;
    let Some(mut visit) = visits.into_iter().max_by_key(|visit| visit.updated_at) else {
        tracing::warn!(visit_id = %visit_id, "Photo uploads finished for a visit that no longer exists");
        return Ok(false);
    };
    if !visit.apply_photo_uploads(uploads) {
        return Ok(false);
    }

    visit.sync_status = SyncStatus::Pending;
    visit.updated_at = now_utc().max(visit.updated_at);
    let ready = visit.is_push_ready();
    let mut batch = WriteBatch::default();
    batch.upsert(visit);
    ctx.store.apply(batch).await?;

    tracing::debug!(visit_id = %visit_id, ready, "Applied photo uploads");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{placeholder_photo_token, Rating};
    use crate::sync::testing::MemoryRemote;
    use crate::sync::tests::context;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread")]
    async fn uploads_rewrite_tokens_and_mark_pending() {
        let (ctx, store) = context(Arc::new(MemoryRemote::new())).await;
        let token = placeholder_photo_token();
        let mut visit = Visit::new("user-1", "place-1", Rating::Great);
        visit.photo_urls = vec![token.clone()];
        visit.sync_status = SyncStatus::Synced;
        let mut batch = WriteBatch::default();
        batch.upsert(visit.clone());
        ctx.store.apply(batch).await.unwrap();

        let uploads = HashMap::from([(token, "https://cdn.example.com/1.jpg".to_string())]);
        assert!(apply_photo_uploads(&ctx, &visit.id.to_uppercase(), &uploads)
            .await
            .unwrap());

        let stored = store.fetch_visits(&RecordFilter::All).await.unwrap();
        assert_eq!(stored[0].photo_urls, vec!["https://cdn.example.com/1.jpg".to_string()]);
        assert_eq!(stored[0].sync_status, SyncStatus::Pending);
        assert!(stored[0].updated_at >= visit.updated_at);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_visit_is_ignored() {
        let (ctx, _) = context(Arc::new(MemoryRemote::new())).await;
        let uploads = HashMap::from([("x".to_string(), "y".to_string())]);
        assert!(!apply_photo_uploads(&ctx, "gone", &uploads).await.unwrap());
    }
}
