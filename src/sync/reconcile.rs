//! Diff the remote catalog against local state into an ordered action plan.
//!
//! Planning is pure: it reads a [`CatalogSnapshot`] and the local items and
//! never performs I/O. Removal detection is only enabled when the snapshot
//! is complete; a listing that failed or was cut short never yields
//! `Archive`.

use futures::stream::{Stream, StreamExt};
use std::collections::{HashMap, HashSet};

use crate::remote::{CatalogError, RemoteBookmark};
use crate::storage::{BookmarkItem, ContentType, ItemStatus};

/// Everything the remote catalog returned this cycle.
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    /// Descriptors in listing order, duplicates removed (first wins).
    pub items: Vec<RemoteBookmark>,
    /// Set when the listing ended early; the snapshot is then incomplete.
    pub error: Option<CatalogError>,
}

impl CatalogSnapshot {
    /// Drain a catalog stream. Stops at the first error.
    pub async fn collect<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<RemoteBookmark, CatalogError>>,
    {
        let mut stream = std::pin::pin!(stream);
        let mut snapshot = Self::default();
        let mut seen = HashSet::new();

        while let Some(next) = stream.next().await {
            match next {
                Ok(item) => {
                    if seen.insert(item.id.clone()) {
                        snapshot.items.push(item);
                    } else {
                        tracing::warn!(item_id = %item.id, "Duplicate id in catalog listing, keeping first");
                    }
                }
                Err(e) => {
                    snapshot.error = Some(e);
                    break;
                }
            }
        }
        snapshot
    }

    /// Complete snapshot from already-listed descriptors.
    pub fn complete(items: Vec<RemoteBookmark>) -> Self {
        Self { items, error: None }
    }

    /// True when the listing reached its end without error.
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// Local items as read at cycle start.
#[derive(Debug, Default)]
pub struct LocalSnapshot {
    pub items: Vec<BookmarkItem>,
    /// Ids whose rows failed to decode. They are planned neither as present
    /// nor as absent, so the stored row stays as it is.
    pub corrupt: HashSet<String>,
}

impl From<Vec<BookmarkItem>> for LocalSnapshot {
    fn from(items: Vec<BookmarkItem>) -> Self {
        Self {
            items,
            corrupt: HashSet::new(),
        }
    }
}

/// Inputs to planning that come from configuration.
#[derive(Debug, Clone, Copy)]
pub struct PlanPolicy {
    pub retry_ceiling: u32,
    pub video_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Add,
    Refetch,
    Archive,
    NoOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefetchReason {
    /// Last attempt failed and the retry ceiling is not reached.
    PreviouslyFailed,
    /// Created earlier but never fetched (e.g. interrupted cycle).
    NeverFetched,
    /// The bookmark now points at a different URL.
    SourceChanged,
    /// Video downloads are enabled and this item lacks its video.
    VideoMissing,
    /// Archived earlier and listed again.
    Restored,
}

/// Title/tags change to apply without refetching.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataUpdate {
    pub title: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Add {
        remote: RemoteBookmark,
    },
    Refetch {
        remote: RemoteBookmark,
        local: BookmarkItem,
        reason: RefetchReason,
    },
    Archive {
        local: BookmarkItem,
    },
    NoOp {
        id: String,
        metadata: Option<MetadataUpdate>,
    },
}

impl Action {
    pub fn id(&self) -> &str {
        match self {
            Action::Add { remote } | Action::Refetch { remote, .. } => &remote.id,
            Action::Archive { local } => &local.id,
            Action::NoOp { id, .. } => id,
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Add { .. } => ActionKind::Add,
            Action::Refetch { .. } => ActionKind::Refetch,
            Action::Archive { .. } => ActionKind::Archive,
            Action::NoOp { .. } => ActionKind::NoOp,
        }
    }
}

fn metadata_update(remote: &RemoteBookmark, local: &BookmarkItem) -> Option<MetadataUpdate> {
    (remote.title != local.title || remote.tags != local.tags).then(|| MetadataUpdate {
        title: remote.title.clone(),
        tags: remote.tags.clone(),
    })
}

fn classify(remote: &RemoteBookmark, local: &BookmarkItem, policy: &PlanPolicy) -> Action {
    let refetch = |reason| Action::Refetch {
        remote: remote.clone(),
        local: local.clone(),
        reason,
    };

    match local.status {
        ItemStatus::Archived => refetch(RefetchReason::Restored),
        ItemStatus::Pending => refetch(RefetchReason::NeverFetched),
        ItemStatus::Failed if local.failure_count < policy.retry_ceiling => {
            refetch(RefetchReason::PreviouslyFailed)
        }
        ItemStatus::Failed => {
            tracing::debug!(
                item_id = %local.id,
                failures = local.failure_count,
                "Retry ceiling reached, leaving item failed"
            );
            Action::NoOp {
                id: local.id.clone(),
                metadata: metadata_update(remote, local),
            }
        }
        ItemStatus::Fetched if remote.url != local.url => refetch(RefetchReason::SourceChanged),
        ItemStatus::Fetched
            if policy.video_enabled
                && remote.content_type == ContentType::Video
                && local.video_path.is_none() =>
        {
            refetch(RefetchReason::VideoMissing)
        }
        ItemStatus::Fetched => Action::NoOp {
            id: local.id.clone(),
            metadata: metadata_update(remote, local),
        },
    }
}

/// Build the action plan for one cycle.
///
/// Order: `Archive` first, then `Add`/`Refetch` in listing order, then `NoOp`.
/// Every id appears at most once; corrupt ids never appear.
pub fn plan(snapshot: &CatalogSnapshot, local: &LocalSnapshot, policy: &PlanPolicy) -> Vec<Action> {
    let by_id: HashMap<&str, &BookmarkItem> =
        local.items.iter().map(|i| (i.id.as_str(), i)).collect();

    let mut archives = Vec::new();
    let mut fetches = Vec::new();
    let mut noops = Vec::new();

    for remote in &snapshot.items {
        if local.corrupt.contains(&remote.id) {
            continue;
        }
        let action = match by_id.get(remote.id.as_str()) {
            None => Action::Add {
                remote: remote.clone(),
            },
            Some(local) => classify(remote, local, policy),
        };
        match action.kind() {
            ActionKind::NoOp => noops.push(action),
            _ => fetches.push(action),
        }
    }

    if snapshot.is_complete() {
        let remote_ids: HashSet<&str> = snapshot.items.iter().map(|r| r.id.as_str()).collect();
        for item in &local.items {
            let removable = matches!(item.status, ItemStatus::Fetched | ItemStatus::Failed);
            if removable && !remote_ids.contains(item.id.as_str()) {
                archives.push(Action::Archive {
                    local: item.clone(),
                });
            }
        }
    } else {
        tracing::warn!("Catalog listing incomplete, removal detection disabled this cycle");
    }

    archives.extend(fetches);
    archives.extend(noops);
    archives
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::bookmark;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::path::PathBuf;

    const POLICY: PlanPolicy = PlanPolicy {
        retry_ceiling: 3,
        video_enabled: false,
    };

    fn local(id: &str, status: ItemStatus) -> BookmarkItem {
        let remote = bookmark(id);
        let mut item = BookmarkItem::pending(
            remote.id,
            remote.url,
            remote.title,
            remote.tags,
            remote.content_type,
        );
        item.status = status;
        if matches!(status, ItemStatus::Fetched | ItemStatus::Archived) {
            let path = PathBuf::from(format!("/offline/article/{id}.html"));
            item.local_path = Some(path.clone());
            item.article_path = Some(path);
        }
        item
    }

    fn kinds(plan: &[Action]) -> Vec<(String, ActionKind)> {
        plan.iter().map(|a| (a.id().to_string(), a.kind())).collect()
    }

    #[test]
    fn test_new_items_are_added() {
        let snapshot = CatalogSnapshot::complete(vec![bookmark("a"), bookmark("b")]);
        let plan = plan(&snapshot, &LocalSnapshot::default(), &POLICY);
        assert_eq!(
            kinds(&plan),
            vec![("a".into(), ActionKind::Add), ("b".into(), ActionKind::Add)]
        );
    }

    #[test]
    fn test_missing_fetched_item_is_archived_first() {
        let snapshot = CatalogSnapshot::complete(vec![bookmark("a"), bookmark("c")]);
        let locals = vec![local("a", ItemStatus::Fetched), local("b", ItemStatus::Fetched)];
        let plan = plan(&snapshot, &LocalSnapshot::from(locals), &POLICY);
        assert_eq!(
            kinds(&plan),
            vec![
                ("b".into(), ActionKind::Archive),
                ("c".into(), ActionKind::Add),
                ("a".into(), ActionKind::NoOp),
            ]
        );
    }

    #[test]
    fn test_incomplete_listing_never_archives() {
        let snapshot = CatalogSnapshot {
            items: vec![bookmark("a")],
            error: Some(CatalogError::Timeout),
        };
        let locals = vec![local("a", ItemStatus::Fetched), local("b", ItemStatus::Fetched)];
        let plan = plan(&snapshot, &LocalSnapshot::from(locals), &POLICY);
        assert!(plan.iter().all(|a| a.kind() != ActionKind::Archive));
    }

    #[test]
    fn test_pending_and_archived_absent_items_are_not_archived() {
        let snapshot = CatalogSnapshot::complete(vec![]);
        let locals = vec![local("p", ItemStatus::Pending), local("z", ItemStatus::Archived)];
        assert!(plan(&snapshot, &LocalSnapshot::from(locals), &POLICY).is_empty());
    }

    #[test]
    fn test_corrupt_ids_are_not_planned() {
        let snapshot = CatalogSnapshot::complete(vec![bookmark("a"), bookmark("z")]);
        let mut locals = LocalSnapshot::from(vec![local("b", ItemStatus::Fetched)]);
        locals.corrupt.insert("z".to_string());

        let plan = plan(&snapshot, &locals, &POLICY);
        assert_eq!(
            kinds(&plan),
            vec![("b".into(), ActionKind::Archive), ("a".into(), ActionKind::Add)]
        );
    }

    #[test]
    fn test_failed_item_refetched_below_ceiling() {
        let mut failed = local("a", ItemStatus::Failed);
        failed.failure_count = 2;
        let snapshot = CatalogSnapshot::complete(vec![bookmark("a")]);
        let plan = plan(&snapshot, &LocalSnapshot::from(vec![failed]), &POLICY);
        assert!(matches!(
            plan[0],
            Action::Refetch {
                reason: RefetchReason::PreviouslyFailed,
                ..
            }
        ));
    }

    #[test]
    fn test_failed_item_left_alone_at_ceiling() {
        let mut failed = local("a", ItemStatus::Failed);
        failed.failure_count = 3;
        let snapshot = CatalogSnapshot::complete(vec![bookmark("a")]);
        let plan = plan(&snapshot, &LocalSnapshot::from(vec![failed]), &POLICY);
        assert_eq!(kinds(&plan), vec![("a".into(), ActionKind::NoOp)]);
    }

    #[test]
    fn test_metadata_change_is_noop_with_update() {
        let mut remote = bookmark("a");
        remote.title = "Renamed".into();
        remote.tags = vec!["new".into()];
        let snapshot = CatalogSnapshot::complete(vec![remote]);
        let plan = plan(
            &snapshot,
            &LocalSnapshot::from(vec![local("a", ItemStatus::Fetched)]),
            &POLICY,
        );
        assert_eq!(
            plan,
            vec![Action::NoOp {
                id: "a".into(),
                metadata: Some(MetadataUpdate {
                    title: "Renamed".into(),
                    tags: vec!["new".into()],
                }),
            }]
        );
    }

    #[test]
    fn test_changed_url_is_refetched() {
        let mut remote = bookmark("a");
        remote.url = "https://example.com/moved".into();
        let snapshot = CatalogSnapshot::complete(vec![remote]);
        let plan = plan(
            &snapshot,
            &LocalSnapshot::from(vec![local("a", ItemStatus::Fetched)]),
            &POLICY,
        );
        assert!(matches!(
            plan[0],
            Action::Refetch {
                reason: RefetchReason::SourceChanged,
                ..
            }
        ));
    }

    #[test]
    fn test_video_enabled_refetches_missing_video() {
        let mut remote = bookmark("v");
        remote.content_type = ContentType::Video;
        let mut item = local("v", ItemStatus::Fetched);
        item.content_type = ContentType::Video;
        let snapshot = CatalogSnapshot::complete(vec![remote]);

        let off = plan(&snapshot, &LocalSnapshot::from(vec![item.clone()]), &POLICY);
        assert_eq!(off[0].kind(), ActionKind::NoOp);

        let on = plan(
            &snapshot,
            &LocalSnapshot::from(vec![item]),
            &PlanPolicy {
                video_enabled: true,
                ..POLICY
            },
        );
        assert!(matches!(
            on[0],
            Action::Refetch {
                reason: RefetchReason::VideoMissing,
                ..
            }
        ));
    }

    #[test]
    fn test_reappearing_archived_item_is_restored() {
        let snapshot = CatalogSnapshot::complete(vec![bookmark("a")]);
        let plan = plan(
            &snapshot,
            &LocalSnapshot::from(vec![local("a", ItemStatus::Archived)]),
            &POLICY,
        );
        assert!(matches!(
            plan[0],
            Action::Refetch {
                reason: RefetchReason::Restored,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_collect_drops_duplicates_and_stops_at_error() {
        let items = vec![
            Ok(bookmark("a")),
            Ok(bookmark("a")),
            Ok(bookmark("b")),
            Err(CatalogError::Timeout),
            Ok(bookmark("c")),
        ];
        let snapshot = CatalogSnapshot::collect(futures::stream::iter(items)).await;
        let ids: Vec<&str> = snapshot.items.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(!snapshot.is_complete());
    }

    fn status_strategy() -> impl Strategy<Value = ItemStatus> {
        prop_oneof![
            Just(ItemStatus::Pending),
            Just(ItemStatus::Fetched),
            Just(ItemStatus::Failed),
            Just(ItemStatus::Archived),
        ]
    }

    proptest! {
        #[test]
        fn prop_incomplete_snapshot_never_archives(
            remote_ids in prop::collection::hash_set(0u8..40, 0..20),
            locals in prop::collection::hash_map(0u8..40, status_strategy(), 0..20),
        ) {
            let snapshot = CatalogSnapshot {
                items: remote_ids.iter().map(|i| bookmark(&i.to_string())).collect(),
                error: Some(CatalogError::Unavailable("down".into())),
            };
            let locals: Vec<BookmarkItem> =
                locals.iter().map(|(id, s)| local(&id.to_string(), *s)).collect();

            let plan = plan(&snapshot, &LocalSnapshot::from(locals), &POLICY);
            prop_assert!(plan.iter().all(|a| a.kind() != ActionKind::Archive));
        }

        #[test]
        fn prop_plan_is_sound(
            remote_ids in prop::collection::hash_set(0u8..40, 0..20),
            locals in prop::collection::hash_map(0u8..40, status_strategy(), 0..20),
        ) {
            let snapshot = CatalogSnapshot::complete(
                remote_ids.iter().map(|i| bookmark(&i.to_string())).collect(),
            );
            let local_items: Vec<BookmarkItem> =
                locals.iter().map(|(id, s)| local(&id.to_string(), *s)).collect();
            let plan = plan(&snapshot, &LocalSnapshot::from(local_items), &POLICY);

            // Each id at most once
            let mut seen = HashSet::new();
            for action in &plan {
                prop_assert!(seen.insert(action.id().to_string()));
            }

            for action in &plan {
                let id: u8 = action.id().parse().unwrap();
                match action {
                    Action::Archive { local } => {
                        prop_assert!(!remote_ids.contains(&id));
                        prop_assert!(matches!(local.status, ItemStatus::Fetched | ItemStatus::Failed));
                    }
                    Action::Add { .. } => prop_assert!(!locals.contains_key(&id)),
                    _ => prop_assert!(locals.contains_key(&id) && remote_ids.contains(&id)),
                }
            }

            // Every remote id is planned
            for id in &remote_ids {
                prop_assert!(seen.contains(&id.to_string()));
            }

            // Archive actions come first
            let first_other = plan.iter().position(|a| a.kind() != ActionKind::Archive);
            if let Some(pos) = first_other {
                prop_assert!(plan[pos..].iter().all(|a| a.kind() != ActionKind::Archive));
            }
        }
    }
}
