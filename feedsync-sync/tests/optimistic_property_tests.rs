//! Property-Based Tests for Optimistic Mutations
//!
//! **Property 5: Optimistic Rollback**
//!
//! For any mutation whose remote write rejects, the final emitted state
//! equals the pre-mutation state, and the caller sees the write error.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use feedsync_core::{
    Diagnostic, MutationError, NoopDiagnostics, Post, PostId, ProfileSummary, StoreResult,
    SyncConfig, SyncError, UserId, WriteError,
};
use feedsync_store::{CollectionSource, InMemoryBackingStore, Mutation, MutationSink};
use feedsync_sync::{
    Comparator, FeedSync, LocalCollection, MergedFeed, MergedView, OptimisticMutationCoordinator,
    OptimisticPatch, Patch, PatchId, PatchState, PatchTarget,
};
use feedsync_test_utils::assertions::{assert_timed_out, assert_write_failed};
use feedsync_test_utils::fixtures::{all_posts, post, rejected, test_config};
use feedsync_test_utils::generators::{arb_post, arb_posts};
use feedsync_test_utils::{settle, Recorder, RecordingDiagnostics};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use tokio::runtime::Runtime;

type View = MergedView<Post, ProfileSummary>;
type Feed = MergedFeed<Post, UserId, ProfileSummary>;

struct Harness {
    store: InMemoryBackingStore,
    sync: FeedSync<UserId, ProfileSummary>,
    diagnostics: RecordingDiagnostics,
}

impl Harness {
    fn new() -> Self {
        let store = InMemoryBackingStore::new(10);
        let diagnostics = RecordingDiagnostics::new();
        let sync = FeedSync::with_diagnostics(
            Arc::new(store.profiles().clone()),
            test_config(),
            diagnostics.shared(),
        )
        .expect("valid config");
        Self {
            store,
            sync,
            diagnostics,
        }
    }

    fn open(&self, seen: &Recorder<View>) -> Feed {
        let posts: Arc<dyn CollectionSource<Post>> = Arc::new(self.store.posts().clone());
        self.sync
            .merged_subscribe(posts, all_posts(), |p: &Post| p.author_id.clone(), seen.listener())
    }

    fn sink(&self) -> Arc<dyn MutationSink<Post>> {
        Arc::new(self.store.posts().clone())
    }
}

fn like(post: &Post) -> Post {
    Post {
        like_count: post.like_count + 1,
        ..post.clone()
    }
}

fn likes_of(view: &View, id: &str) -> Option<u32> {
    view.records()
        .find(|p| p.id.as_str() == id)
        .map(|p| p.like_count)
}

fn paused_runtime() -> Result<Runtime, TestCaseError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

#[derive(Debug, Clone)]
enum Change {
    Like(usize),
    Insert(Post),
    Delete(usize),
}

fn arb_change() -> impl Strategy<Value = Change> {
    prop_oneof![
        any::<usize>().prop_map(Change::Like),
        arb_post().prop_map(|mut p| {
            p.id = PostId::new("fresh");
            Change::Insert(p)
        }),
        any::<usize>().prop_map(Change::Delete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// **Property 5: Optimistic Rollback**
    #[test]
    fn prop_rejected_write_restores_view(posts in arb_posts(8), change in arb_change()) {
        let rt = paused_runtime()?;
        rt.block_on(async {
            let h = Harness::new();
            for p in &posts {
                h.store.posts().upsert(p.clone());
            }
            let seen = Recorder::new();
            let feed = h.open(&seen);
            settle().await;
            let before = feed.view().map(|v| v.items);

            let (id, patch) = match (change, posts.is_empty()) {
                (Change::Like(i), false) => (posts[i % posts.len()].id.clone(), Patch::update(like)),
                (Change::Delete(i), false) => (posts[i % posts.len()].id.clone(), Patch::Remove),
                (Change::Insert(p), _) => (p.id.clone(), Patch::Upsert(p)),
                (_, true) => {
                    let p = post("fresh", "ua", 0);
                    (p.id.clone(), Patch::Upsert(p))
                }
            };
            let result = h
                .sync
                .mutate(&feed, id, patch, async { Err::<(), _>(rejected("nope")) })
                .await;
            settle().await;

            prop_assert!(result.as_ref().err().and_then(SyncError::write_error).is_some());
            prop_assert_eq!(feed.view().map(|v| v.items), before.clone());
            prop_assert_eq!(seen.last().map(|v| v.items), before);
            prop_assert!(feed.pending_patches().is_empty());
            Ok(())
        })?;
    }
}

/// A rejected like emits the incremented count, then the original, in
/// that order.
#[tokio::test(start_paused = true)]
async fn scenario_rejected_like_emits_increment_then_original() {
    let h = Harness::new();
    let mut original = post("p1", "a", 10);
    original.like_count = 5;
    h.store.posts().upsert(original);
    let seen = Recorder::new();
    let feed = h.open(&seen);
    settle().await;
    seen.take();

    let result = h
        .sync
        .mutate(&feed, PostId::new("p1"), Patch::update(like), async {
            Err::<(), _>(rejected("backend said no"))
        })
        .await;

    let likes: Vec<Option<u32>> = seen.take().iter().map(|v| likes_of(v, "p1")).collect();
    assert_eq!(likes, vec![Some(6), Some(5)]);
    assert_eq!(
        assert_write_failed(&result),
        rejected("backend said no")
    );
}

#[tokio::test(start_paused = true)]
async fn test_write_through_sink_is_echoed_and_cleared() {
    let h = Harness::new();
    h.store.posts().upsert(post("p1", "a", 10));
    let seen = Recorder::new();
    let feed = h.open(&seen);
    settle().await;

    h.sync
        .mutate_through(&feed, h.sink(), "posts", PostId::new("p1"), Patch::update(like))
        .await
        .unwrap();
    settle().await;

    assert!(feed.pending_patches().is_empty());
    assert_eq!(likes_of(&feed.view().unwrap(), "p1"), Some(1));
    assert_eq!(h.store.posts().get(&PostId::new("p1")).unwrap().like_count, 1);
    assert!(matches!(
        h.store.posts().writes().as_slice(),
        [Mutation::Upsert { collection, record }] if collection == "posts" && record.like_count == 1
    ));
}

#[tokio::test(start_paused = true)]
async fn test_optimistic_insert_and_delete_through_sink() {
    let h = Harness::new();
    h.store.posts().upsert(post("p1", "a", 10));
    let seen = Recorder::new();
    let feed = h.open(&seen);
    settle().await;

    h.sync
        .mutate_through(&feed, h.sink(), "posts", PostId::new("p2"), Patch::Upsert(post("p2", "b", 20)))
        .await
        .unwrap();
    h.sync
        .mutate_through(&feed, h.sink(), "posts", PostId::new("p1"), Patch::Remove)
        .await
        .unwrap();
    settle().await;

    let view = feed.view().unwrap();
    assert_eq!(view.records().map(|p| p.id.as_str()).collect::<Vec<_>>(), vec!["p2"]);
    assert!(matches!(
        h.store.posts().writes().last(),
        Some(Mutation::Delete { id, .. }) if id.as_str() == "p1"
    ));
}

#[tokio::test(start_paused = true)]
async fn test_confirmed_patch_without_echo_expires() {
    let h = Harness::new();
    h.store.posts().upsert(post("p1", "a", 10));
    h.store.posts().set_echo_writes(false);
    let seen = Recorder::new();
    let feed = h.open(&seen);
    settle().await;

    h.sync
        .mutate_through(&feed, h.sink(), "posts", PostId::new("p1"), Patch::update(like))
        .await
        .unwrap();
    assert_eq!(likes_of(&feed.view().unwrap(), "p1"), Some(1));
    assert!(matches!(
        feed.pending_patches().as_slice(),
        [(_, PatchState::Confirmed)]
    ));

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(feed.pending_patches().len(), 1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(feed.pending_patches().is_empty());
    assert_eq!(likes_of(&seen.last().unwrap(), "p1"), Some(0));
    assert_eq!(
        h.diagnostics
            .count(|d| matches!(d, Diagnostic::PatchExpired { .. })),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_write_timeout_rolls_back_and_reports_late_outcome() {
    let h = Harness::new();
    h.store.posts().upsert(post("p1", "a", 10));
    h.store.posts().set_write_delay(Some(Duration::from_secs(10)));
    let seen = Recorder::new();
    let feed = h.open(&seen);
    settle().await;

    let result = h
        .sync
        .mutate_through(&feed, h.sink(), "posts", PostId::new("p1"), Patch::update(like))
        .await;
    assert_timed_out(&result);
    assert_eq!(likes_of(&feed.view().unwrap(), "p1"), Some(0));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(
        h.diagnostics.count(|d| matches!(
            d,
            Diagnostic::LateWriteOutcome {
                succeeded: true,
                ..
            }
        )),
        1
    );
    // The late write still landed, and the feed follows the store.
    assert_eq!(likes_of(&feed.view().unwrap(), "p1"), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_update_of_unknown_record_is_refused() {
    let h = Harness::new();
    let seen = Recorder::new();
    let feed = h.open(&seen);
    settle().await;
    let delivered = seen.len();

    let result = h
        .sync
        .mutate(&feed, PostId::new("ghost"), Patch::update(like), async {
            Ok::<(), WriteError>(())
        })
        .await;

    assert!(matches!(
        result,
        Err(SyncError::Mutation(MutationError::UnknownRecord { .. }))
    ));
    assert_eq!(seen.len(), delivered);
}

// ============================================================================
// LOCAL COLLECTIONS
// ============================================================================

fn local_posts() -> Arc<LocalCollection<Post>> {
    let newest_first: Comparator<Post> = Arc::new(|a, b| b.created_at.cmp(&a.created_at));
    Arc::new(
        LocalCollection::new(vec![post("p1", "a", 10), post("p2", "a", 20), post("p3", "a", 30)])
            .with_comparator(newest_first),
    )
}

fn local_ids(items: &[Post]) -> Vec<&str> {
    items.iter().map(|p| p.id.as_str()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_local_collection_rollback_restores_position() {
    let coordinator = OptimisticMutationCoordinator::new(&SyncConfig::default(), Arc::new(NoopDiagnostics));
    let target = local_posts();
    let seen: Recorder<Vec<Post>> = Recorder::new();
    let _sub = target.subscribe(seen.listener());
    let original = target.snapshot();
    assert_eq!(local_ids(&original), vec!["p3", "p2", "p1"]);

    let result = coordinator
        .mutate(&target, PostId::new("p2"), Patch::Remove, async {
            Err::<(), _>(rejected("offline"))
        })
        .await;

    assert!(result.is_err());
    let emitted = seen.take();
    assert_eq!(emitted.len(), 2);
    assert_eq!(local_ids(&emitted[0]), vec!["p3", "p1"]);
    assert_eq!(emitted[1], original);
    assert_eq!(target.patch_state(1), Some(PatchState::Failed));
}

#[tokio::test(start_paused = true)]
async fn test_local_collection_confirms_successful_insert() {
    let coordinator = OptimisticMutationCoordinator::new(&SyncConfig::default(), Arc::new(NoopDiagnostics));
    let target = local_posts();

    coordinator
        .mutate(&target, PostId::new("p4"), Patch::Upsert(post("p4", "b", 25)), async {
            Ok::<(), WriteError>(())
        })
        .await
        .unwrap();

    assert_eq!(local_ids(&target.snapshot()), vec!["p3", "p4", "p2", "p1"]);
    assert_eq!(target.patch_state(1), Some(PatchState::Confirmed));
}

#[tokio::test(start_paused = true)]
async fn test_upsert_under_another_id_is_refused() {
    let coordinator = OptimisticMutationCoordinator::new(&SyncConfig::default(), Arc::new(NoopDiagnostics));
    let target = Arc::new(LocalCollection::new(vec![post("p1", "a", 10)]));
    let seen: Recorder<Vec<Post>> = Recorder::new();
    let _sub = target.subscribe(seen.listener());

    let result = coordinator
        .mutate(&target, PostId::new("p1"), Patch::Upsert(post("p9", "a", 90)), async {
            Err::<(), _>(rejected("offline"))
        })
        .await;

    assert!(matches!(
        result,
        Err(SyncError::Mutation(MutationError::IdMismatch { .. }))
    ));
    assert_eq!(local_ids(&target.snapshot()), vec!["p1"]);
    assert!(seen.is_empty());
    assert_eq!(target.patch_state(1), None);
}

// ============================================================================
// WATCHDOG
// ============================================================================

/// A patch target whose overlays are either all echoed or all stuck.
struct EchoTarget {
    inner: LocalCollection<Post>,
    echoed: bool,
    refreshes: AtomicUsize,
}

impl EchoTarget {
    fn new(echoed: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: LocalCollection::new(vec![post("p1", "a", 10)]),
            echoed,
            refreshes: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl PatchTarget<Post> for EchoTarget {
    fn current(&self, id: &PostId) -> Option<Post> {
        self.inner.current(id)
    }

    fn apply(&self, patch: &OptimisticPatch<Post>) {
        self.inner.apply(patch);
    }

    fn confirm(&self, patch_id: PatchId) {
        self.inner.confirm(patch_id);
    }

    fn rollback(&self, patch: &OptimisticPatch<Post>) {
        self.inner.rollback(patch);
    }

    fn is_pending(&self, _patch_id: PatchId) -> bool {
        !self.echoed
    }

    fn expire(&self, _patch_id: PatchId) -> bool {
        !self.echoed
    }

    async fn refresh(&self) -> StoreResult<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn confirm_likes(target: &Arc<EchoTarget>, diagnostics: &RecordingDiagnostics, count: usize) {
    let coordinator = OptimisticMutationCoordinator::new(&test_config(), diagnostics.shared());
    for _ in 0..count {
        coordinator
            .mutate(target, PostId::new("p1"), Patch::update(like), async {
                Ok::<(), WriteError>(())
            })
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_secs(6)).await;
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_skips_refresh_for_echoed_patches() {
    let diagnostics = RecordingDiagnostics::new();
    let target = EchoTarget::new(true);

    confirm_likes(&target, &diagnostics, 5).await;

    assert_eq!(target.refreshes.load(Ordering::SeqCst), 0);
    assert_eq!(
        diagnostics.count(|d| matches!(d, Diagnostic::PatchExpired { .. })),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_refreshes_once_per_stuck_patch() {
    let diagnostics = RecordingDiagnostics::new();
    let target = EchoTarget::new(false);

    confirm_likes(&target, &diagnostics, 2).await;

    assert_eq!(target.refreshes.load(Ordering::SeqCst), 2);
    assert_eq!(
        diagnostics.count(|d| matches!(d, Diagnostic::PatchExpired { .. })),
        2
    );
}
