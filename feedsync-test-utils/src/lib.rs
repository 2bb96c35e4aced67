//! FEEDSYNC Test Utilities
//!
//! Centralized test infrastructure for the FEEDSYNC workspace:
//! - Proptest generators for ids, profiles and feed records
//! - Test fixtures for common scenarios
//! - Recording diagnostics and listener recorders
//! - Custom assertions for FEEDSYNC-specific validation

// Re-export the in-memory store from its source crate
pub use feedsync_store::{InMemoryBackingStore, InMemoryCollection, InMemoryEntities};

// Re-export core types for convenience
pub use feedsync_core::{
    Diagnostic, DiagnosticSink, FetchOrigin, MessageId, MutationError, Participant,
    ParticipantId, Post, PostId, ProfileSummary, QueryFilter, Reply, ReplyId, SharedDiagnostics,
    SortDirection, StoreError, SyncConfig, SyncError, SyncResult, Timestamp, TournamentId,
    TournamentMessage, UserId, WriteError,
};

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Let spawned tasks and actor commands drain.
///
/// Under a paused tokio clock this advances time by one millisecond, which
/// is enough for every ready task to run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

// ============================================================================
// RECORDING DIAGNOSTICS
// ============================================================================

/// Diagnostic sink that keeps every event for later inspection.
#[derive(Debug, Clone, Default)]
pub struct RecordingDiagnostics {
    events: Arc<Mutex<Vec<Diagnostic>>>,
}

impl RecordingDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// This recorder as a shared sink. Events stay visible through `self`.
    pub fn shared(&self) -> SharedDiagnostics {
        Arc::new(self.clone())
    }

    pub fn events(&self) -> Vec<Diagnostic> {
        lock(&self.events).clone()
    }

    /// Number of recorded events matching `predicate`.
    pub fn count<F>(&self, predicate: F) -> usize
    where
        F: Fn(&Diagnostic) -> bool,
    {
        lock(&self.events).iter().filter(|d| predicate(d)).count()
    }

    pub fn fetch_failures(&self, origin: FetchOrigin) -> usize {
        self.count(|d| matches!(d, Diagnostic::FetchFailed { origin: o, .. } if *o == origin))
    }

    pub fn late_results(&self) -> usize {
        self.count(|d| matches!(d, Diagnostic::LateResultDropped { .. }))
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

impl DiagnosticSink for RecordingDiagnostics {
    fn emit(&self, diagnostic: Diagnostic) {
        lock(&self.events).push(diagnostic);
    }
}

// ============================================================================
// LISTENER RECORDER
// ============================================================================

/// Collects every value handed to a listener.
#[derive(Debug)]
pub struct Recorder<T> {
    seen: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            seen: Arc::clone(&self.seen),
        }
    }
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone + Send + 'static> Recorder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A listener closure that appends to this recorder.
    pub fn listener(&self) -> impl Fn(T) + Send + Sync + 'static {
        let seen = Arc::clone(&self.seen);
        move |value| lock(&seen).push(value)
    }

    pub fn len(&self) -> usize {
        lock(&self.seen).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.seen).is_empty()
    }

    pub fn all(&self) -> Vec<T> {
        lock(&self.seen).clone()
    }

    pub fn last(&self) -> Option<T> {
        lock(&self.seen).last().cloned()
    }

    /// Drain everything recorded so far.
    pub fn take(&self) -> Vec<T> {
        std::mem::take(&mut *lock(&self.seen))
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating FEEDSYNC record types.

    use super::*;
    use proptest::prelude::*;

    /// Generate a user id from a small alphabet so keys collide often.
    pub fn arb_user_id() -> impl Strategy<Value = UserId> {
        "u[a-h]".prop_map(UserId::new)
    }

    /// Generate a list of user ids, duplicates included.
    pub fn arb_user_ids(max: usize) -> impl Strategy<Value = Vec<UserId>> {
        prop::collection::vec(arb_user_id(), 0..=max)
    }

    pub fn arb_post_id() -> impl Strategy<Value = PostId> {
        "p[0-9]{1,3}".prop_map(PostId::new)
    }

    /// Generate a Timestamp (DateTime<Utc>).
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        // 2020-2030
        (1577836800i64..1893456000i64)
            .prop_map(|secs| chrono::DateTime::from_timestamp(secs, 0).unwrap_or_default())
    }

    pub fn arb_profile_summary() -> impl Strategy<Value = ProfileSummary> {
        (
            "[A-Z][a-z]{2,8}",
            prop::option::of("https://cdn\\.example/[a-z]{4}\\.png"),
        )
            .prop_map(|(display_name, avatar_url)| ProfileSummary {
                display_name,
                avatar_url,
            })
    }

    pub fn arb_post() -> impl Strategy<Value = Post> {
        (
            arb_post_id(),
            arb_user_id(),
            "[a-z ]{0,24}",
            0u32..500,
            0u32..50,
            arb_timestamp(),
        )
            .prop_map(
                |(id, author_id, body, like_count, reply_count, created_at)| Post {
                    id,
                    author_id,
                    body,
                    like_count,
                    reply_count,
                    tournament_id: None,
                    created_at,
                },
            )
    }

    /// Generate posts with distinct ids.
    pub fn arb_posts(max: usize) -> impl Strategy<Value = Vec<Post>> {
        prop::collection::vec(arb_post(), 0..=max).prop_map(|posts| {
            let mut seen = std::collections::HashSet::new();
            posts
                .into_iter()
                .filter(|p| seen.insert(p.id.clone()))
                .collect()
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Builders for records used across tests.

    use super::*;

    fn at(secs: i64) -> Timestamp {
        chrono::DateTime::from_timestamp(secs, 0).unwrap_or_default()
    }

    pub fn profile(name: &str) -> ProfileSummary {
        ProfileSummary::new(name)
    }

    /// A post by `author` created `secs` after the epoch.
    pub fn post(id: &str, author: &str, secs: i64) -> Post {
        Post {
            id: PostId::new(id),
            author_id: UserId::new(author),
            body: format!("post {}", id),
            like_count: 0,
            reply_count: 0,
            tournament_id: None,
            created_at: at(secs),
        }
    }

    pub fn tournament_post(id: &str, author: &str, tournament: &str, secs: i64) -> Post {
        Post {
            tournament_id: Some(TournamentId::new(tournament)),
            ..post(id, author, secs)
        }
    }

    pub fn reply(id: &str, post_id: &str, author: &str, secs: i64) -> Reply {
        Reply {
            id: ReplyId::new(id),
            post_id: PostId::new(post_id),
            author_id: UserId::new(author),
            body: format!("reply {}", id),
            created_at: at(secs),
        }
    }

    pub fn message(id: &str, tournament: &str, sender: &str, secs: i64) -> TournamentMessage {
        TournamentMessage {
            id: MessageId::new(id),
            tournament_id: TournamentId::new(tournament),
            sender_id: UserId::new(sender),
            text: format!("message {}", id),
            sent_at: at(secs),
        }
    }

    pub fn participant(id: &str, tournament: &str, user: &str, score: i64) -> Participant {
        Participant {
            id: ParticipantId::new(id),
            tournament_id: TournamentId::new(tournament),
            user_id: UserId::new(user),
            score,
            joined_at: at(0),
        }
    }

    /// Posts newest first, the order every feed filter below uses.
    pub fn posts_by(authors: &[&str]) -> QueryFilter {
        QueryFilter::collection("posts")
            .where_in("authorId", authors.iter().copied())
            .order_by("createdAt", SortDirection::Descending)
    }

    pub fn all_posts() -> QueryFilter {
        QueryFilter::collection("posts").order_by("createdAt", SortDirection::Descending)
    }

    /// Short timeouts suitable for paused-clock tests.
    pub fn test_config() -> SyncConfig {
        SyncConfig::new()
            .with_idle_ttl(Duration::from_millis(500))
            .with_batch_limit(10)
            .with_write_timeout(Duration::from_secs(2))
            .with_patch_watchdog(Duration::from_secs(5))
    }

    pub fn rejected(reason: &str) -> WriteError {
        WriteError::Rejected {
            reason: reason.to_string(),
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertion helpers for FEEDSYNC error shapes.

    use super::*;

    /// Assert that a mutation failed because its remote write failed.
    #[track_caller]
    pub fn assert_write_failed<T: std::fmt::Debug>(result: &SyncResult<T>) -> WriteError {
        match result {
            Err(SyncError::Mutation(MutationError::Write(err))) => err.clone(),
            other => panic!("Expected rolled-back write, got: {:?}", other),
        }
    }

    /// Assert that a mutation failed with a write timeout.
    #[track_caller]
    pub fn assert_timed_out<T: std::fmt::Debug>(result: &SyncResult<T>) {
        match assert_write_failed(result) {
            WriteError::TimedOut { .. } => {}
            other => panic!("Expected TimedOut, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_cache_closed<T: std::fmt::Debug>(result: &SyncResult<T>) {
        match result {
            Err(SyncError::CacheClosed) => {}
            other => panic!("Expected CacheClosed, got: {:?}", other),
        }
    }
}
