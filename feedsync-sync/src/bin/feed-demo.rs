//! FEEDSYNC demo entry point.
//!
//! Runs a profile-enriched post feed over the in-memory backing store:
//! renames an author, then likes a post once with a failing backend and
//! once with a healthy one. Set `RUST_LOG=feedsync_sync=debug` for the
//! internals.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use feedsync_core::{
    Post, PostId, ProfileSummary, QueryFilter, SortDirection, SyncConfig, SyncResult, UserId,
    WriteError,
};
use feedsync_store::{CollectionSource, InMemoryBackingStore, MutationSink};
use feedsync_sync::{Comparator, FeedSync, MergedView, Patch};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("feed_demo=info,feedsync_sync=info,warn"));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

fn seed(store: &InMemoryBackingStore) {
    let profiles = store.profiles();
    profiles.set(UserId::new("alice"), ProfileSummary::new("Alice"));
    profiles.set(
        UserId::new("bob"),
        ProfileSummary::new("Bob").with_avatar("https://cdn.example/bob.png"),
    );

    let posts = store.posts();
    for (id, author, secs, body) in [
        ("p1", "alice", 1_700_000_000, "first match tonight"),
        ("p2", "bob", 1_700_000_100, "who is in?"),
        ("p3", "carol", 1_700_000_200, "bracket is up"),
    ] {
        posts.upsert(Post {
            id: PostId::new(id),
            author_id: UserId::new(author),
            body: body.to_string(),
            like_count: 0,
            reply_count: 0,
            tournament_id: None,
            created_at: DateTime::from_timestamp(secs, 0).unwrap_or_default(),
        });
    }
}

fn log_view(view: MergedView<Post, ProfileSummary>) {
    info!(version = view.version, items = view.len(), "Feed updated");
    for entry in &view.items {
        let author = entry
            .enrichment
            .as_ref()
            .map(|p| p.display_name.as_str())
            .unwrap_or("<unknown>");
        info!(
            post = %entry.item.id,
            author,
            likes = entry.item.like_count,
            body = %entry.item.body,
        );
    }
}

fn like(post: &Post) -> Post {
    Post {
        like_count: post.like_count + 1,
        ..post.clone()
    }
}

#[tokio::main]
async fn main() -> SyncResult<()> {
    init_tracing();

    let config = SyncConfig::from_env();
    let store = InMemoryBackingStore::new(config.batch_limit);
    seed(&store);

    let sync = FeedSync::new(Arc::new(store.profiles().clone()), config)?;

    let posts: Arc<dyn CollectionSource<Post>> = Arc::new(store.posts().clone());
    let sink: Arc<dyn MutationSink<Post>> = Arc::new(store.posts().clone());
    let newest_first: Comparator<Post> = Arc::new(|a, b| b.created_at.cmp(&a.created_at));
    let filter = QueryFilter::collection("posts").order_by("createdAt", SortDirection::Descending);

    let feed = sync.merged_subscribe_ordered(
        posts,
        filter,
        newest_first,
        |post: &Post| post.author_id.clone(),
        log_view,
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    info!(phase = %feed.phase(), "Feed attached");

    store
        .profiles()
        .set(UserId::new("alice"), ProfileSummary::new("Alice Liddell"));
    tokio::time::sleep(Duration::from_millis(50)).await;

    store.posts().set_write_failure(Some(WriteError::Rejected {
        reason: "quota exceeded".to_string(),
    }));
    let rejected = sync
        .mutate_through(&feed, Arc::clone(&sink), "posts", PostId::new("p2"), Patch::update(like))
        .await;
    if let Err(error) = rejected {
        warn!(error = %error, "Like rolled back");
    }

    store.posts().set_write_failure(None);
    sync.mutate_through(&feed, sink, "posts", PostId::new("p2"), Patch::update(like))
        .await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = sync.stats().await?;
    info!(
        entries = stats.entries,
        live = stats.live_subscriptions,
        groups = stats.groups,
        at = %Utc::now(),
        "Shutting down"
    );
    feed.close();
    sync.shutdown();
    Ok(())
}
