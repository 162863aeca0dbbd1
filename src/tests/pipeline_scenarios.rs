// src/tests/pipeline_scenarios.rs
// End-to-end behaviour of the moderation pipeline against a scripted classifier

use super::test_utils::{feed, id, pipeline, post, skeleton, Script, ScriptedClassifier};
use crate::content_tree::FeedNode;
use crate::decision::Policy;
use crate::mutator::{ItemState, ViewportEvent, PLACEHOLDER_CLASS};
use crate::persistence::{KeyValueStore, MemoryStore, PersistenceBridge, KEY_REMOVED_URLS, KEY_TOTAL_COUNT};
use crate::pipeline::HostEvent;
use crate::settings_web::build_settings_router;
use crate::watcher::PROCESSED_ATTR;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower::ServiceExt;

const A: &str = "https://cdn.example/a.jpg";
const B: &str = "https://cdn.example/b.jpg";
const X: &str = "https://cdn.example/x.jpg";

#[tokio::test]
async fn second_pass_over_same_item_is_idempotent() {
    let classifier = ScriptedClassifier::new().script(A, Script::Scores(0.9, 0.9));
    let store = MemoryStore::new();
    let (tree, nodes) = feed(vec![post(A, "first")]);
    let mut pipeline = pipeline(tree, classifier.clone(), &store);

    pipeline.start().await.unwrap();
    pipeline.drain().await.unwrap();
    assert_eq!(pipeline.state_of(nodes[0]), ItemState::Concealed);
    let concealed = pipeline.tree().inner_html(nodes[0]);

    let report = pipeline.ingest(&nodes).unwrap();
    assert_eq!(report.cache_hits, 1);
    assert_eq!(report.requests, 0);
    pipeline.drain().await.unwrap();

    assert_eq!(classifier.calls(), 1);
    assert_eq!(pipeline.tree().inner_html(nodes[0]), concealed);
    assert_eq!(pipeline.stats().concealed, 1);
    assert_eq!(pipeline.record().total_concealed_count(), 1);
    assert_eq!(store.get(KEY_TOTAL_COUNT).await.unwrap(), Some(1u64.into()));
}

#[tokio::test]
async fn score_equal_to_threshold_conceals() {
    let classifier = ScriptedClassifier::new().script(A, Script::Scores(0.3, 0.1));
    let store = MemoryStore::new();
    let (tree, nodes) = feed(vec![post(A, "boundary")]);
    let mut pipeline = pipeline(tree, classifier, &store);
    pipeline.set_policy(Policy::new(0.3, 0.2)).await.unwrap();

    pipeline.start().await.unwrap();
    pipeline.drain().await.unwrap();

    assert_eq!(pipeline.policy(), Policy::new(0.3, 0.2));
    assert_eq!(pipeline.state_of(nodes[0]), ItemState::Concealed);
    assert!(pipeline.tree().inner_html(nodes[0]).contains(PLACEHOLDER_CLASS));
    assert_eq!(pipeline.tree().attr(nodes[0], PROCESSED_ATTR), Some("true"));
}

#[tokio::test]
async fn transport_failure_fails_open_and_is_not_retried() {
    let classifier = ScriptedClassifier::new().script(X, Script::Fail);
    let store = MemoryStore::new();
    let (tree, nodes) = feed(vec![post(X, "flaky")]);
    let mut pipeline = pipeline(tree, classifier.clone(), &store);
    pipeline.set_policy(Policy::new(0.0, 0.0)).await.unwrap();
    let before = pipeline.tree().inner_html(nodes[0]);

    pipeline.start().await.unwrap();
    pipeline.drain().await.unwrap();

    let cached = pipeline.cache().get(&id(X)).unwrap();
    assert!(cached.is_fallback());
    assert_eq!((cached.ai_score, cached.misinfo_score), (0.5, 0.5));
    assert_eq!(pipeline.state_of(nodes[0]), ItemState::Safe);
    assert_eq!(pipeline.tree().inner_html(nodes[0]), before);
    assert_eq!(pipeline.stats().fallbacks, 1);

    let root = pipeline.tree().root();
    let again = pipeline.tree_mut().append_snapshot(root, &post(X, "flaky again")).unwrap();
    let report = pipeline.ingest(&[again]).unwrap();
    pipeline.drain().await.unwrap();

    assert_eq!(report.cache_hits, 1);
    assert_eq!(classifier.calls_for(X), 1);
    assert_eq!(pipeline.state_of(again), ItemState::Safe);
    assert_eq!(pipeline.in_flight(), 0);
}

#[tokio::test]
async fn raising_thresholds_reveals_without_new_calls() {
    let classifier = ScriptedClassifier::new().script(A, Script::Scores(0.5, 0.1));
    let store = MemoryStore::new();
    let (tree, nodes) = feed(vec![post(A, "borderline")]);
    let original = tree.inner_html(nodes[0]);
    let mut pipeline = pipeline(tree, classifier.clone(), &store);
    pipeline.set_policy(Policy::new(0.3, 0.2)).await.unwrap();

    pipeline.start().await.unwrap();
    pipeline.drain().await.unwrap();
    assert_eq!(pipeline.state_of(nodes[0]), ItemState::Concealed);

    pipeline.set_policy(Policy::new(0.9, 0.9)).await.unwrap();

    assert_eq!(pipeline.state_of(nodes[0]), ItemState::Safe);
    assert_eq!(pipeline.tree().inner_html(nodes[0]), original);
    assert_eq!(classifier.calls(), 1);
    // The record only grows until cleared.
    assert!(pipeline.record().contains(&id(A)));
}

#[tokio::test]
async fn duplicate_identity_shares_one_call() {
    let classifier = ScriptedClassifier::new().script(A, Script::Scores(0.95, 0.0));
    let store = MemoryStore::new();
    let (tree, nodes) = feed(vec![post(A, "original"), post(B, "other"), post(A, "repost")]);
    let mut pipeline = pipeline(tree, classifier.clone(), &store);

    let report = pipeline.start().await.unwrap();
    assert_eq!(report.discovered, 3);
    assert_eq!(report.requests, 2);
    assert_eq!(report.coalesced, 1);
    pipeline.drain().await.unwrap();

    assert_eq!(classifier.calls_for(A), 1);
    assert_eq!(pipeline.locations(&id(A)), &[nodes[0], nodes[2]]);
    assert_eq!(pipeline.state_of(nodes[0]), ItemState::Concealed);
    assert_eq!(pipeline.state_of(nodes[2]), ItemState::Concealed);
    assert_eq!(pipeline.state_of(nodes[1]), ItemState::Safe);
    assert_eq!(pipeline.record().total_concealed_count(), 1);
}

#[tokio::test]
async fn identity_in_flight_across_passes_is_not_requested_twice() {
    let classifier = ScriptedClassifier::new().script(A, Script::Scores(0.9, 0.9));
    let store = MemoryStore::new();
    let (tree, nodes) = feed(vec![post(A, "first")]);
    let mut pipeline = pipeline(tree, classifier.clone(), &store);
    pipeline.start().await.unwrap();
    assert_eq!(pipeline.in_flight(), 1);

    let root = pipeline.tree().root();
    let late = pipeline.tree_mut().append_snapshot(root, &post(A, "again")).unwrap();
    let report = pipeline.ingest(&[late]).unwrap();
    assert_eq!(report.coalesced, 1);

    pipeline.drain().await.unwrap();
    assert_eq!(classifier.calls(), 1);
    assert_eq!(pipeline.state_of(nodes[0]), ItemState::Concealed);
    assert_eq!(pipeline.state_of(late), ItemState::Concealed);
    assert_eq!(pipeline.in_flight(), 0);
}

#[tokio::test]
async fn recorded_identity_is_concealed_provisionally_then_reconciled() {
    let classifier = ScriptedClassifier::new()
        .script(A, Script::Scores(0.0, 0.0))
        .script(B, Script::Scores(0.9, 0.0));
    let store = MemoryStore::new();
    store.set(KEY_REMOVED_URLS, serde_json::json!([A, B])).await.unwrap();
    store.set(KEY_TOTAL_COUNT, 2u64.into()).await.unwrap();

    let (tree, nodes) = feed(vec![post(A, "was hidden"), post(B, "still risky")]);
    let original = tree.inner_html(nodes[0]);
    let mut pipeline = pipeline(tree, classifier.clone(), &store);

    let report = pipeline.start().await.unwrap();
    assert_eq!(report.provisional, 2);
    assert_eq!(report.requests, 2);
    assert_eq!(pipeline.state_of(nodes[0]), ItemState::Concealed);

    pipeline.drain().await.unwrap();
    assert_eq!(pipeline.state_of(nodes[0]), ItemState::Safe);
    assert_eq!(pipeline.tree().inner_html(nodes[0]), original);
    assert_eq!(pipeline.state_of(nodes[1]), ItemState::Concealed);
    assert_eq!(pipeline.record().total_concealed_count(), 2);
    assert_eq!(store.get(KEY_TOTAL_COUNT).await.unwrap(), Some(2u64.into()));
}

#[tokio::test]
async fn significant_viewport_event_reconceals() {
    let classifier = ScriptedClassifier::new().script(A, Script::Scores(0.9, 0.9));
    let store = MemoryStore::new();
    let (tree, nodes) = feed(vec![post(A, "peek")]);
    let original = tree.inner_html(nodes[0]);
    let mut pipeline = pipeline(tree, classifier, &store);
    pipeline.start().await.unwrap();
    pipeline.drain().await.unwrap();

    assert!(pipeline.reveal(nodes[0]).unwrap());
    assert_eq!(pipeline.tree().inner_html(nodes[0]), original);

    // A revealed item is not hidden again by a re-decision.
    pipeline.apply_policy(Policy::new(0.8, 0.8)).unwrap();
    assert_eq!(pipeline.state_of(nodes[0]), ItemState::TemporarilyRevealed);

    assert_eq!(pipeline.on_viewport(ViewportEvent::Scroll { delta_px: 599 }).unwrap(), 0);
    assert_eq!(pipeline.on_viewport(ViewportEvent::Scroll { delta_px: 600 }).unwrap(), 1);
    assert_eq!(pipeline.state_of(nodes[0]), ItemState::Concealed);
    assert!(pipeline.tree().inner_html(nodes[0]).contains(PLACEHOLDER_CLASS));
}

#[tokio::test(start_paused = true)]
async fn run_loop_processes_appended_posts_and_late_images() {
    let classifier = ScriptedClassifier::new()
        .script(A, Script::Scores(0.9, 0.0))
        .script(B, Script::Scores(0.1, 0.1));
    let store = MemoryStore::new();
    let (tree, nodes) = feed(vec![skeleton()]);
    let media = tree.children(nodes[0])[0];
    let mut pipeline = pipeline(tree, classifier.clone(), &store);

    let report = pipeline.start().await.unwrap();
    assert_eq!(report.misses, 1);
    assert_eq!(pipeline.tree().attr(nodes[0], PROCESSED_ATTR), None);

    let (tx, rx) = mpsc::unbounded_channel();
    tx.send(HostEvent::Append(post(B, "fresh"))).unwrap();
    tx.send(HostEvent::AppendTo {
        parent: media,
        node: FeedNode::new("img").attr("src", A),
    })
    .unwrap();
    drop(tx);
    pipeline.run(rx).await.unwrap();

    assert_eq!(classifier.calls(), 2);
    assert_eq!(pipeline.state_of(nodes[0]), ItemState::Concealed);
    assert_eq!(pipeline.locations(&id(B)).len(), 1);
    assert_eq!(pipeline.outstanding(), 0);
    assert_eq!(store.get(KEY_REMOVED_URLS).await.unwrap(), Some(serde_json::json!([A])));
}

#[tokio::test(start_paused = true)]
async fn threshold_change_pushed_through_store_redecides_running_pipeline() {
    let classifier = ScriptedClassifier::new().script(A, Script::Scores(0.6, 0.1));
    let store = MemoryStore::new();
    let (tree, nodes) = feed(vec![post(A, "pushed")]);
    let mut pipeline = pipeline(tree, classifier.clone(), &store);
    pipeline.set_policy(Policy::new(0.5, 0.5)).await.unwrap();
    pipeline.start().await.unwrap();
    pipeline.drain().await.unwrap();
    assert_eq!(pipeline.state_of(nodes[0]), ItemState::Concealed);

    let settings = PersistenceBridge::new(Arc::new(store.clone()), Policy::default());
    let (tx, rx) = mpsc::unbounded_channel();
    let popup = async move {
        settings.save_policy(&Policy::new(0.9, 0.9)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(tx);
    };
    let (result, ()) = tokio::join!(pipeline.run(rx), popup);
    result.unwrap();

    assert_eq!(pipeline.policy(), Policy::new(0.9, 0.9));
    assert_eq!(pipeline.state_of(nodes[0]), ItemState::Safe);
    assert_eq!(classifier.calls(), 1);
}

#[tokio::test]
async fn clearing_the_store_resets_the_running_record() {
    let classifier = ScriptedClassifier::new().script(A, Script::Scores(0.9, 0.9));
    let store = MemoryStore::new();
    let (tree, _nodes) = feed(vec![post(A, "cleared")]);
    let mut pipeline = pipeline(tree, classifier, &store);
    pipeline.start().await.unwrap();
    pipeline.drain().await.unwrap();
    assert_eq!(pipeline.record().len(), 1);

    let settings = PersistenceBridge::new(Arc::new(store.clone()), Policy::default());
    let mut changes = settings.subscribe();
    settings.clear_record().await.unwrap();
    while let Ok(change) = changes.try_recv() {
        pipeline.on_store_change(change).await.unwrap();
    }

    assert!(pipeline.record().is_empty());
    pipeline.flush().await.unwrap();
    assert_eq!(store.get(KEY_TOTAL_COUNT).await.unwrap(), Some(0u64.into()));
}

#[tokio::test(start_paused = true)]
async fn settings_api_post_redecides_running_pipeline() {
    let classifier = ScriptedClassifier::new().script(A, Script::Scores(0.6, 0.1));
    let store = MemoryStore::new();
    let (tree, nodes) = feed(vec![post(A, "over http")]);
    let mut pipeline = pipeline(tree, classifier.clone(), &store);
    pipeline.set_policy(Policy::new(0.5, 0.5)).await.unwrap();
    pipeline.start().await.unwrap();
    pipeline.drain().await.unwrap();
    assert_eq!(pipeline.state_of(nodes[0]), ItemState::Concealed);

    let app = build_settings_router(Arc::new(pipeline.bridge().clone()));
    let (tx, rx) = mpsc::unbounded_channel();
    let popup = async move {
        let request = Request::builder()
            .uri("/api/settings")
            .method("POST")
            .header("Content-Type", "application/json")
            .body(Body::from(
                serde_json::json!({ "aiGeneratedThreshold": 0.9, "newsThreshold": 0.9 }).to_string(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(tx);
    };
    let (result, ()) = tokio::join!(pipeline.run(rx), popup);
    result.unwrap();

    assert_eq!(pipeline.policy(), Policy::new(0.9, 0.9));
    assert_eq!(pipeline.state_of(nodes[0]), ItemState::Safe);
    assert_eq!(classifier.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn appends_inside_debounce_window_share_one_pass() {
    let classifier = ScriptedClassifier::new();
    let store = MemoryStore::new();
    let (tree, _nodes) = feed(vec![]);
    let mut pipeline = pipeline(tree, classifier.clone(), &store);
    pipeline.start().await.unwrap();
    assert_eq!(pipeline.stats().passes, 1);

    let (tx, rx) = mpsc::unbounded_channel();
    let host = async move {
        for src in [A, B, X] {
            tx.send(HostEvent::Append(post(src, "burst"))).unwrap();
            tokio::time::sleep(Duration::from_millis(150)).await;
        }
        // Quiet for longer than the window, then one more.
        tokio::time::sleep(Duration::from_millis(500)).await;
        tx.send(HostEvent::Append(post("https://cdn.example/late.jpg", "late")))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        drop(tx);
    };
    let (result, ()) = tokio::join!(pipeline.run(rx), host);
    result.unwrap();

    assert_eq!(pipeline.stats().passes, 3);
    assert_eq!(classifier.calls(), 4);
}

#[tokio::test]
async fn detached_locations_are_pruned_on_redecision() {
    let classifier = ScriptedClassifier::new().script(A, Script::Scores(0.9, 0.0));
    let store = MemoryStore::new();
    let (tree, nodes) = feed(vec![post(A, "gone"), post(A, "kept")]);
    let mut pipeline = pipeline(tree, classifier, &store);
    pipeline.start().await.unwrap();
    pipeline.drain().await.unwrap();
    assert_eq!(pipeline.locations(&id(A)), &[nodes[0], nodes[1]]);

    let root = pipeline.tree().root();
    pipeline.tree_mut().replace_children(root, vec![nodes[1]]).unwrap();
    pipeline.apply_policy(Policy::new(0.95, 0.95)).unwrap();

    assert_eq!(pipeline.locations(&id(A)), &[nodes[1]]);
    assert_eq!(pipeline.state_of(nodes[1]), ItemState::Safe);
    assert_eq!(pipeline.state_of(nodes[0]), ItemState::Concealed);
}
