//! End-to-end engine scenarios over in-memory stores.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::*;
use serde_json::json;
use zarrmap::error::EngineError;
use zarrmap::gpu::RenderContext;
use zarrmap::pyramid::StoreVersion;
use zarrmap::selector::{Selector, SelectorValue};
use zarrmap::view::resolver::Viewport;
use zarrmap::view::TileKey;
use zarrmap::{Engine, EngineCallbacks, EngineOptions};

#[tokio::test]
async fn initial_camera_draws_the_root_tile() {
    let fetch = flat_fixture();
    let (engine, _render) = engine_over(&fetch, "tavg", |_| {}).await;

    engine.update_camera(0.0, 0.0, 0.0).await.unwrap();

    let active = engine.active();
    assert_eq!(active.len(), 1);
    let offsets = &active[&TileKey::new(0, 0, 0)];
    assert_eq!(offsets.len(), 1);
    assert_eq!((offsets[0].x, offsets[0].y, offsets[0].level), (0, 0, 0));

    // Exactly one chunk request hit level 0.
    assert_eq!(fetch.fetch_count("0/tavg/0.0"), 1);

    // Every pyramid level has a registered loader; levels past the
    // pyramid do not.
    assert!(engine.chunk_loader(0).is_ok());
    assert!(engine.chunk_loader(2).is_ok());
    assert!(engine.chunk_loader(7).is_err());

    let pass = CapturePass::default();
    engine.draw(&pass).unwrap();
    let calls = pass.calls.lock().unwrap();
    assert_eq!(
        calls.as_slice(),
        &[DrawCall {
            key: TileKey::new(0, 0, 0),
            level: 0,
            offset: [0, 0],
            bands: vec!["tavg".to_string()],
        }]
    );
}

#[tokio::test]
async fn antimeridian_viewport_wraps_horizontally() {
    let fetch = flat_fixture();
    let (engine, _render) = engine_over(&fetch, "tavg", |opts| {
        opts.viewport = Viewport {
            width: 1024.0,
            height: 512.0,
        };
    })
    .await;

    engine.update_camera(-179.9, 0.0, 2.0).await.unwrap();

    let active = engine.active();
    let mut xs: Vec<u32> = active.keys().map(|k| k.x).collect();
    xs.sort_unstable();
    xs.dedup();
    assert_eq!(xs, vec![0, 1, 3]);
    for key in active.keys() {
        assert!(key.x < 4 && key.y < 4);
    }

    // The westernmost copy renders from an unwrapped position.
    let seam = &active[&TileKey::new(3, 2, 2)];
    assert!(seam.iter().any(|o| o.x == -1));
}

#[tokio::test]
async fn camera_updates_are_idempotent() {
    let fetch = flat_fixture();
    let (engine, render) = engine_over(&fetch, "tavg", |_| {}).await;

    engine.update_camera(0.0, 0.0, 1.0).await.unwrap();
    let active_first = engine.active();
    let fetches_first = fetch.total_fetches();
    let writes_first: usize = render
        .planes
        .lock()
        .unwrap()
        .iter()
        .map(|p| p.writes.load(std::sync::atomic::Ordering::SeqCst))
        .sum();

    engine.update_camera(0.0, 0.0, 1.0).await.unwrap();
    assert_eq!(engine.active(), active_first);
    assert_eq!(fetch.total_fetches(), fetches_first);
    let writes_second: usize = render
        .planes
        .lock()
        .unwrap()
        .iter()
        .map(|p| p.writes.load(std::sync::atomic::Ordering::SeqCst))
        .sum();
    assert_eq!(writes_second, writes_first);
}

#[tokio::test]
async fn list_selector_builds_band_per_value() {
    let fetch = timed_fixture();
    let (engine, render) = engine_over(&fetch, "temp", |opts| {
        let mut selector = Selector::new();
        selector.insert("time".into(), SelectorValue::list([2020i64, 2021]));
        opts.selector = selector;
    })
    .await;

    engine.update_camera(0.0, 0.0, 0.0).await.unwrap();

    let labels = render.plane_labels();
    assert!(labels.iter().any(|l| l.contains("time_2020")));
    assert!(labels.iter().any(|l| l.contains("time_2021")));
    // Both time chunks were pulled for the root tile, recorded as ledger
    // misses (nothing was staged yet).
    assert_eq!(fetch.fetch_count("0/temp/0.0.0"), 1);
    assert_eq!(fetch.fetch_count("0/temp/1.0.0"), 1);
    assert!(engine.cache_stats().misses >= 2);
    assert_eq!(engine.cache_stats().hits, 0);

    // Each draw call consumes both band planes, in band order.
    let pass = CapturePass::default();
    engine.draw(&pass).unwrap();
    {
        let calls = pass.calls.lock().unwrap();
        assert!(!calls.is_empty());
        assert_eq!(
            calls[0].bands,
            vec!["time_2020".to_string(), "time_2021".to_string()]
        );
    }

    // Switching to a scalar year re-populates under the variable band and
    // leaves the old band planes allocated but orphaned.
    let mut scalar = Selector::new();
    scalar.insert("time".into(), SelectorValue::scalar(2021i64));
    engine.update_selector(scalar);
    engine.update_camera(0.0, 0.0, 0.0).await.unwrap();

    let labels = render.plane_labels();
    assert!(labels.iter().any(|l| l.contains("band-temp-")));
    assert!(labels.iter().any(|l| l.contains("time_2020")));
    // The scalar populate re-used the staged chunk: no second fetch, and
    // the ledger saw the lookup as a hit.
    assert_eq!(fetch.fetch_count("0/temp/1.0.0"), 1);
    assert!(engine.cache_stats().hits >= 1);
}

#[tokio::test]
async fn selector_change_mid_flight_discards_stale_population() {
    let fetch = timed_fixture();
    fetch.set_delay(Some(std::time::Duration::from_millis(20)));
    let (engine, _render) = engine_over(&fetch, "temp", |opts| {
        let mut selector = Selector::new();
        selector.insert("time".into(), SelectorValue::scalar(2020i64));
        opts.selector = selector;
    })
    .await;

    let mut new_selector = Selector::new();
    new_selector.insert("time".into(), SelectorValue::scalar(2021i64));

    let camera = engine.update_camera(0.0, 0.0, 0.0);
    let switch = async {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        engine.update_selector(new_selector.clone());
    };
    let (camera_result, ()) = futures::join!(camera, switch);
    camera_result.unwrap();

    // The 2020 population landed after the switch and was discarded; the
    // buffers hold neither selector's data yet.
    let root = TileKey::new(0, 0, 0);
    let props = engine.get_props();
    let root_prop = props.iter().find(|p| p.key == root);
    assert!(root_prop.is_some(), "unpopulated target still renders itself");

    // The next camera tick populates for the new selector without refetch
    // of the stale chunk.
    engine.update_camera(0.0, 0.0, 0.0).await.unwrap();
    assert_eq!(fetch.fetch_count("0/temp/1.0.0"), 1);
}

#[tokio::test]
async fn transport_faults_leave_tiles_retryable() {
    let fetch = flat_fixture();
    let (engine, _render) = engine_over(&fetch, "tavg", |_| {}).await;

    // Populate level 0, then fail level 1 fetches.
    engine.update_camera(0.0, 0.0, 0.0).await.unwrap();
    fetch.fail_prefix("1/tavg/");

    engine.update_camera(0.0, 0.0, 1.0).await.unwrap();

    // Every active z=1 tile substitutes the populated root.
    let pass = CapturePass::default();
    engine.draw(&pass).unwrap();
    {
        let calls = pass.calls.lock().unwrap();
        assert!(!calls.is_empty());
        assert!(calls.iter().all(|c| c.level == 0 && c.key.z == 0));
    }

    // Healing the store lets the same camera retry and succeed.
    fetch.heal_prefix("1/tavg/");
    engine.update_camera(0.0, 0.0, 1.0).await.unwrap();
    let pass = CapturePass::default();
    engine.draw(&pass).unwrap();
    let calls = pass.calls.lock().unwrap();
    assert!(calls.iter().all(|c| c.level == 1));
}

#[tokio::test]
async fn missing_multiscales_rejects_construction() {
    let mut objects = HashMap::new();
    objects.insert(
        ".zmetadata".to_string(),
        serde_json::to_vec(&json!({ "metadata": { ".zattrs": {} } })).unwrap(),
    );
    let fetch = MemoryFetch::new(objects);
    let render = CpuRenderContext::new();

    let result = Engine::new(
        EngineOptions {
            variable: "tavg".to_string(),
            ..Default::default()
        },
        store_for(&fetch, StoreVersion::V2),
        render as Arc<dyn RenderContext>,
        EngineCallbacks::default(),
    )
    .await;

    assert!(matches!(result, Err(EngineError::MetadataInvalid(_))));
}

#[tokio::test]
async fn unknown_mode_rejects_construction() {
    let fetch = flat_fixture();
    let render = CpuRenderContext::new();
    let result = Engine::new(
        EngineOptions {
            variable: "tavg".to_string(),
            mode: "wireframe".to_string(),
            ..Default::default()
        },
        store_for(&fetch, StoreVersion::V2),
        render as Arc<dyn RenderContext>,
        EngineCallbacks::default(),
    )
    .await;
    assert!(matches!(result, Err(EngineError::ModeInvalid(_))));
}

#[tokio::test]
async fn hidden_display_forces_zero_opacity() {
    let fetch = flat_fixture();
    let (engine, _render) = engine_over(&fetch, "tavg", |opts| {
        opts.opacity = 0.8;
    })
    .await;
    engine.update_camera(0.0, 0.0, 0.0).await.unwrap();

    assert_eq!(engine.frame_uniforms().opacity, 0.8);
    engine.update_uniforms(false, 0.8, [0.0, 1.0], Default::default());
    assert_eq!(engine.frame_uniforms().opacity, 0.0);
}
