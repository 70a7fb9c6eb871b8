use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_DISPOSITION, CONTENT_TYPE};
use mediacache::cache::{CacheKeyBuilder, TransformationResultCache};
use mediacache::config::{ConfigError, TransformationCacheConfig};
use mediacache::hooks::{Flow, HookChain, Stage};
use mediacache::model::{Image, RequestContext, ResponseModel, TransformationChain, TransformationStep};
use mediacache::{CacheError, CACHE_STATUS_HEADER};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn cache() -> (TempDir, TransformationResultCache) {
    let dir = TempDir::new().unwrap();
    let cache = TransformationResultCache::new(&TransformationCacheConfig { path: dir.path().to_path_buf() }).unwrap();
    (dir, cache)
}

fn chain(owner: &str, image_id: &str) -> TransformationChain {
    TransformationChain::new(owner, image_id)
        .with_step(TransformationStep::parse("maxSize:width=150").unwrap())
        .with_step(TransformationStep::parse("desaturate").unwrap())
        .with_extension("png")
        .with_accept("image/webp,image/*;q=0.8,*/*;q=0.5")
}

fn rendered(chain: TransformationChain) -> RequestContext {
    let mut ctx = RequestContext::new(chain)
        .with_model(ResponseModel::Image(Image::new(Bytes::from_static(b"\x89PNG rendered"), 150, 100, "image/png", "png")));
    ctx.response.headers.insert(CONTENT_TYPE, HeaderValue::from_static("image/png"));
    ctx.response.headers.insert("x-imbo-originalwidth", HeaderValue::from_static("1500"));
    ctx
}

fn status(ctx: &RequestContext) -> Option<&str> {
    ctx.response.headers.get(CACHE_STATUS_HEADER).and_then(|v| v.to_str().ok())
}

fn count_files(dir: &Path) -> usize {
    let mut n = 0;
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        n += if path.is_dir() { count_files(&path) } else { 1 };
    }
    n
}

#[tokio::test]
async fn miss_then_hit_round_trips_image_and_headers() {
    let (_dir, cache) = cache();

    let mut first = RequestContext::new(chain("user", "f3210f1bb34bfbfa432cc3560be40761"));
    assert_eq!(cache.load_from_cache(&mut first).await, Flow::Continue);
    assert_eq!(status(&first), Some("Miss"));
    assert!(!first.cache_hit);

    let stored = rendered(chain("user", "f3210f1bb34bfbfa432cc3560be40761"));
    assert!(cache.store_in_cache(&stored).await.unwrap());

    let mut second = RequestContext::new(chain("user", "f3210f1bb34bfbfa432cc3560be40761"));
    assert_eq!(cache.load_from_cache(&mut second).await, Flow::Stop);
    assert!(second.cache_hit);
    assert_eq!(status(&second), Some("Hit"));
    assert_eq!(second.response.model, stored.response.model);
    assert_eq!(second.response.headers.get(CONTENT_TYPE).unwrap(), "image/png");
    assert_eq!(second.response.headers.get("x-imbo-originalwidth").unwrap(), "1500");
}

#[tokio::test]
async fn equivalent_accept_headers_share_an_entry() {
    let (_dir, cache) = cache();
    cache.store_in_cache(&rendered(chain("user", "image1"))).await.unwrap();

    let reordered = chain("user", "image1").with_accept("*/*;q=0.5, text/html, image/*;q=0.8, image/webp");
    let mut ctx = RequestContext::new(reordered);
    assert_eq!(cache.load_from_cache(&mut ctx).await, Flow::Stop);

    let narrower = chain("user", "image1").with_accept("image/webp");
    let mut ctx = RequestContext::new(narrower);
    assert_eq!(cache.load_from_cache(&mut ctx).await, Flow::Continue);
}

#[tokio::test]
async fn different_chains_do_not_collide() {
    let (_dir, cache) = cache();
    cache.store_in_cache(&rendered(chain("user", "image1"))).await.unwrap();

    let other = TransformationChain::new("user", "image1")
        .with_step(TransformationStep::parse("maxSize:width=151").unwrap())
        .with_step(TransformationStep::parse("desaturate").unwrap())
        .with_extension("png")
        .with_accept("image/webp,image/*;q=0.8,*/*;q=0.5");
    let mut ctx = RequestContext::new(other);
    assert_eq!(cache.load_from_cache(&mut ctx).await, Flow::Continue);
}

#[tokio::test]
async fn cache_hits_are_not_written_back() {
    let (_dir, cache) = cache();
    let original = rendered(chain("user", "image1"));
    cache.store_in_cache(&original).await.unwrap();

    let mut ctx = RequestContext::new(chain("user", "image1"));
    cache.load_from_cache(&mut ctx).await;
    assert!(ctx.cache_hit);

    // A later hook altering the response must not overwrite the entry
    if let Some(image) = ctx.response.image_mut() {
        image.blob = Bytes::from_static(b"changed");
    }
    assert!(!cache.store_in_cache(&ctx).await.unwrap());

    let mut again = RequestContext::new(chain("user", "image1"));
    cache.load_from_cache(&mut again).await;
    assert_eq!(again.response.model, original.response.model);
}

#[tokio::test]
async fn non_image_responses_are_not_cached() {
    let (dir, cache) = cache();
    let ctx = RequestContext::new(chain("user", "image1")).with_model(ResponseModel::Metadata(serde_json::json!({ "key": "value" })));
    assert!(!cache.store_in_cache(&ctx).await.unwrap());

    let ctx = RequestContext::new(chain("user", "image1")).with_model(ResponseModel::Error { status: 404, message: "Image not found".into() });
    assert!(!cache.store_in_cache(&ctx).await.unwrap());
    assert_eq!(count_files(dir.path()), 0);
}

#[tokio::test]
async fn corrupt_entry_is_removed_and_treated_as_miss() {
    let (_dir, cache) = cache();
    let path = cache.keys().entry_path(&chain("user", "image1")).unwrap();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"not a cache entry").unwrap();

    let mut ctx = RequestContext::new(chain("user", "image1"));
    assert_eq!(cache.load_from_cache(&mut ctx).await, Flow::Continue);
    assert_eq!(status(&ctx), Some("Miss"));
    assert!(!path.exists());
}

#[tokio::test]
async fn truncated_entry_is_removed() {
    let (_dir, cache) = cache();
    cache.store_in_cache(&rendered(chain("user", "image1"))).await.unwrap();
    let path = cache.keys().entry_path(&chain("user", "image1")).unwrap();
    let raw = std::fs::read(&path).unwrap();
    std::fs::write(&path, &raw[..raw.len() - 3]).unwrap();

    let mut ctx = RequestContext::new(chain("user", "image1"));
    assert_eq!(cache.load_from_cache(&mut ctx).await, Flow::Continue);
    assert!(!path.exists());
}

#[tokio::test]
async fn writes_leave_no_temp_files() {
    let (dir, cache) = cache();
    for _ in 0..3 {
        cache.store_in_cache(&rendered(chain("user", "image1"))).await.unwrap();
    }
    assert_eq!(count_files(dir.path()), 1);
}

#[tokio::test]
async fn non_utf8_header_values_survive_a_hit() {
    let (_dir, cache) = cache();
    let mut ctx = rendered(chain("user", "image1"));
    let disposition = HeaderValue::from_bytes("inline; filename=\"café.png\"".as_bytes()).unwrap();
    ctx.response.headers.insert(CONTENT_DISPOSITION, disposition.clone());
    cache.store_in_cache(&ctx).await.unwrap();

    let mut hit = RequestContext::new(chain("user", "image1"));
    assert_eq!(cache.load_from_cache(&mut hit).await, Flow::Stop);
    assert_eq!(hit.response.headers.get(CONTENT_DISPOSITION), Some(&disposition));
}

#[tokio::test]
async fn concurrent_stores_leave_one_complete_entry() {
    let (dir, cache) = cache();
    let mut writers = tokio::task::JoinSet::new();
    for i in 0..16u8 {
        let cache = cache.clone();
        let mut ctx = rendered(chain("user", "image1"));
        if let Some(image) = ctx.response.image_mut() {
            image.blob = Bytes::from(vec![i; 4096]);
        }
        writers.spawn(async move { cache.store_in_cache(&ctx).await });
    }
    while let Some(result) = writers.join_next().await {
        assert!(result.unwrap().unwrap());
    }

    assert_eq!(count_files(dir.path()), 1);
    let mut hit = RequestContext::new(chain("user", "image1"));
    assert_eq!(cache.load_from_cache(&mut hit).await, Flow::Stop);
    let blob = &hit.response.image().unwrap().blob;
    assert_eq!(blob.len(), 4096);
    assert!(blob.iter().all(|b| *b == blob[0]));
}

#[tokio::test]
async fn delete_prunes_empty_ancestors_and_keeps_siblings() {
    let (dir, cache) = cache();
    cache.store_in_cache(&rendered(chain("user", "f3210f1bb34bfbfa432cc3560be40761"))).await.unwrap();
    cache.store_in_cache(&rendered(chain("user", "f3210f1bb34bfbfa432cc3560be40761").with_extension("jpg"))).await.unwrap();
    cache.store_in_cache(&rendered(chain("user", "f32aaaaaaaaaaaaaaaaaaaaaaaaaaaaa"))).await.unwrap();
    cache.store_in_cache(&rendered(chain("other", "0123456789abcdef0123456789abcdef"))).await.unwrap();

    cache.delete_from_cache("user", "f3210f1bb34bfbfa432cc3560be40761").await.unwrap();

    let deleted = cache.keys().image_dir("user", "f3210f1bb34bfbfa432cc3560be40761").unwrap();
    assert!(!deleted.exists());
    // Shared shard directories still hold the sibling image
    assert!(deleted.parent().unwrap().exists());
    assert_eq!(count_files(dir.path()), 2);

    let mut sibling = RequestContext::new(chain("user", "f32aaaaaaaaaaaaaaaaaaaaaaaaaaaaa"));
    assert_eq!(cache.load_from_cache(&mut sibling).await, Flow::Stop);

    cache.delete_from_cache("user", "f32aaaaaaaaaaaaaaaaaaaaaaaaaaaaa").await.unwrap();
    assert!(!dir.path().join("u").exists());
    assert!(dir.path().join("o").exists());
    assert!(dir.path().exists());
}

#[tokio::test]
async fn deleting_an_uncached_image_is_fine() {
    let (_dir, cache) = cache();
    cache.delete_from_cache("user", "never-cached").await.unwrap();
}

#[tokio::test]
async fn rejects_identifiers_that_escape_the_root() {
    let (_dir, cache) = cache();
    let err = cache.delete_from_cache("..", "image").await.unwrap_err();
    assert!(matches!(err, CacheError::InvalidIdentifier(_)));

    let ctx = rendered(chain("user", "a/b"));
    assert!(matches!(cache.store_in_cache(&ctx).await, Err(CacheError::InvalidIdentifier(_))));
}

#[test]
fn fingerprint_is_hex_sha256() {
    let fp = CacheKeyBuilder::fingerprint(&chain("user", "image1"));
    assert_eq!(fp.as_str().len(), 64);
    assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn empty_cache_path_is_rejected() {
    let err = TransformationResultCache::new(&TransformationCacheConfig { path: "".into() }).unwrap_err();
    assert!(matches!(err, ConfigError::MissingCachePath));
}

#[tokio::test]
async fn hook_chain_serves_repeat_requests_from_cache() {
    let (_dir, cache) = cache();
    let hooks = HookChain::new().register(Arc::new(cache.clone()));

    let mut first = RequestContext::new(chain("user", "image1"));
    assert_eq!(hooks.dispatch(Stage::ImageGet, &mut first).await, Flow::Continue);
    // Render happens outside the cache
    first.response.model = ResponseModel::Image(Image::new(Bytes::from_static(b"pixels"), 150, 100, "image/png", "png"));
    hooks.dispatch(Stage::ResponseSend, &mut first).await;

    let mut second = RequestContext::new(chain("user", "image1"));
    assert_eq!(hooks.dispatch(Stage::ImageGet, &mut second).await, Flow::Stop);
    assert_eq!(second.response.image().unwrap().blob, Bytes::from_static(b"pixels"));
    assert_eq!(status(&second), Some("Hit"));

    let mut delete = RequestContext::new(TransformationChain::new("user", "image1"));
    hooks.dispatch(Stage::ImageDelete, &mut delete).await;
    let mut third = RequestContext::new(chain("user", "image1"));
    assert_eq!(hooks.dispatch(Stage::ImageGet, &mut third).await, Flow::Continue);
}
