use super::*;
use crate::db::memory::MemoryStore;
use crate::state::BanRecord;

fn gate() -> (Arc<MemoryStore>, ModerationGate) {
    let store = Arc::new(MemoryStore::new());
    (store.clone(), ModerationGate::new(store))
}

// =============================================================================
// Bans
// =============================================================================

#[tokio::test]
async fn unknown_visitor_is_not_banned() {
    let (_store, gate) = gate();
    assert!(!gate.is_banned("v1").await.expect("lookup"));
}

#[tokio::test]
async fn permanent_ban_applies() {
    let (store, gate) = gate();
    store.insert_ban(BanRecord { visitor_id: "v1".into(), reason: Some("spam".into()), expires_at: None });
    assert!(gate.is_banned("v1").await.expect("lookup"));
    assert!(!gate.is_banned("v2").await.expect("lookup"));
}

#[tokio::test]
async fn ban_expiry_is_compared_at_read_time() {
    let (store, gate) = gate();
    store.insert_ban(BanRecord { visitor_id: "past".into(), reason: None, expires_at: Some(now_ms() - 1_000) });
    store.insert_ban(BanRecord { visitor_id: "future".into(), reason: None, expires_at: Some(now_ms() + 60_000) });
    assert!(!gate.is_banned("past").await.expect("lookup"));
    assert!(gate.is_banned("future").await.expect("lookup"));
}

#[tokio::test]
async fn ban_lookup_failure_is_an_error() {
    let (store, gate) = gate();
    store.set_failing(true);
    assert!(gate.is_banned("v1").await.is_err());
}

// =============================================================================
// Profanity
// =============================================================================

#[tokio::test]
async fn masking_is_noop_without_words() {
    let (_store, gate) = gate();
    assert_eq!(gate.mask_profanity("hello darn world"), "hello darn world");
}

#[tokio::test]
async fn masks_whole_words_case_insensitively() {
    let (store, gate) = gate();
    store.set_profanity_words(&["Darn", " heck "]);
    assert_eq!(gate.refresh_profanity().await.expect("refresh"), 2);

    assert_eq!(gate.mask_profanity("DARN it, heck!"), "**** it, ****!");
    assert_eq!(gate.mask_profanity("darned hecking"), "darned hecking");
}

#[tokio::test]
async fn failed_refresh_keeps_cached_words() {
    let (store, gate) = gate();
    store.set_profanity_words(&["darn"]);
    gate.refresh_profanity().await.expect("refresh");

    store.set_failing(true);
    assert!(gate.refresh_profanity().await.is_err());
    assert_eq!(gate.mask_profanity("darn"), "****");
}

#[tokio::test]
async fn masking_preserves_non_ascii_text() {
    let (store, gate) = gate();
    store.set_profanity_words(&["zut"]);
    gate.refresh_profanity().await.expect("refresh");
    assert_eq!(gate.mask_profanity("zut 👋 café"), "*** 👋 café");
}
