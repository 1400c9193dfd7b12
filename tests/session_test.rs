mod common;

use common::{credentials, session_manager, session_manager_with, DeviceState, SERIAL};
use quest_downgrade::adb::auth::CredentialStore;
use quest_downgrade::{BridgeError, SessionStage};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_session_reaches_ready() {
    let state = Arc::new(DeviceState::default());
    let (manager, _) = session_manager(state);

    assert_eq!(manager.stage().await, SessionStage::Unstarted);
    let session = manager.session().await.unwrap();
    assert_eq!(session.serial(), SERIAL);
    assert!(session.has_feature("shell_v2"));
    assert_eq!(session.banner().model(), Some("Quest 2"));
    assert_eq!(session.max_payload(), 4096);
    assert_eq!(manager.stage().await, SessionStage::SessionReady);
}

#[tokio::test]
async fn test_accessors_are_idempotent() {
    let state = Arc::new(DeviceState::default());
    let (manager, counters) = session_manager(state.clone());

    let first = manager.authenticate().await.unwrap();
    let device_a = manager.acquire_device().await.unwrap();
    manager.open_connection().await.unwrap();
    manager.session().await.unwrap();
    let second = manager.authenticate().await.unwrap();
    let device_b = manager.acquire_device().await.unwrap();
    manager.sync().await.unwrap();
    manager.sync().await.unwrap();
    manager.shell().await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&device_a, &device_b));
    assert_eq!(counters.factory.load(Ordering::SeqCst), 1);
    assert_eq!(counters.lookups.load(Ordering::SeqCst), 1);
    assert_eq!(state.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_initialize_reports_ready() {
    let state = Arc::new(DeviceState::default());
    let (manager, _) = session_manager(state);

    assert_eq!(manager.initialize().await, SessionStage::SessionReady);
    assert!(manager.is_ready().await);
    assert!(manager.credentials().is_loaded());
}

#[tokio::test]
async fn test_unknown_key_accepted_on_device() {
    let state = Arc::new(DeviceState {
        trusted: None,
        accept_new_keys: true,
        ..DeviceState::default()
    });
    let (manager, _) = session_manager(state);

    manager.session().await.unwrap();
    assert!(manager.is_ready().await);
}

#[tokio::test]
async fn test_rejected_key_times_out_and_stays_partial() {
    let state = Arc::new(DeviceState {
        trusted: None,
        accept_new_keys: false,
        ..DeviceState::default()
    });
    let (manager, _) =
        session_manager_with(state.clone(), credentials(), Duration::from_millis(200));

    let err = manager.authenticate().await.unwrap_err();
    assert!(matches!(err, BridgeError::Authentication(_)), "{}", err);

    // The handshake consumed the connection; device selection survives
    assert_eq!(manager.stage().await, SessionStage::DeviceSelected);
    assert_eq!(manager.initialize().await, SessionStage::DeviceSelected);
    assert_eq!(state.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_reset_forces_fresh_connection() {
    let state = Arc::new(DeviceState::default());
    let (manager, counters) = session_manager(state.clone());

    manager.session().await.unwrap();
    manager.reset().await;
    assert_eq!(manager.stage().await, SessionStage::ManagerReady);

    manager.session().await.unwrap();
    assert_eq!(state.connects.load(Ordering::SeqCst), 2);
    assert_eq!(counters.factory.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_credentials_follow_connection() {
    let state = Arc::new(DeviceState::default());
    let store = Arc::new(CredentialStore::from_key(common::test_key(), "a@b"));
    let (manager, _) = session_manager_with(state, store, Duration::from_secs(5));

    manager.acquire_credentials().await.unwrap();
    assert_eq!(manager.stage().await, SessionStage::CredentialsReady);
}

#[tokio::test]
async fn test_stage_answers_while_key_is_pending() {
    let state = Arc::new(DeviceState {
        trusted: None,
        accept_new_keys: false,
        ..DeviceState::default()
    });
    let (manager, _) = session_manager_with(state, credentials(), Duration::from_secs(2));
    let manager = Arc::new(manager);

    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.authenticate().await }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stage = tokio::time::timeout(Duration::from_millis(500), manager.stage())
        .await
        .expect("stage() blocked behind the handshake");
    assert_eq!(stage, SessionStage::CredentialsReady);
    let ready = tokio::time::timeout(Duration::from_millis(500), manager.is_ready())
        .await
        .expect("is_ready() blocked behind the handshake");
    assert!(!ready);

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, BridgeError::Authentication(_)), "{}", err);
    assert_eq!(manager.stage().await, SessionStage::DeviceSelected);
}

#[tokio::test]
async fn test_reset_during_handshake_discards_result() {
    let state = Arc::new(DeviceState {
        trusted: None,
        accept_new_keys: false,
        ..DeviceState::default()
    });
    let (manager, _) = session_manager_with(state, credentials(), Duration::from_millis(500));
    let manager = Arc::new(manager);

    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.authenticate().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.reset().await;

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, BridgeError::NotReady(_)), "{}", err);
    assert_eq!(manager.stage().await, SessionStage::ManagerReady);
}
