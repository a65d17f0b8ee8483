mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use blueq::fake::{FakeAdapter, FakeCommand};
use blueq::{BackendEvent, CharacteristicId, Error, ListenRestorer, PeripheralId, Session,
            SessionConfig, RESTORE_BUFFER_CAPACITY};

use common::*;

struct Restore(HashSet<CharacteristicId>);

impl ListenRestorer for Restore {
    fn can_restore(&self, characteristic: &CharacteristicId) -> bool {
        self.0.contains(characteristic)
    }
}

fn restoring(characteristics: &[CharacteristicId]) -> Arc<dyn ListenRestorer> {
    Arc::new(Restore(characteristics.iter().copied().collect()))
}

/// A relaunched session whose adapter reports `candidates` as still
/// subscribed on a freshly declared peripheral
async fn relaunch(mut config: SessionConfig, restorer: Option<Arc<dyn ListenRestorer>>,
                  candidates: Vec<CharacteristicId>)
                  -> (Session, FakeAdapter, PeripheralId) {
    init_logging();
    if let Some(restorer) = restorer {
        config.set_listen_restorer(restorer);
    }
    let (session, adapter) = config.start_fake().await.unwrap();
    let p = adapter.declare_peripheral();
    adapter.emit(BackendEvent::RestorationCandidates { peripheral: p,
                                                       characteristics: candidates });
    adapter.power_on();
    session.flush().await.unwrap();
    (session, adapter, p)
}

#[tokio::test]
async fn without_a_restorer_every_candidate_is_ended() {
    let (session, mut adapter, p) =
        relaunch(SessionConfig::new(), None, vec![MEASUREMENT, BATTERY_LEVEL]).await;

    adapter.expect_command(FakeCommand::Unsubscribe(p, MEASUREMENT)).await;
    adapter.expect_command(FakeCommand::Unsubscribe(p, BATTERY_LEVEL)).await;

    // Acknowledgements of these don't belong to any operation
    adapter.notification_state(p, MEASUREMENT, false);
    adapter.notification_state(p, BATTERY_LEVEL, false);
    session.flush().await.unwrap();

    assert!(!session.is_listening(MEASUREMENT).await.unwrap());
    assert!(matches!(session.restore_listen(MEASUREMENT, |_| ()).await,
                     Err(Error::NotListening)));
}

#[tokio::test]
async fn declined_candidates_are_ended_and_accepted_ones_buffered() {
    let (session, mut adapter, p) = relaunch(SessionConfig::new(),
                                             Some(restoring(&[MEASUREMENT])),
                                             vec![MEASUREMENT, BATTERY_LEVEL]).await;

    adapter.expect_command(FakeCommand::Unsubscribe(p, BATTERY_LEVEL)).await;
    session.flush().await.unwrap();
    assert_eq!(adapter.try_next_command(), None);

    adapter.notify(p, MEASUREMENT, &[1]);
    adapter.notify(p, MEASUREMENT, &[2]);
    adapter.notify(p, MEASUREMENT, &[3]);

    let (values, callback) = collector();
    session.restore_listen(MEASUREMENT, callback).await.unwrap();
    assert!(session.is_listening(MEASUREMENT).await.unwrap());
    assert_eq!(*values.lock().unwrap(), vec![vec![1], vec![2], vec![3]]);

    adapter.notify(p, MEASUREMENT, &[4]);
    session.flush().await.unwrap();
    assert_eq!(values.lock().unwrap().last(), Some(&vec![4]));

    // Claiming never subscribes again
    assert_eq!(adapter.try_next_command(), None);
}

#[tokio::test]
async fn a_regular_listen_claims_a_restored_subscription() {
    let (session, mut adapter, p) = relaunch(SessionConfig::new(),
                                             Some(restoring(&[MEASUREMENT])),
                                             vec![MEASUREMENT]).await;

    adapter.notify(p, MEASUREMENT, &[9]);
    let (values, callback) = collector();
    session.listen(MEASUREMENT, callback).await.unwrap();

    assert_eq!(*values.lock().unwrap(), vec![vec![9]]);
    assert_eq!(adapter.try_next_command(), None);
}

#[tokio::test]
async fn restore_buffer_keeps_the_oldest_updates() {
    let (session, adapter, p) = relaunch(SessionConfig::new(),
                                         Some(restoring(&[MEASUREMENT])),
                                         vec![MEASUREMENT]).await;

    let total = RESTORE_BUFFER_CAPACITY + 4;
    for i in 0..total {
        adapter.notify(p, MEASUREMENT, &[i as u8]);
    }

    let (values, callback) = collector();
    session.restore_listen(MEASUREMENT, callback).await.unwrap();

    let expected: Vec<Vec<u8>> = (0..RESTORE_BUFFER_CAPACITY).map(|i| vec![i as u8]).collect();
    assert_eq!(*values.lock().unwrap(), expected);
}

#[tokio::test]
async fn restored_subscriptions_can_be_ended_before_being_claimed() {
    let (session, mut adapter, p) = relaunch(SessionConfig::new(),
                                             Some(restoring(&[MEASUREMENT])),
                                             vec![MEASUREMENT]).await;

    session.end_listen(MEASUREMENT).await.unwrap();
    adapter.expect_command(FakeCommand::Unsubscribe(p, MEASUREMENT)).await;
    assert!(matches!(session.restore_listen(MEASUREMENT, |_| ()).await,
                     Err(Error::NotListening)));
}

#[tokio::test]
async fn restored_subscriptions_survive_the_link_dropping() {
    let (session, mut adapter, p) = relaunch(SessionConfig::new(),
                                             Some(restoring(&[MEASUREMENT])),
                                             vec![MEASUREMENT]).await;

    adapter.emit(BackendEvent::PeripheralConnected { peripheral: p });
    adapter.emit(BackendEvent::PeripheralDisconnected { peripheral: p, error: None });
    session.flush().await.unwrap();

    session.restore_listen(MEASUREMENT, |_| ()).await.unwrap();
    assert_eq!(adapter.try_next_command(), None);
}

#[tokio::test(start_paused = true)]
async fn unclaimed_candidates_are_ended_after_the_restore_window() {
    let mut config = SessionConfig::new();
    config.set_restore_window(Duration::from_secs(5));
    let (session, mut adapter, p) =
        relaunch(config, Some(restoring(&[MEASUREMENT])), vec![MEASUREMENT]).await;

    tokio::time::sleep(Duration::from_secs(6)).await;
    adapter.expect_command(FakeCommand::Unsubscribe(p, MEASUREMENT)).await;

    assert!(matches!(session.restore_listen(MEASUREMENT, |_| ()).await,
                     Err(Error::NotListening)));
}

#[tokio::test]
async fn ending_a_claimed_restored_listen_unsubscribes() {
    let (session, mut adapter, p) = relaunch(SessionConfig::new(),
                                             Some(restoring(&[MEASUREMENT])),
                                             vec![MEASUREMENT]).await;

    session.restore_listen(MEASUREMENT, |_| ()).await.unwrap();

    // No connect was ever made for the restored peripheral
    let end = session.end_listen(MEASUREMENT);
    adapter.accept_unsubscribe(p, MEASUREMENT).await;
    end.await.unwrap();
    assert!(!session.is_listening(MEASUREMENT).await.unwrap());
}

#[tokio::test]
async fn late_acks_for_ended_candidates_never_resolve_a_later_end_listen() {
    let (session, mut adapter, p) = relaunch(SessionConfig::new(), None, vec![MEASUREMENT]).await;
    adapter.expect_command(FakeCommand::Unsubscribe(p, MEASUREMENT)).await;

    adapter.emit(BackendEvent::PeripheralConnected { peripheral: p });
    let listen = session.listen(MEASUREMENT, |_| ());
    adapter.accept_subscribe(p, MEASUREMENT).await;
    listen.await.unwrap();

    let mut end = session.end_listen(MEASUREMENT);
    adapter.expect_command(FakeCommand::Unsubscribe(p, MEASUREMENT)).await;

    // Acknowledges the unsubscribe issued when the candidate was ended
    adapter.notification_state(p, MEASUREMENT, false);
    session.flush().await.unwrap();
    assert!((&mut end).now_or_never().is_none());

    adapter.notification_state(p, MEASUREMENT, false);
    end.await.unwrap();
}
