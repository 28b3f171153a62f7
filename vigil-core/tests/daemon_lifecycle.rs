use std::{io, sync::Arc, time::Duration};

use async_trait::async_trait;
use vigil_core::{
    Daemon, GetScansQuery, ScanError,
    kb::{KbError, MemoryKb},
    scan::{
        EngineExit, EngineInvocation, EngineLauncher, EngineProcess, ResultType, ScanId,
        ScanRequest, ScanStatus, ScanTarget,
    },
};

mod support;

use support::{
    Behavior, SimulatedEngine, connector, daemon_with, keys_in, registry_in_use, slow_connector,
    snapshot, test_config, wait_for_status, wait_until,
};

fn two_targets(id: &str) -> ScanRequest {
    ScanRequest {
        scan_id: Some(id.to_string()),
        targets: vec![
            ScanTarget::new("host-a", "80,443"),
            ScanTarget::new("host-b", "22"),
        ],
        ..ScanRequest::default()
    }
}

#[tokio::test]
async fn two_target_scan_runs_to_completion_and_can_be_deleted() {
    let kb = MemoryKb::new(8);
    let engine = SimulatedEngine::new(kb.clone());
    let daemon = daemon_with(&kb, &engine).await;

    let id = daemon.start_scan(two_targets("e2e")).await.unwrap();
    assert_eq!(id, ScanId::new("e2e"));

    let snap = wait_for_status(&daemon, &id, ScanStatus::Finished).await;
    assert_ne!(snap.end_time, 0);
    assert_eq!(snap.progress, 100);
    assert_eq!(snap.target, "host-a,host-b");

    let mut launched = engine.launches();
    launched.sort();
    assert_eq!(launched, vec![vec!["host-a"], vec!["host-b"]]);

    // Every worker flushed and released its index.
    assert!(!registry_in_use(&kb).await);
    for index in 1..8 {
        assert_eq!(keys_in(&kb, index).await, 0, "index {index}");
    }

    let full = daemon
        .get_scans(GetScansQuery::for_scan(id.clone()))
        .await
        .unwrap();
    assert_eq!(full[0].results.len(), 2);

    daemon.delete_scan(&id).await.unwrap();
    assert!(matches!(
        daemon.get_scans(GetScansQuery::for_scan(id.clone())).await,
        Err(ScanError::NotFound(_))
    ));
    assert!(matches!(
        daemon.delete_scan(&id).await,
        Err(ScanError::NotFound(_))
    ));
}

#[tokio::test]
async fn results_stream_in_engine_order_with_pop_and_max() {
    let kb = MemoryKb::new(4);
    let engine = SimulatedEngine::new(kb.clone());
    engine.set_results_per_host(3);
    let daemon = daemon_with(&kb, &engine).await;

    let id = daemon
        .start_scan(ScanRequest {
            target: Some("solo".into()),
            ports: Some("22".into()),
            ..ScanRequest::default()
        })
        .await
        .unwrap();
    wait_for_status(&daemon, &id, ScanStatus::Finished).await;

    let query = |pop_results, max_results| GetScansQuery {
        scan_id: Some(id.clone()),
        details: true,
        pop_results,
        max_results,
    };

    let peek = daemon.get_scans(query(false, None)).await.unwrap();
    let values: Vec<_> = peek[0].results.iter().map(|r| r.value().to_string()).collect();
    assert_eq!(values, vec!["result 0", "result 1", "result 2"]);

    let first = daemon.get_scans(query(true, Some(1))).await.unwrap();
    assert_eq!(first[0].results.len(), 1);
    assert_eq!(first[0].results[0].value(), "result 0");

    let rest = daemon.get_scans(query(true, None)).await.unwrap();
    assert_eq!(rest[0].results.len(), 2);

    let empty = daemon.get_scans(query(true, None)).await.unwrap();
    assert!(empty[0].results.is_empty());
}

#[tokio::test]
async fn resumed_scan_only_relaunches_unfinished_hosts() {
    let kb = MemoryKb::new(8);
    let engine = SimulatedEngine::new(kb.clone());
    engine.set_behavior("host-b", Behavior::Hang);
    let daemon = daemon_with(&kb, &engine).await;

    let id = daemon.start_scan(two_targets("resume")).await.unwrap();
    wait_until(|| async {
        daemon.get_scan_finished_hosts(&id).await.unwrap() == vec!["host-a".to_string()]
    })
    .await;

    daemon.stop_scan(&id).await.unwrap();
    let stopped = snapshot(&daemon, &id).await;
    assert_eq!(stopped.status, ScanStatus::Stopped);
    assert_ne!(stopped.end_time, 0);
    assert!(matches!(
        daemon.stop_scan(&id).await,
        Err(ScanError::InvalidRequest(_))
    ));

    // Stop releases asynchronously.
    wait_until(|| async { !registry_in_use(&kb).await }).await;

    engine.set_behavior("host-b", Behavior::Complete);
    let resumed = daemon.start_scan(two_targets("resume")).await.unwrap();
    assert_eq!(resumed, id);
    assert_eq!(
        daemon.get_scan_unfinished_hosts(&id).await.unwrap(),
        vec!["host-b".to_string()]
    );

    let snap = wait_for_status(&daemon, &id, ScanStatus::Finished).await;
    assert_ne!(snap.end_time, 0);

    let launches = engine.launches();
    assert_eq!(
        launches.iter().filter(|hosts| hosts.contains(&"host-a".to_string())).count(),
        1
    );
    assert_eq!(launches.last(), Some(&vec!["host-b".to_string()]));

    // The result host-a produced before the stop survived the resume.
    let results = daemon
        .get_scans(GetScansQuery::for_scan(id.clone()))
        .await
        .unwrap()
        .remove(0)
        .results;
    assert!(results.iter().any(|r| r.host() == "host-a"));
    assert!(results.iter().any(|r| r.host() == "host-b"));
}

#[tokio::test]
async fn engine_failure_is_contained_to_its_hosts() {
    let kb = MemoryKb::new(8);
    let engine = SimulatedEngine::new(kb.clone());
    engine.set_behavior("host-a", Behavior::Crash);
    let daemon = daemon_with(&kb, &engine).await;

    let id = daemon.start_scan(two_targets("crash")).await.unwrap();
    wait_for_status(&daemon, &id, ScanStatus::Finished).await;

    let results = daemon
        .get_scans(GetScansQuery::for_scan(id.clone()))
        .await
        .unwrap()
        .remove(0)
        .results;

    let for_a: Vec<_> = results.iter().filter(|r| r.host() == "host-a").collect();
    assert_eq!(for_a.len(), 2);
    assert_eq!(for_a[0].result_type(), ResultType::Alarm);
    assert_eq!(for_a[1].result_type(), ResultType::Error);

    assert!(results
        .iter()
        .any(|r| r.host() == "host-b" && r.result_type() == ResultType::Log));
    assert_eq!(
        daemon.get_scan_finished_hosts(&id).await.unwrap(),
        vec!["host-b".to_string()]
    );
    assert!(!registry_in_use(&kb).await);
}

#[tokio::test]
async fn missing_handshake_fails_the_host() {
    let kb = MemoryKb::new(4);
    let engine = SimulatedEngine::new(kb.clone());
    engine.set_behavior("quiet", Behavior::Silent);
    let daemon = daemon_with(&kb, &engine).await;

    let id = daemon
        .start_scan(ScanRequest {
            target: Some("quiet".into()),
            ..ScanRequest::default()
        })
        .await
        .unwrap();
    wait_for_status(&daemon, &id, ScanStatus::Finished).await;

    let results = daemon
        .get_scans(GetScansQuery::for_scan(id))
        .await
        .unwrap()
        .remove(0)
        .results;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].result_type(), ResultType::Error);
    assert!(results[0].value().contains("acknowledge"));
}

#[tokio::test]
async fn exhausted_pool_rejects_and_rolls_back_the_start() {
    // Index 0 is the registry, so only index 1 is allocatable.
    let kb = MemoryKb::new(2);
    let engine = SimulatedEngine::new(kb.clone());
    engine.set_behavior("busy", Behavior::Hang);
    let daemon = daemon_with(&kb, &engine).await;

    let first = daemon
        .start_scan(ScanRequest {
            scan_id: Some("first".into()),
            target: Some("busy".into()),
            ..ScanRequest::default()
        })
        .await
        .unwrap();

    let err = daemon
        .start_scan(ScanRequest {
            scan_id: Some("second".into()),
            target: Some("other".into()),
            ..ScanRequest::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::PoolExhausted { max: 2 }));
    assert!(matches!(
        daemon
            .get_scans(GetScansQuery::for_scan(ScanId::new("second")))
            .await,
        Err(ScanError::NotFound(_))
    ));

    daemon.stop_scan(&first).await.unwrap();
    wait_until(|| async { !registry_in_use(&kb).await }).await;

    // A stopped scan whose resume cannot get an index goes back to stopped.
    let mut squatter = kb.context();
    squatter.select_database(1).await.unwrap();
    squatter.append_item("internal/results", "{}").await.unwrap();
    assert!(matches!(
        daemon
            .start_scan(ScanRequest {
                scan_id: Some("first".into()),
                ..ScanRequest::default()
            })
            .await,
        Err(ScanError::PoolExhausted { .. })
    ));
    assert_eq!(snapshot(&daemon, &first).await.status, ScanStatus::Stopped);
}

#[tokio::test]
async fn parallelism_bounds_concurrent_workers() {
    let kb = MemoryKb::new(8);
    let engine = SimulatedEngine::new(kb.clone());
    for host in ["a", "b", "c"] {
        engine.set_behavior(host, Behavior::Hang);
    }
    let daemon = daemon_with(&kb, &engine).await;

    let id = daemon
        .start_scan(ScanRequest {
            targets: vec![
                ScanTarget::new("a", "22"),
                ScanTarget::new("b", "22"),
                ScanTarget::new("c", "22"),
            ],
            parallel: Some(2),
            ..ScanRequest::default()
        })
        .await
        .unwrap();

    wait_until(|| async { engine.launches().len() == 2 }).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.launches().len(), 2);

    daemon.stop_scan(&id).await.unwrap();
    daemon.shutdown().await;
    assert!(!registry_in_use(&kb).await);
}

#[tokio::test]
async fn unreachable_store_fails_daemon_startup() {
    let kb = MemoryKb::new(4);
    kb.refuse_connections(10).await;
    let engine = SimulatedEngine::new(kb.clone());

    let err = Daemon::new(test_config(), connector(&kb), Arc::new(engine))
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, ScanError::Kb(KbError::Unreachable { .. })));
}

#[tokio::test]
async fn unreadable_pool_size_fails_daemon_startup() {
    let kb = MemoryKb::new(4);
    kb.set_server_config("databases", None).await;
    let engine = SimulatedEngine::new(kb.clone());

    let err = Daemon::new(test_config(), connector(&kb), Arc::new(engine))
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::Kb(KbError::Configuration(_))));
    assert!(!err.is_fatal());
}

#[tokio::test]
async fn invalid_requests_are_rejected_up_front() {
    let kb = MemoryKb::new(4);
    let engine = SimulatedEngine::new(kb.clone());
    let daemon = daemon_with(&kb, &engine).await;

    assert!(matches!(
        daemon.start_scan(ScanRequest::default()).await,
        Err(ScanError::InvalidRequest(_))
    ));
    assert!(matches!(
        daemon
            .start_scan(ScanRequest {
                target: Some("10.0.0.0/8".into()),
                ..ScanRequest::default()
            })
            .await,
        Err(ScanError::InvalidRequest(_))
    ));
    assert!(daemon.collection().is_empty().await);
    assert!(engine.launches().is_empty());
}

fn single_host(id: &str, host: &str) -> ScanRequest {
    ScanRequest {
        scan_id: Some(id.to_string()),
        target: Some(host.into()),
        ..ScanRequest::default()
    }
}

#[tokio::test]
async fn stop_while_the_first_index_is_being_claimed_launches_nothing() {
    let kb = MemoryKb::new(4);
    let engine = SimulatedEngine::new(kb.clone());
    engine.set_behavior("host-a", Behavior::Hang);
    let daemon = Arc::new(
        Daemon::new(
            test_config(),
            slow_connector(&kb, Duration::from_millis(150)),
            Arc::new(engine.clone()),
        )
        .await
        .unwrap(),
    );

    let starting = tokio::spawn({
        let daemon = Arc::clone(&daemon);
        async move { daemon.start_scan(single_host("early-stop", "host-a")).await }
    });
    wait_until(|| async { !daemon.collection().is_empty().await }).await;

    let id = ScanId::new("early-stop");
    daemon.stop_scan(&id).await.unwrap();
    assert_eq!(starting.await.unwrap().unwrap(), id);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(snapshot(&daemon, &id).await.status, ScanStatus::Stopped);
    assert!(engine.launches().is_empty());
    assert!(!registry_in_use(&kb).await);
}

#[tokio::test]
async fn resume_waits_for_engines_that_ignore_the_stop() {
    let kb = MemoryKb::new(8);
    let engine = SimulatedEngine::new(kb.clone());
    engine.set_behavior("host-b", Behavior::Stubborn);
    let daemon = daemon_with(&kb, &engine).await;

    let id = daemon.start_scan(two_targets("stubborn")).await.unwrap();
    wait_until(|| async {
        daemon.get_scan_finished_hosts(&id).await.unwrap() == vec!["host-a".to_string()]
            && snapshot(&daemon, &id).await.progress > 50
    })
    .await;

    daemon.stop_scan(&id).await.unwrap();
    engine.set_behavior("host-b", Behavior::Complete);
    daemon.start_scan(two_targets("stubborn")).await.unwrap();

    wait_for_status(&daemon, &id, ScanStatus::Finished).await;
    assert_eq!(engine.overlapping_launches(), 0);
    assert_eq!(engine.launches().last(), Some(&vec!["host-b".to_string()]));
    wait_until(|| async { !registry_in_use(&kb).await }).await;
}

#[tokio::test]
async fn dropped_connections_are_reopened_between_scans() {
    let kb = MemoryKb::new(4);
    let engine = SimulatedEngine::new(kb.clone());
    let daemon = daemon_with(&kb, &engine).await;

    let first = daemon.start_scan(single_host("before", "host-a")).await.unwrap();
    wait_for_status(&daemon, &first, ScanStatus::Finished).await;

    kb.drop_connections();
    let second = daemon.start_scan(single_host("after", "host-b")).await.unwrap();
    wait_for_status(&daemon, &second, ScanStatus::Finished).await;

    assert_eq!(
        daemon.get_scan_finished_hosts(&second).await.unwrap(),
        vec!["host-b".to_string()]
    );
    wait_until(|| async { !registry_in_use(&kb).await }).await;
    assert!(!daemon.fatal_token().is_cancelled());
}

#[tokio::test]
async fn connection_dropped_mid_scan_still_cleans_up_the_index() {
    let kb = MemoryKb::new(4);
    let engine = SimulatedEngine::new(kb.clone());
    engine.set_behavior("host-a", Behavior::Hang);
    let daemon = daemon_with(&kb, &engine).await;

    let id = daemon.start_scan(single_host("reset", "host-a")).await.unwrap();
    wait_until(|| async { snapshot(&daemon, &id).await.progress == 50 }).await;

    kb.drop_connections();
    wait_for_status(&daemon, &id, ScanStatus::Finished).await;
    wait_until(|| async { !registry_in_use(&kb).await }).await;

    assert_eq!(keys_in(&kb, 1).await, 0);
    let results = daemon
        .get_scans(GetScansQuery::for_scan(id))
        .await
        .unwrap()
        .remove(0)
        .results;
    assert!(results.iter().any(|r| r.result_type() == ResultType::Error));
    assert!(!daemon.fatal_token().is_cancelled());
}

#[tokio::test]
async fn store_lost_at_runtime_trips_the_fatal_token() {
    let kb = MemoryKb::new(4);
    let engine = SimulatedEngine::new(kb.clone());
    let daemon = daemon_with(&kb, &engine).await;

    kb.drop_connections();
    kb.refuse_connections(u32::MAX).await;

    let err = daemon
        .start_scan(single_host("lost", "host-a"))
        .await
        .unwrap_err();
    assert!(err.is_fatal(), "{err}");
    assert!(daemon.fatal_token().is_cancelled());
    assert!(daemon.collection().is_empty().await);
}

#[tokio::test]
async fn store_lost_mid_scan_trips_the_fatal_token() {
    let kb = MemoryKb::new(4);
    let engine = SimulatedEngine::new(kb.clone());
    engine.set_behavior("host-a", Behavior::Hang);
    let daemon = daemon_with(&kb, &engine).await;

    let id = daemon.start_scan(single_host("lost-later", "host-a")).await.unwrap();
    wait_until(|| async { snapshot(&daemon, &id).await.progress == 50 }).await;

    kb.drop_connections();
    kb.refuse_connections(u32::MAX).await;

    let fatal = daemon.fatal_token();
    tokio::time::timeout(Duration::from_secs(5), fatal.cancelled())
        .await
        .expect("fatal token cancelled");
    daemon.shutdown().await;
}

/// Engine that acknowledges, reports and exits between two polls.
#[derive(Debug)]
struct QuickLauncher {
    kb: MemoryKb,
}

#[derive(Debug)]
struct QuickProcess {
    kb: MemoryKb,
    index: usize,
    host: String,
}

#[async_trait]
impl EngineLauncher for QuickLauncher {
    async fn launch(&self, invocation: &EngineInvocation) -> io::Result<Box<dyn EngineProcess>> {
        Ok(Box::new(QuickProcess {
            kb: self.kb.clone(),
            index: invocation.index,
            host: invocation.hosts.first().cloned().unwrap_or_default(),
        }))
    }
}

#[async_trait]
impl EngineProcess for QuickProcess {
    fn try_wait(&mut self) -> io::Result<Option<EngineExit>> {
        let mut ctx = self.kb.context();
        let (index, host) = (self.index, self.host.clone());
        futures::executor::block_on(async move {
            ctx.select_database(index).await?;
            ctx.set_single("internal/status", "finished").await?;
            let entry = format!(r#"{{"type":"log","host":"{host}","name":"quick","value":"done"}}"#);
            ctx.prepend_item("internal/results", &entry).await
        })
        .map_err(io::Error::other)?;
        Ok(Some(EngineExit::Success))
    }

    async fn terminate(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn engine_that_exits_right_after_acknowledging_succeeds() {
    let kb = MemoryKb::new(4);
    let launcher = Arc::new(QuickLauncher { kb: kb.clone() });
    let daemon = Daemon::new(test_config(), connector(&kb), launcher)
        .await
        .unwrap();

    let id = daemon.start_scan(single_host("quick", "host-q")).await.unwrap();
    wait_for_status(&daemon, &id, ScanStatus::Finished).await;

    assert_eq!(
        daemon.get_scan_finished_hosts(&id).await.unwrap(),
        vec!["host-q".to_string()]
    );
    let results = daemon
        .get_scans(GetScansQuery::for_scan(id))
        .await
        .unwrap()
        .remove(0)
        .results;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].value(), "done");
    assert_ne!(results[0].result_type(), ResultType::Error);
}
