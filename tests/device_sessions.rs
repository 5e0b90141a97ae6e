use std::sync::Arc;

use rjunos::error::{DeviceError, ErrorKind};
use rjunos::options::{ArgMap, ArgValue, ConfigMode, LoadAction, RollbackId, RpcFormat};
use rjunos::output::{OutputOptions, OutputSink};
use rjunos::session::{
    CommitOptions, ConfigRequest, ConfigSessionState, ConnectionManager, ConnectionParams,
    LoadRequest, RpcBatch, RpcRequest, SessionEvent, SessionRecorder,
};
use rjunos::transport::{ScriptedDevice, ScriptedReply};

fn manager(device: &ScriptedDevice) -> ConnectionManager {
    ConnectionManager::with_connector(
        ConnectionParams::new("r1", "admin").with_password("secret"),
        Arc::new(device.clone()),
    )
}

#[tokio::test]
async fn every_mode_releases_the_session_for_the_next() {
    let device = ScriptedDevice::new();
    let mut mgr = manager(&device);

    for mode in ConfigMode::ALL {
        mgr.open_configuration(&ConfigRequest::new(*mode))
            .await
            .expect("open configuration");
        assert_eq!(mgr.config_mode(), Some(*mode));
        mgr.close_configuration().await.expect("close configuration");
        assert_eq!(mgr.config_state(), ConfigSessionState::Closed);
    }

    assert_eq!(device.connect_count(), 1);
    assert_eq!(device.count("lock-configuration"), 1);
    assert_eq!(device.count("unlock-configuration"), 1);
    assert_eq!(device.count("open-configuration"), 4);
    assert_eq!(device.count("close-configuration"), 4);
}

#[tokio::test]
async fn second_close_sends_nothing() {
    let device = ScriptedDevice::new();
    let mut mgr = manager(&device);
    mgr.open_configuration(&ConfigRequest::new(ConfigMode::Private))
        .await
        .expect("open configuration");

    mgr.close_configuration().await.expect("first close");
    let sent = device.calls().len();
    mgr.close_configuration().await.expect("second close");
    assert_eq!(device.calls().len(), sent);
}

#[tokio::test]
async fn reopening_the_same_mode_is_a_no_op() {
    let device = ScriptedDevice::new();
    let mut mgr = manager(&device);
    let private = ConfigRequest::new(ConfigMode::Private);

    mgr.open_configuration(&private).await.expect("first open");
    mgr.open_configuration(&private).await.expect("second open");
    assert_eq!(device.count("open-configuration"), 1);
}

#[tokio::test]
async fn rollback_ids_are_validated_before_the_device_is_contacted() {
    let device = ScriptedDevice::new();
    let mut mgr = manager(&device);
    mgr.open_configuration(&ConfigRequest::new(ConfigMode::Exclusive))
        .await
        .expect("open configuration");

    for n in [0i64, 17, 49] {
        let id = RollbackId::try_from(n).expect("valid rollback id");
        mgr.rollback_configuration(id).await.expect("rollback");
    }
    let rescue: RollbackId = "rescue".parse().expect("rescue id");
    mgr.rollback_configuration(rescue).await.expect("rescue");

    let loads: Vec<String> = device
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("<load-configuration"))
        .collect();
    assert_eq!(
        loads,
        vec![
            r#"<load-configuration rollback="0"/>"#,
            r#"<load-configuration rollback="17"/>"#,
            r#"<load-configuration rollback="49"/>"#,
            r#"<load-configuration rescue="rescue"/>"#,
        ]
    );

    let sent = device.calls().len();
    for bad in ["50", "-1", "bogus"] {
        let err = bad.parse::<RollbackId>().expect_err("invalid rollback id");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
    assert_eq!(device.calls().len(), sent);
}

#[tokio::test]
async fn batch_validation_happens_before_execution() {
    let rpcs = [
        "get-software-information",
        "get-interface-information",
        "get-route-summary-information",
    ];
    let device = ScriptedDevice::new()
        .on("get-software-information", "<software-information><host-name>r1</host-name></software-information>");
    let mut mgr = manager(&device);

    let mut broadcast = RpcBatch::new(rpcs);
    broadcast.formats = vec![RpcFormat::Xml];
    let result = mgr.execute_batch(&broadcast, None).await.expect("broadcast batch");
    assert_eq!(result.results.len(), 3);
    assert!(!result.failed);

    let mut per_rpc = RpcBatch::new(rpcs);
    per_rpc.formats = vec![RpcFormat::Xml, RpcFormat::Text, RpcFormat::Xml];
    let result = mgr.execute_batch(&per_rpc, None).await.expect("per-rpc batch");
    assert_eq!(result.results[1].format, RpcFormat::Text);

    let sent = device.calls().len();
    let mut mismatched = RpcBatch::new(rpcs);
    mismatched.formats = vec![RpcFormat::Xml, RpcFormat::Text];
    let err = mgr
        .execute_batch(&mismatched, None)
        .await
        .expect_err("two formats for three rpcs");
    assert!(matches!(err, DeviceError::Validation(_)));
    assert_eq!(device.calls().len(), sent);
}

#[tokio::test]
async fn batch_continues_past_a_failing_rpc_and_saves_outputs() {
    let device = ScriptedDevice::new()
        .on("get-software-information", "<software-information><host-name>r1</host-name></software-information>")
        .on(
            "get-bogus-information",
            "<rpc-error><error-severity>error</error-severity><error-message>syntax error</error-message></rpc-error>",
        );
    let dir = tempfile::tempdir().expect("tempdir");
    let mut sink = OutputSink::new(
        "r1",
        OutputOptions {
            dest_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        },
    );
    let mut mgr = manager(&device);

    let batch = RpcBatch::new(["get-bogus-information", "get-software-information"]);
    let result = mgr
        .execute_batch(&batch, Some(&mut sink))
        .await
        .expect("batch");
    assert!(!result.failed);
    assert!(result.results[0].failed);
    assert!(result.results[0].msg.contains("syntax error"));
    assert!(!result.results[1].failed);
    let saved = result.results[1].dest.clone().expect("output saved");
    let contents = std::fs::read_to_string(saved).expect("read output");
    assert!(contents.contains("<host-name>r1</host-name>"));
}

#[tokio::test]
async fn end_to_end_exclusive_change() {
    let device = ScriptedDevice::new();
    let recorder = SessionRecorder::default();
    let mut mgr = manager(&device).with_recorder(recorder.clone());

    mgr.open().await.expect("open");
    mgr.open_configuration(&ConfigRequest::new(ConfigMode::Exclusive))
        .await
        .expect("lock");
    mgr.load_configuration(&LoadRequest::lines(
        LoadAction::Merge,
        ["set interfaces ge-0/0/0 disable"],
    ))
    .await
    .expect("load");
    mgr.check_configuration().await.expect("check");
    mgr.commit_configuration(&CommitOptions::default())
        .await
        .expect("commit");
    mgr.close_configuration().await.expect("unlock");
    mgr.close(true).await.expect("close");

    assert_eq!(mgr.config_state(), ConfigSessionState::Closed);
    assert!(!mgr.is_open());
    assert_eq!(
        device.rpc_names(),
        vec![
            "lock-configuration",
            "load-configuration",
            "commit-configuration",
            "commit-configuration",
            "unlock-configuration",
            "close-session",
        ]
    );
    let load = &device.calls()[1];
    assert!(load.contains(r#"action="merge""#));
    assert!(load.contains("set interfaces ge-0/0/0 disable"));

    let events = recorder.events().expect("events");
    assert!(matches!(events.first(), Some(SessionEvent::ConnectionOpened { .. })));
    assert!(matches!(events.last(), Some(SessionEvent::ConnectionClosed { .. })));
}

#[tokio::test]
async fn operations_without_a_session_are_rejected() {
    let device = ScriptedDevice::new();
    let mut mgr = manager(&device);
    mgr.open().await.expect("open");
    let err = mgr
        .commit_configuration(&CommitOptions::default())
        .await
        .expect_err("no configuration session");
    assert!(matches!(err, DeviceError::NotOpen));
    assert!(device.calls().is_empty());
}

#[tokio::test]
async fn lock_failure_terminates_cleanly() {
    let device = ScriptedDevice::new().on(
        "lock-configuration",
        "<rpc-error><error-severity>error</error-severity><error-message>configuration database locked by: netops</error-message></rpc-error>",
    );
    let mut mgr = manager(&device);
    let result = mgr
        .open_configuration(&ConfigRequest::new(ConfigMode::Exclusive))
        .await;
    let err = mgr.finish(result).await.expect_err("lock refused");
    assert_eq!(err.kind(), ErrorKind::ConfigurationLock);
    assert!(err.to_string().contains("locked by: netops"));
    assert!(!mgr.is_open());
    assert_eq!(device.count("unlock-configuration"), 0);
}

#[tokio::test]
async fn dropped_session_is_a_connection_error() {
    let device = ScriptedDevice::new().on("get-software-information", ScriptedReply::Closed);
    let mut mgr = manager(&device);
    let batch = RpcBatch::new(["get-software-information"]);
    let result = mgr.execute_batch(&batch, None).await.expect("batch");
    assert!(result.failed);
    assert!(!mgr.is_open());
}

#[tokio::test]
async fn lost_connection_takes_the_lock_with_it() {
    let device = ScriptedDevice::new().on("get-route-information", ScriptedReply::Closed);
    let mut mgr = manager(&device);
    mgr.open_configuration(&ConfigRequest::new(ConfigMode::Exclusive))
        .await
        .expect("lock");

    let err = mgr
        .execute_rpc(&RpcRequest::new("get-route-information"))
        .await
        .expect_err("device hung up");
    assert_eq!(err.kind(), ErrorKind::Rpc);

    // Auto-opening operations reconnect, without the old lock.
    mgr.execute_rpc(&RpcRequest::new("get-software-information"))
        .await
        .expect("reconnected rpc");
    assert_eq!(device.connect_count(), 2);
    assert_eq!(mgr.config_state(), ConfigSessionState::Closed);
    let load = LoadRequest::lines(LoadAction::Merge, ["set system host-name r1"]);
    assert!(matches!(
        mgr.load_configuration(&load).await,
        Err(DeviceError::NotOpen)
    ));

    mgr.open_configuration(&ConfigRequest::new(ConfigMode::Exclusive))
        .await
        .expect("lock again");
    mgr.load_configuration(&load).await.expect("load");
    mgr.terminate().await;
    assert_eq!(device.count("lock-configuration"), 2);
    assert_eq!(device.count("unlock-configuration"), 1);
}

#[tokio::test]
async fn false_keyword_still_renders_its_marker() {
    let device = ScriptedDevice::new();
    let mut mgr = manager(&device);
    let request = RpcRequest::new("get-interface-information").with_kwarg("terse", false);
    mgr.execute_rpc(&request).await.expect("rpc");
    mgr.terminate().await;

    let sent = device
        .calls()
        .into_iter()
        .find(|call| call.contains("get-interface-information"))
        .expect("rpc sent");
    assert_eq!(
        sent,
        r#"<get-interface-information format="xml"><terse/></get-interface-information>"#
    );
}

#[tokio::test]
async fn ping_reports_loss_against_the_limit() {
    let device = ScriptedDevice::new().on(
        "ping",
        "<ping-results><target-host>10.0.0.2</target-host><probe-results-summary><probes-sent>5</probes-sent><responses-received>3</responses-received><packet-loss>40</packet-loss><rtt-minimum>900</rtt-minimum><rtt-maximum>1900</rtt-maximum><rtt-average>1300</rtt-average><rtt-stddev>300</rtt-stddev></probe-results-summary></ping-results>",
    );
    let recorder = SessionRecorder::default();
    let mut mgr = manager(&device).with_recorder(recorder.clone());
    let mut params = ArgMap::new();
    params.insert("host".to_string(), ArgValue::from("10.0.0.2"));
    params.insert("count".to_string(), ArgValue::from("5"));
    params.insert("rapid".to_string(), ArgValue::Bool(true));

    let strict = mgr.ping(&params, 0).await.expect("ping");
    assert!(strict.failed);
    assert_eq!(strict.msg, "Loss 40%, (Sent 5 | Received 3)");
    let lenient = mgr.ping(&params, 50).await.expect("ping");
    assert!(!lenient.failed);
    assert_eq!(lenient.packets_received.as_deref(), Some("3"));
    mgr.terminate().await;

    assert_eq!(
        device.calls()[0],
        r#"<ping format="xml"><count>5</count><host>10.0.0.2</host><rapid/></ping>"#
    );
    let outcomes: Vec<bool> = recorder
        .events()
        .expect("events")
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::RpcExecuted { rpc, success, .. } if rpc == "ping" => Some(success),
            _ => None,
        })
        .collect();
    assert_eq!(outcomes, vec![false, true]);
}

#[tokio::test]
async fn ping_that_cannot_run_is_an_error() {
    let device = ScriptedDevice::new().on(
        "ping",
        "<rpc-reply><rpc-error><error-severity>error</error-severity><error-message>syntax error, expecting &lt;host&gt;</error-message></rpc-error></rpc-reply>",
    );
    let mut mgr = manager(&device);
    let err = mgr.ping(&ArgMap::new(), 0).await.expect_err("ping");
    assert!(err.to_string().starts_with("Unable to execute ping:"));
    assert_eq!(err.kind(), ErrorKind::Rpc);
}
