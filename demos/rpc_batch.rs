//! Runs an RPC batch against a scripted device, so no hardware is needed.

use rjunos::options::{ArgMap, ArgValue, RpcFormat};
use rjunos::session::{ConnectionManager, ConnectionParams, RpcBatch, SessionRecorder};
use rjunos::transport::ScriptedDevice;
use std::error::Error;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let device = ScriptedDevice::new()
        .on(
            "get-software-information",
            "<software-information><host-name>lab-mx1</host-name><product-model>mx204</product-model><junos-version>23.4R1.9</junos-version></software-information>",
        )
        .on(
            "get-interface-information",
            "<interface-information><physical-interface><name>ge-0/0/0</name><oper-status>up</oper-status></physical-interface></interface-information>",
        );

    let recorder = SessionRecorder::default();
    let mut manager = ConnectionManager::with_connector(
        ConnectionParams::new("lab-mx1", "admin"),
        Arc::new(device.clone()),
    )
    .with_recorder(recorder.clone());

    let mut terse = ArgMap::new();
    terse.insert("terse".to_string(), ArgValue::Bool(true));
    terse.insert("interface_name".to_string(), ArgValue::from("ge-0/0/0"));

    let batch = RpcBatch {
        formats: vec![RpcFormat::Xml, RpcFormat::Text],
        kwargs: Some(vec![ArgMap::new(), terse]),
        ..RpcBatch::new(["get_software_information", "get-interface-information"])
    };

    let result = manager.execute_batch(&batch, None).await;
    let result = manager.finish(result).await?;
    for rpc in &result.results {
        println!("== {} ({}) failed={} msg={}", rpc.rpc, rpc.format, rpc.failed, rpc.msg);
        println!("{}", rpc.text);
    }

    println!("-- sent --");
    for call in device.calls() {
        println!("{call}");
    }
    println!("-- recording --");
    println!("{}", recorder.to_jsonl()?);
    Ok(())
}
