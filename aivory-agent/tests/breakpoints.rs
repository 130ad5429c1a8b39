// Copyright 2024-Present AIVory, Inc. https://www.aivory.net/
// SPDX-License-Identifier: Apache-2.0

mod common;

use aivory_agent::{
    record_line, AgentConfig, BackendConnection, FrameContext, FrameGuard, Inspect, TraceManager,
};
use common::{test_settings, TestBackend};
use std::sync::Arc;

// This binary exercises the process-wide line hook, so everything lives in
// one test.
#[tokio::test]
async fn test_conditional_breakpoint_over_the_wire() {
    let backend = TestBackend::bind().await;
    let config = Arc::new(AgentConfig::from_settings(&test_settings(&backend.url())).unwrap());
    let connection = BackendConnection::new(Arc::clone(&config));
    let manager = TraceManager::new(Arc::clone(&config), connection.clone());
    connection.connect();

    let mut session = backend.accept().await;
    session.expect_register().await;
    session.send_registered().await;
    common::wait_until_connected(&connection).await;

    manager.enable();
    manager.set_breakpoint("bp-loop", "/app/src/worker.rs", 10, Some("i == 3"), 5);

    // Instrumented loop body: line 10 executes once per iteration, but the
    // condition only passes for i == 3.
    let run_loop = || {
        let _frame = FrameGuard::enter("process_batch", None, "/app/src/worker.rs");
        for i in 0..10i64 {
            let locals: [(&str, &dyn Inspect); 1] = [("i", &i)];
            record_line(&FrameContext {
                method_name: "process_batch",
                class_name: None,
                file_path: "/app/src/worker.rs",
                line_number: 10,
                locals: &locals,
            });
        }
    };
    tokio::task::spawn_blocking(run_loop).await.unwrap();

    let frame = session.recv_frame_of_type("breakpoint_hit").await;
    let payload = &frame["payload"];
    assert_eq!(payload["breakpoint_id"], "bp-loop");
    assert_eq!(payload["agent_id"], config.agent_id.as_str());
    assert_eq!(payload["file_path"], "/app/src/worker.rs");
    assert_eq!(payload["line_number"], 10);
    assert_eq!(payload["hit_count"], 1);
    assert_eq!(payload["local_variables"]["i"]["value"], "3");
    assert_eq!(payload["stack_trace"][0]["method_name"], "process_batch");
    assert_eq!(payload["stack_trace"][0]["line_number"], 10);
    assert!(payload["captured_at"].as_str().unwrap().ends_with('Z'));
    assert_eq!(manager.breakpoint("bp-loop").unwrap().hit_count(), 1);

    // A crossing reported without a frame guard still produces a one-frame
    // chain synthesized from the line event itself.
    manager.set_breakpoint("bp-bare", "/app/src/bare.rs", 4, None, 1);
    tokio::task::spawn_blocking(|| {
        let flag = true;
        let locals: [(&str, &dyn Inspect); 1] = [("flag", &flag)];
        record_line(&FrameContext {
            method_name: "tick",
            class_name: Some("Clock"),
            file_path: "/app/src/bare.rs",
            line_number: 4,
            locals: &locals,
        });
    })
    .await
    .unwrap();

    let frame = session.recv_frame_of_type("breakpoint_hit").await;
    let payload = &frame["payload"];
    assert_eq!(payload["breakpoint_id"], "bp-bare");
    assert_eq!(payload["stack_trace"][0]["method_name"], "tick");
    assert_eq!(payload["stack_trace"][0]["class_name"], "Clock");
    assert_eq!(payload["local_variables"]["flag"]["value"], "true");

    // Disabling clears the registry and restores the hook.
    manager.disable();
    assert!(manager.breakpoint("bp-loop").is_none());

    connection.disconnect();
}
