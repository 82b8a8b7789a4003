use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use plugtest_core::{
    RemoteError, RpcError, RpcMessage, RpcSession, SessionHooks, SessionState, StreamTransport,
    Transport, Value,
};

fn session(transport: StreamTransport) -> Arc<RpcSession<StreamTransport>> {
    Arc::new(RpcSession::new(transport))
}

/// Two started sessions talking to each other.
fn connected() -> (
    Arc<RpcSession<StreamTransport>>,
    Arc<RpcSession<StreamTransport>>,
) {
    let (a, b) = StreamTransport::pair();
    let (a, b) = (session(a), session(b));
    a.start();
    b.start();
    (a, b)
}

async fn recv_message(raw: &StreamTransport) -> RpcMessage {
    let frame = raw.recv_frame().await.expect("peer recv_frame failed");
    RpcMessage::from_value(frame).expect("peer received an invalid message")
}

async fn send_message(raw: &StreamTransport, message: RpcMessage) {
    raw.send_frame(message.into_value())
        .await
        .expect("peer send_frame failed");
}

#[tokio::test]
async fn call_round_trips_arguments_unchanged() {
    let (client, server) = connected();
    server.register("echo", |args: Vec<Value>| async move { Ok(Value::Array(args)) });

    let args = vec![
        Value::Nil,
        Value::from(true),
        Value::from(-7),
        Value::from(u64::MAX),
        Value::F64(1.5),
        Value::from("text"),
        Value::Binary(vec![0, 1, 2, 255]),
        Value::Array(vec![Value::from(1), Value::Array(vec![])]),
        Value::Map(vec![(Value::from("k"), Value::from("v"))]),
    ];
    let echoed = client.call("echo", args.clone()).await.expect("call failed");
    assert_eq!(echoed, Value::Array(args));
}

#[tokio::test]
async fn responses_are_matched_by_id_not_arrival_order() {
    const N: usize = 8;
    let (client, raw) = StreamTransport::pair();
    let client = session(client);
    client.start();

    let calls: Vec<_> = (0..N)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.call("work", vec![Value::from(i)]).await })
        })
        .collect();

    let mut requests = Vec::new();
    for _ in 0..N {
        match recv_message(&raw).await {
            RpcMessage::Call { id, params, .. } => requests.push((id, params[0].clone())),
            other => panic!("expected call, got {other:?}"),
        }
    }
    assert_eq!(client.pending_ids().len(), N);

    requests.sort_by_key(|(id, _)| std::cmp::Reverse(*id));
    for (id, arg) in requests {
        send_message(
            &raw,
            RpcMessage::Response {
                id,
                result: Ok(Value::Array(vec![Value::from("done"), arg])),
            },
        )
        .await;
    }

    for (i, call) in calls.into_iter().enumerate() {
        let result = call.await.expect("join failed").expect("call failed");
        assert_eq!(
            result,
            Value::Array(vec![Value::from("done"), Value::from(i)])
        );
    }
    assert!(client.pending_ids().is_empty());
}

#[tokio::test]
async fn remote_errors_keep_kind_and_message() {
    let (client, server) = connected();
    server.register("fail", |_| async {
        Err::<Value, _>(RpcError::Remote(RemoteError::new("TypeError", "nope")))
    });

    let err = client.call("fail", vec![]).await.unwrap_err();
    match err {
        RpcError::Remote(remote) => {
            assert_eq!(remote.kind, "TypeError");
            assert_eq!(remote.message, "nope");
        }
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_method_yields_error_response_naming_it() {
    let (client, _server) = connected();
    let err = client.call("no_such_method", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::Remote(_)), "{err:?}");
    assert!(err.to_string().contains("unknown method 'no_such_method'"), "{err}");
}

#[tokio::test]
async fn unknown_notify_is_dropped_silently() {
    let (client, raw) = StreamTransport::pair();
    let client = session(client);
    client.register("ping", |_| async { Ok(Value::from("pong")) });
    client.start();

    send_message(
        &raw,
        RpcMessage::Notify {
            method: "nobody_home".into(),
            params: vec![],
        },
    )
    .await;
    send_message(
        &raw,
        RpcMessage::Call {
            id: 1,
            method: "ping".into(),
            params: vec![],
        },
    )
    .await;

    // the only reply is the one for the call
    assert_eq!(
        recv_message(&raw).await,
        RpcMessage::Response {
            id: 1,
            result: Ok(Value::from("pong")),
        }
    );
}

#[tokio::test]
async fn notify_reaches_handler() {
    let (client, server) = connected();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    server.register("log", move |args: Vec<Value>| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(args);
            Ok(Value::Nil)
        }
    });

    client
        .notify("log", vec![Value::from("hello")])
        .await
        .expect("notify failed");
    let args = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("notify never arrived")
        .expect("channel closed");
    assert_eq!(args, vec![Value::from("hello")]);
}

#[tokio::test]
async fn handler_panic_becomes_error_response() {
    let (client, server) = connected();
    server.register("explode", |_| async {
        if true {
            panic!("kaboom");
        }
        Ok(Value::Nil)
    });

    let err = client.call("explode", vec![]).await.unwrap_err();
    match err {
        RpcError::Remote(remote) => {
            assert_eq!(remote.kind, "Panic");
            assert!(remote.message.contains("kaboom"));
        }
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn handler_may_call_back_into_the_peer() {
    let (client, server) = connected();
    client.register("inner", |_| async { Ok(Value::from(41)) });

    let server_for_handler = Arc::downgrade(&server);
    server.register("outer", move |_| {
        let server = server_for_handler.clone();
        async move {
            let server = server.upgrade().ok_or(RpcError::SessionClosed)?;
            let inner = server.call("inner", vec![]).await?;
            Ok(Value::from(inner.as_i64().unwrap_or_default() + 1))
        }
    });

    let result = client.call("outer", vec![]).await.expect("call failed");
    assert_eq!(result, Value::from(42));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handler_may_register_handlers_before_returning() {
    let (client, server) = connected();
    let registrar = Arc::downgrade(&server);
    server.register("outer", move |_| {
        if let Some(server) = registrar.upgrade() {
            server.register("inner", |_| async { Ok(Value::from("inner")) });
        }
        async { Ok(Value::from("outer")) }
    });
    let replacer = Arc::downgrade(&server);
    server.register("reset", move |_| {
        if let Some(server) = replacer.upgrade() {
            server.set_dispatcher(plugtest_core::DispatchTable::new());
        }
        async { Ok(Value::Nil) }
    });

    let outer = tokio::time::timeout(Duration::from_secs(5), client.call("outer", vec![]))
        .await
        .expect("call to a registering handler hung")
        .expect("call failed");
    assert_eq!(outer, Value::from("outer"));
    let inner = client.call("inner", vec![]).await.expect("call failed");
    assert_eq!(inner, Value::from("inner"));

    client.notify("reset", vec![]).await.expect("notify failed");
    let dropped = tokio::time::timeout(Duration::from_secs(5), async {
        while client.call("inner", vec![]).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(dropped.is_ok(), "notify handler replacing the dispatcher hung");
}

#[tokio::test]
async fn invalid_messages_are_reported_and_reading_continues() {
    let (client, raw) = StreamTransport::pair();
    let invalid = Arc::new(Mutex::new(Vec::new()));
    let unexpected = Arc::new(AtomicUsize::new(0));
    let hooks = SessionHooks {
        on_invalid_message: {
            let invalid = invalid.clone();
            Arc::new(move |message: &Value| invalid.lock().push(message.clone()))
        },
        on_message_error: {
            let unexpected = unexpected.clone();
            Arc::new(move |error: &RpcError, _: &RpcMessage| {
                assert!(matches!(error, RpcError::UnexpectedResponse(999)));
                unexpected.fetch_add(1, Ordering::SeqCst);
            })
        },
    };
    let client = Arc::new(RpcSession::new(client).with_hooks(hooks));
    client.start();

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.call("m", vec![]).await })
    };
    let id = match recv_message(&raw).await {
        RpcMessage::Call { id, .. } => id,
        other => panic!("expected call, got {other:?}"),
    };

    raw.send_frame(Value::from("garbage")).await.unwrap();
    send_message(
        &raw,
        RpcMessage::Response {
            id: 999,
            result: Ok(Value::Nil),
        },
    )
    .await;
    send_message(
        &raw,
        RpcMessage::Response {
            id,
            result: Ok(Value::from("still alive")),
        },
    )
    .await;

    let result = call.await.unwrap().expect("call failed");
    assert_eq!(result, Value::from("still alive"));
    assert_eq!(*invalid.lock(), vec![Value::from("garbage")]);
    assert_eq!(unexpected.load(Ordering::SeqCst), 1);
    assert_eq!(client.state(), SessionState::Running);
}

#[tokio::test]
async fn peer_eof_fails_pending_calls_with_session_closed() {
    let (client, raw) = StreamTransport::pair();
    let client = session(client);
    client.start();

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.call("never_answered", vec![]).await })
    };
    let _ = recv_message(&raw).await;
    drop(raw);

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, RpcError::SessionClosed), "{err:?}");
    client.closed().await;
    assert_eq!(client.state(), SessionState::Closed);
    assert!(matches!(
        client.call("after_close", vec![]).await,
        Err(RpcError::SessionClosed)
    ));
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_calls() {
    let (client, server) = connected();
    server.register("slow", |_| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(Value::from("finished"))
    });

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.call("slow", vec![]).await })
    };
    while client.pending_ids().is_empty() {
        tokio::task::yield_now().await;
    }
    client.shutdown().await;

    assert_eq!(call.await.unwrap().unwrap(), Value::from("finished"));
    assert_eq!(client.state(), SessionState::Closed);
    server.closed().await;
}

#[tokio::test]
async fn shutdown_fails_calls_still_pending_after_grace() {
    let (client, raw) = StreamTransport::pair();
    let client =
        Arc::new(RpcSession::new(client).with_shutdown_grace(Duration::from_millis(20)));
    client.start();

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.call("hangs", vec![]).await })
    };
    let _ = recv_message(&raw).await;

    client.shutdown().await;
    assert!(matches!(
        call.await.unwrap(),
        Err(RpcError::SessionClosed)
    ));
    assert!(matches!(raw.recv_frame().await, Err(plugtest_core::TransportError::Closed)));
}

#[tokio::test]
async fn shutdown_twice_is_a_no_op() {
    let (client, server) = connected();
    client.shutdown().await;
    client.shutdown().await;
    assert_eq!(client.state(), SessionState::Closed);
    assert!(client.pending_ids().is_empty());

    server.closed().await;
    assert_eq!(server.state(), SessionState::Closed);
    server.shutdown().await;
}

#[tokio::test]
async fn concurrent_shutdowns_both_return_after_close() {
    let (client, _server) = connected();
    tokio::join!(client.shutdown(), client.shutdown());
    assert_eq!(client.state(), SessionState::Closed);
}
