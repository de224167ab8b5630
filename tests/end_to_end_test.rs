//! Full round trips over the in-process bus: two connections, a bridge on
//! each, an object server on one side and a client on the other.

use async_trait::async_trait;
use ebus_bridge::bus::{
    BusMessage, MatchRule, MemoryBus, ObjectPath, ERROR_FAILED, ERROR_UNKNOWN_OBJECT,
};
use ebus_bridge::client::BusClient;
use ebus_bridge::lifecycle::BridgeConfig;
use ebus_bridge::process::{IncomingMessage, LocalRuntime, MailboxMessage, ReplyOutcome, Term};
use ebus_bridge::server::{BusObject, MethodError, ObjectServer};
use ebus_bridge::{Bridge, OutgoingCall};
use std::sync::Arc;
use std::time::Duration;

const INTERFACE: &str = "org.example.Echo";

struct Echo;

#[async_trait]
impl BusObject for Echo {
    async fn handle_call(&mut self, call: &IncomingMessage) -> Result<Vec<Term>, MethodError> {
        match call.member() {
            Some("Echo") => Ok(call.args.clone()),
            Some("Fail") => Err(MethodError::failed("asked to fail")),
            _ => Err(MethodError::unknown_method(call)),
        }
    }
}

struct Fixture {
    runtime: LocalRuntime,
    service: Bridge,
    client: Bridge,
}

impl Fixture {
    fn new() -> Self {
        let bus = MemoryBus::new();
        let runtime = LocalRuntime::new();
        let service = Bridge::new(bus.connect(), Arc::new(runtime.clone()), BridgeConfig::default());
        let client = Bridge::new(bus.connect(), Arc::new(runtime.clone()), BridgeConfig::default());
        Self {
            runtime,
            service,
            client,
        }
    }

    fn call(&self, path: &str, member: &str) -> OutgoingCall {
        OutgoingCall::new(
            self.service.unique_name(),
            ObjectPath::parse(path).unwrap(),
            INTERFACE,
            member,
        )
    }

    fn bus_client(&self) -> BusClient {
        BusClient::new(self.client.clone(), self.runtime.spawn_process())
    }
}

#[tokio::test]
async fn test_echo_round_trip() {
    let fixture = Fixture::new();
    let mailbox = fixture.runtime.spawn_process();
    fixture
        .service
        .register(ObjectPath::parse("/echo").unwrap(), mailbox.pid(), ())
        .unwrap();
    tokio::spawn(ObjectServer::new(fixture.service.clone(), mailbox, Echo).run());

    let mut client = fixture.bus_client();
    let outcome = client
        .call(fixture.call("/echo", "Echo").with_arg("hello").with_arg(42i64))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ReplyOutcome::Return(vec![Term::from("hello"), Term::Int(42)])
    );

    let outcome = client.call(fixture.call("/echo", "Fail")).await.unwrap();
    assert_eq!(
        outcome,
        ReplyOutcome::Error {
            name: ERROR_FAILED.to_string(),
            args: vec![Term::from("asked to fail")],
        }
    );
    assert_eq!(fixture.client.pending_calls(), 0);
}

#[tokio::test]
async fn test_unregistered_path_answers_unknown_object() {
    let fixture = Fixture::new();
    let mut client = fixture.bus_client();

    let outcome = client.call(fixture.call("/nobody", "Echo")).await.unwrap();
    assert!(matches!(
        outcome,
        ReplyOutcome::Error { ref name, .. } if name == ERROR_UNKNOWN_OBJECT
    ));
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_times_out() {
    let fixture = Fixture::new();
    // Registered, but nobody ever reads this mailbox.
    let silent = fixture.runtime.spawn_process();
    fixture
        .service
        .register(ObjectPath::parse("/silent").unwrap(), silent.pid(), ())
        .unwrap();

    let mut client = fixture.bus_client();
    let call = fixture
        .call("/silent", "Echo")
        .with_timeout(Duration::from_millis(100));
    let outcome = client.call(call).await.unwrap();
    assert_eq!(outcome, ReplyOutcome::Timeout);
    assert_eq!(fixture.client.pending_calls(), 0);
}

#[tokio::test]
async fn test_server_death_unregisters_path() {
    let fixture = Fixture::new();
    let mailbox = fixture.runtime.spawn_process();
    let pid = mailbox.pid();
    let path = ObjectPath::parse("/echo").unwrap();
    fixture.service.register(path.clone(), pid, ()).unwrap();
    let server = tokio::spawn(ObjectServer::new(fixture.service.clone(), mailbox, Echo).run());

    fixture.runtime.exit(pid);
    server.await.unwrap();
    assert!(fixture.service.registered_paths().is_empty());

    let mut client = fixture.bus_client();
    let outcome = client.call(fixture.call("/echo", "Echo")).await.unwrap();
    assert!(matches!(
        outcome,
        ReplyOutcome::Error { ref name, .. } if name == ERROR_UNKNOWN_OBJECT
    ));

    // The resource is released once the dispatch loop runs the unregister callback.
    tokio::time::timeout(Duration::from_secs(1), async {
        while fixture.runtime.live_resources() > 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_delivery_order_is_preserved() {
    let fixture = Fixture::new();
    let mut mailbox = fixture.runtime.spawn_process();
    let path = ObjectPath::parse("/sink").unwrap();
    fixture
        .service
        .register(path.clone(), mailbox.pid(), ())
        .unwrap();

    for i in 0..20i32 {
        let message = BusMessage::method_call(fixture.service.unique_name(), path.clone(), INTERFACE, "Push")
            .with_arg(i)
            .with_no_reply_expected(true);
        fixture.client.send(message).unwrap();
    }

    for expected in 0..20i128 {
        match mailbox.recv_timeout(Duration::from_secs(1)).await {
            Some(MailboxMessage::Incoming(message)) => {
                assert_eq!(message.args, vec![Term::Int(expected)]);
            }
            other => panic!("Expected call {expected}, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_signal_subscription() {
    let fixture = Fixture::new();
    let mut listener = fixture.runtime.spawn_process();
    let path = ObjectPath::parse("/listener").unwrap();
    fixture
        .service
        .register(path.clone(), listener.pid(), ())
        .unwrap();
    fixture
        .service
        .subscribe(&path, MatchRule::signals().with_interface("org.example.Sensor"))
        .unwrap();

    fixture
        .client
        .emit_signal(
            ObjectPath::parse("/sensor").unwrap(),
            "org.example.Sensor",
            "Reading",
            &[Term::Float(21.5)],
        )
        .unwrap();

    match listener.recv_timeout(Duration::from_secs(1)).await {
        Some(MailboxMessage::Incoming(signal)) => {
            assert!(signal.is_signal());
            assert_eq!(signal.member(), Some("Reading"));
            assert_eq!(signal.args, vec![Term::Float(21.5)]);
        }
        other => panic!("Expected signal, got {other:?}"),
    }
}
