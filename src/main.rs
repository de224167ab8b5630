//! # ebus-demo
//!
//! Serves an echo object on one connection of an in-process bus and calls it
//! from a process on a second connection:
//!
//! 1. Set up tracing and configuration.
//! 2. Register `/com/example/Echo` and run an [`ObjectServer`] for it.
//! 3. Call `Echo` and `Fail` through a [`BusClient`] and print the outcomes.
//! 4. Shut both bridges down.

use async_trait::async_trait;
use ebus_bridge::bus::{MemoryBus, ObjectPath};
use ebus_bridge::client::BusClient;
use ebus_bridge::lifecycle::{setup_tracing, BridgeConfig};
use ebus_bridge::process::{IncomingMessage, LocalRuntime, ReplyOutcome, Term};
use ebus_bridge::server::{BusObject, MethodError, ObjectServer};
use ebus_bridge::{Bridge, OutgoingCall};
use std::error::Error;
use std::sync::Arc;
use tracing::{info, Instrument};

const INTERFACE: &str = "com.example.Echo";

struct Echo {
    calls: u64,
}

#[async_trait]
impl BusObject for Echo {
    async fn handle_call(&mut self, call: &IncomingMessage) -> Result<Vec<Term>, MethodError> {
        self.calls += 1;
        match call.member() {
            Some("Echo") => Ok(call.args.clone()),
            Some("Fail") => Err(MethodError::failed("asked to fail")),
            _ => Err(MethodError::unknown_method(call)),
        }
    }
}

fn describe(outcome: &ReplyOutcome) -> String {
    match outcome {
        ReplyOutcome::Return(values) => {
            let values: Vec<_> = values.iter().map(Term::to_string).collect();
            format!("returned ({})", values.join(", "))
        }
        ReplyOutcome::Error { name, args } => match args.first() {
            Some(text) => format!("failed with {name}: {text}"),
            None => format!("failed with {name}"),
        },
        ReplyOutcome::Timeout => "timed out".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing();
    let config = BridgeConfig::from_env();
    info!(?config, "Starting demo");

    let bus = MemoryBus::new();
    let runtime = LocalRuntime::new();

    // Service side
    let service: Bridge = Bridge::new(bus.connect(), Arc::new(runtime.clone()), config.clone());
    let path = ObjectPath::parse("/com/example/Echo")?;
    let mailbox = runtime.spawn_process();
    let server_pid = mailbox.pid();
    service.register(path.clone(), server_pid, ())?;
    let server = tokio::spawn(
        ObjectServer::new(service.clone(), mailbox, Echo { calls: 0 })
            .run()
            .instrument(tracing::info_span!("echo_server")),
    );

    // Client side
    let client_bridge: Bridge = Bridge::new(bus.connect(), Arc::new(runtime.clone()), config);
    let mut client = BusClient::new(client_bridge.clone(), runtime.spawn_process());
    let destination = service.unique_name();

    let echo = OutgoingCall::new(destination.as_str(), path.clone(), INTERFACE, "Echo")
        .with_arg("hello")
        .with_arg(42i64);
    let outcome = client.call(echo).await?;
    println!("Echo {}", describe(&outcome));

    let fail = OutgoingCall::new(destination.as_str(), path, INTERFACE, "Fail");
    let outcome = client.call(fail).await?;
    println!("Fail {}", describe(&outcome));

    // Shutdown: ending the server process unregisters its path.
    runtime.exit(server_pid);
    let (echo, _mailbox) = server.await?;
    info!(calls = echo.calls, "Echo server stopped");

    client_bridge.close();
    service.close();
    info!("Demo completed");
    Ok(())
}
