//! End-to-end tests over real loopback sockets

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Once;
use std::time::{Duration, Instant};

use culvert::nodes::{BridgeConfig, TcpConnectorConfig, TcpListenerConfig};
use culvert::{BuildError, Engine, EngineConfig, NodeRegistry, NodeSettings, NodeSpec};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Echoes every byte back until the peer closes
fn spawn_echo_server() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            std::thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// A loopback port with nothing listening on it
fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn forwarding_engine(target: &str, target_port: u16) -> Engine {
    let mut listener = TcpListenerConfig::new("127.0.0.1", 0);
    listener.nodelay(true);
    let specs = vec![
        NodeSpec::new("input", "TcpListener", NodeSettings::TcpListener(listener))
            .with_next("output"),
        NodeSpec::new(
            "output",
            "TcpConnector",
            NodeSettings::TcpConnector(TcpConnectorConfig::to_host(target, target_port)),
        ),
    ];
    let mut config = EngineConfig::new(specs);
    config.workers(2);
    Engine::start(config, &NodeRegistry::builtin()).unwrap()
}

fn total_in_flight(engine: &Engine) -> u64 {
    (0..engine.worker_count())
        .map(|wid| {
            engine
                .with_worker(wid, |ctx| ctx.buffer_pool().borrow().in_flight())
                .unwrap_or(0)
        })
        .sum()
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn echo_roundtrip_through_the_chain() {
    init_tracing();
    let echo = spawn_echo_server();
    let engine = forwarding_engine(&echo.ip().to_string(), echo.port());
    let addr = engine.local_addrs()[0];

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client.write_all(b"hello through the tunnel").unwrap();

    let mut response = [0u8; 24];
    client.read_exact(&mut response).unwrap();
    assert_eq!(&response, b"hello through the tunnel");

    // a second exchange proves the pause/resume machinery left the line usable
    client.write_all(b"again").unwrap();
    let mut response = [0u8; 5];
    client.read_exact(&mut response).unwrap();
    assert_eq!(&response, b"again");

    drop(client);
    assert!(
        wait_until(Duration::from_secs(5), || total_in_flight(&engine) == 0),
        "buffers leaked after teardown"
    );
    engine.shutdown();
}

#[test]
fn domain_destinations_resolve_asynchronously() {
    init_tracing();
    let echo = spawn_echo_server();
    let engine = forwarding_engine("localhost", echo.port());
    let addr = engine.local_addrs()[0];

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    // written before the resolve + connect completes; must queue, not drop
    client.write_all(b"early").unwrap();
    let mut response = [0u8; 5];
    client.read_exact(&mut response).unwrap();
    assert_eq!(&response, b"early");

    engine.shutdown();
}

#[test]
fn connect_failure_closes_the_client_and_leaks_nothing() {
    init_tracing();
    let engine = forwarding_engine("127.0.0.1", closed_port());
    let addr = engine.local_addrs()[0];

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let _ = client.write_all(b"ping");

    // the connector's dial fails, finish propagates back, the client closes
    let mut buf = [0u8; 16];
    match client.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected {n} bytes from a dead chain"),
        Err(_) => {} // reset is fine too
    }
    assert!(
        wait_until(Duration::from_secs(5), || total_in_flight(&engine) == 0),
        "buffers leaked after failed connect"
    );
    engine.shutdown();
}

#[test]
fn whitelist_rejects_unlisted_peers() {
    init_tracing();
    let echo = spawn_echo_server();
    let mut listener = TcpListenerConfig::new("127.0.0.1", 0);
    listener.whitelist(vec!["10.0.0.0/8".parse().unwrap()]);
    let specs = vec![
        NodeSpec::new("input", "TcpListener", NodeSettings::TcpListener(listener))
            .with_next("output"),
        NodeSpec::new(
            "output",
            "TcpConnector",
            NodeSettings::TcpConnector(TcpConnectorConfig::to_host(
                &echo.ip().to_string(),
                echo.port(),
            )),
        ),
    ];
    let mut config = EngineConfig::new(specs);
    config.workers(1);
    let engine = Engine::start(config, &NodeRegistry::builtin()).unwrap();
    let addr = engine.local_addrs()[0];

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let _ = client.write_all(b"hi");
    let mut buf = [0u8; 4];
    match client.read(&mut buf) {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("whitelisted-out peer got {n} bytes"),
    }
    engine.shutdown();
}

#[test]
fn bridged_chains_fuse_and_forward() {
    init_tracing();
    let echo = spawn_echo_server();
    let mut listener = TcpListenerConfig::new("127.0.0.1", 0);
    listener.nodelay(true);
    let specs = vec![
        NodeSpec::new("input", "TcpListener", NodeSettings::TcpListener(listener))
            .with_next("left-end"),
        NodeSpec::new(
            "left-end",
            "Bridge",
            NodeSettings::Bridge(BridgeConfig::new("crossing")),
        ),
        NodeSpec::new(
            "right-end",
            "Bridge",
            NodeSettings::Bridge(BridgeConfig::new("crossing")),
        )
        .with_next("output"),
        NodeSpec::new(
            "output",
            "TcpConnector",
            NodeSettings::TcpConnector(TcpConnectorConfig::to_host(
                &echo.ip().to_string(),
                echo.port(),
            )),
        ),
    ];
    let mut config = EngineConfig::new(specs);
    config.workers(1);
    let engine = Engine::start(config, &NodeRegistry::builtin()).unwrap();
    let addr = engine.local_addrs()[0];

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client.write_all(b"across the bridge").unwrap();
    let mut response = [0u8; 17];
    client.read_exact(&mut response).unwrap();
    assert_eq!(&response, b"across the bridge");

    engine.shutdown();
}

#[test]
fn build_errors_are_fatal_and_typed() {
    init_tracing();
    let specs = vec![NodeSpec::new(
        "mystery",
        "QuantumTunnel",
        NodeSettings::Bridge(BridgeConfig::new("x")),
    )];
    match Engine::start(EngineConfig::new(specs), &NodeRegistry::builtin()) {
        Err(BuildError::UnknownNodeType(kind)) => assert_eq!(kind, "QuantumTunnel"),
        Err(other) => panic!("expected UnknownNodeType, got {other:?}"),
        Ok(_) => panic!("expected UnknownNodeType, got a running engine"),
    }

    let specs = vec![
        NodeSpec::new(
            "input",
            "TcpListener",
            NodeSettings::TcpListener(TcpListenerConfig::new("127.0.0.1", 0)),
        )
        .with_next("lonely"),
        NodeSpec::new(
            "lonely",
            "Bridge",
            NodeSettings::Bridge(BridgeConfig::new("unmatched")),
        ),
    ];
    match Engine::start(EngineConfig::new(specs), &NodeRegistry::builtin()) {
        Err(BuildError::UnpairedBridge(pair)) => assert_eq!(pair, "unmatched"),
        Err(other) => panic!("expected UnpairedBridge, got {other:?}"),
        Ok(_) => panic!("expected UnpairedBridge, got a running engine"),
    }

    let specs = vec![
        NodeSpec::new(
            "a",
            "Bridge",
            NodeSettings::Bridge(BridgeConfig::new("loop")),
        )
        .with_next("b"),
        NodeSpec::new(
            "b",
            "Bridge",
            NodeSettings::Bridge(BridgeConfig::new("loop")),
        )
        .with_next("a"),
    ];
    match Engine::start(EngineConfig::new(specs), &NodeRegistry::builtin()) {
        Err(BuildError::GraphCycle(_)) => {}
        Err(other) => panic!("expected GraphCycle, got {other:?}"),
        Ok(_) => panic!("expected GraphCycle, got a running engine"),
    }
}
