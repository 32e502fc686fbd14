use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

use memc_client::{
    adapter, Client, ClientConfig, Connection, Decoder, ErrorKind, Item, McResult, ReconnectConfig, Reply,
    Stats, StatsCategory, StoreOptions, Value,
};

/// What the scripted server does after reading one command.
#[derive(Clone)]
enum Action {
    Reply(Vec<u8>),
    Delay(Duration, Vec<u8>),
    /// Writes the reply one byte at a time.
    Trickle(Vec<u8>),
    Silent,
    Hangup,
}

fn reply(bytes: &[u8]) -> Action {
    Action::Reply(bytes.to_vec())
}

type Handler = Arc<dyn Fn(&str) -> Action + Send + Sync>;

struct MockServer {
    addr: String,
    commands: Arc<Mutex<Vec<String>>>,
    accepted: Arc<AtomicUsize>,
}

impl MockServer {
    async fn start(handler: impl Fn(&str) -> Action + Send + Sync + 'static) -> Self {
        MockServer::start_with_greeting(None, handler).await
    }

    /// The first accepted connection receives `greeting` before any command.
    async fn start_with_greeting(
        greeting: Option<Vec<u8>>,
        handler: impl Fn(&str) -> Action + Send + Sync + 'static,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let commands: Arc<Mutex<Vec<String>>> = Arc::default();
        let accepted: Arc<AtomicUsize> = Arc::default();
        let handler: Handler = Arc::new(handler);

        let server_commands = Arc::clone(&commands);
        let server_accepted = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let index = server_accepted.fetch_add(1, Ordering::SeqCst);
                let greeting = if index == 0 { greeting.clone() } else { None };
                tokio::spawn(serve(
                    stream,
                    greeting,
                    Arc::clone(&handler),
                    Arc::clone(&server_commands),
                ));
            }
        });

        MockServer {
            addr,
            commands,
            accepted,
        }
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

async fn serve(
    stream: TcpStream,
    greeting: Option<Vec<u8>>,
    handler: Handler,
    commands: Arc<Mutex<Vec<String>>>,
) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    if let Some(greeting) = greeting {
        let _ = write.write_all(&greeting).await;
    }

    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let command = line.trim_end_matches("\r\n").to_string();

        let mut record = command.clone();
        if let Some(len) = data_length(&command) {
            let mut data = vec![0u8; len + 2];
            if reader.read_exact(&mut data).await.is_err() {
                return;
            }
            record.push_str(" | ");
            record.push_str(&String::from_utf8_lossy(&data[..len]));
        }
        commands.lock().unwrap().push(record);

        let written = match handler(&command) {
            Action::Reply(bytes) => write.write_all(&bytes).await,
            Action::Delay(delay, bytes) => {
                sleep(delay).await;
                write.write_all(&bytes).await
            }
            Action::Trickle(bytes) => {
                let mut result = Ok(());
                for byte in bytes {
                    result = write.write_all(&[byte]).await;
                    if result.is_err() {
                        break;
                    }
                    sleep(Duration::from_millis(1)).await;
                }
                result
            }
            Action::Silent => Ok(()),
            Action::Hangup => return,
        };
        if written.is_err() {
            return;
        }
    }
}

/// Payload length of storage commands, which carry a data block.
fn data_length(command: &str) -> Option<usize> {
    let parts: Vec<&str> = command.split(' ').collect();
    match parts.first() {
        Some(&"set" | &"add" | &"replace" | &"append" | &"prepend" | &"cas") => parts.get(4)?.parse().ok(),
        _ => None,
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config_for(addrs: &[&str]) -> ClientConfig {
    let mut config = ClientConfig::with_servers(addrs.iter().copied());
    config.reconnect = ReconnectConfig {
        floor_ms: 5,
        ceiling_ms: 50,
    };
    config
}

async fn connected_client(addrs: &[&str]) -> Client {
    init_tracing();
    let client = Client::new(config_for(addrs)).expect("client");
    within(client.connect()).await.expect("connect");
    client
}

async fn within<F: std::future::Future>(future: F) -> F::Output {
    timeout(Duration::from_secs(5), future).await.expect("timed out")
}

async fn wait_until(condition: impl Fn() -> bool) {
    within(async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}

fn raw_item(flags: u32, data: &'static [u8]) -> Value {
    Value::Raw(Item {
        flags,
        size: data.len(),
        data: Bytes::from_static(data),
    })
}

#[tokio::test]
async fn set_then_get_roundtrip() {
    let server = MockServer::start(|command| match command {
        "set k 0 0 1" => reply(b"STORED\r\n"),
        "get k" => reply(b"VALUE k 0 1\r\nv\r\nEND\r\n"),
        _ => reply(b"ERROR\r\n"),
    })
    .await;
    let client = connected_client(&[&server.addr]).await;

    let stored = within(client.set("k", "v", StoreOptions::default())).await;
    assert_eq!(stored, Ok("STORED".to_string()));

    let values = within(client.get("k")).await.expect("get");
    assert_eq!(values.len(), 1);
    assert_eq!(values["k"].value, raw_item(0, b"v"));
    assert_eq!(values["k"].cas, None);

    assert_eq!(server.commands(), vec!["set k 0 0 1 | v", "get k"]);
    client.close();
}

#[tokio::test]
async fn get_missing_key_is_not_found() {
    let server = MockServer::start(|_| reply(b"END\r\n")).await;
    let client = connected_client(&[&server.addr]).await;

    let err = within(client.get("missing")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn incr_on_non_numeric_value_reports_client_error() {
    let server = MockServer::start(|command| match command {
        "incr ctr 5" => reply(b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n"),
        "decr ctr 1" => reply(b"4\r\n"),
        _ => reply(b"ERROR\r\n"),
    })
    .await;
    let client = connected_client(&[&server.addr]).await;

    let err = within(client.incr("ctr", 5)).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ClientError);
    assert_eq!(err.description, "cannot increment or decrement non-numeric value");

    assert_eq!(within(client.decr("ctr", 1)).await, Ok(4));
}

#[tokio::test]
async fn multi_get_waits_for_every_server_and_merges() {
    let first = MockServer::start(|command| match command {
        "get a" => reply(b"VALUE a 0 1\r\n1\r\nEND\r\n"),
        _ => reply(b"ERROR\r\n"),
    })
    .await;
    let second = MockServer::start(|command| match command {
        "get b" => Action::Delay(Duration::from_millis(100), b"VALUE b 0 1\r\n2\r\nEND\r\n".to_vec()),
        _ => reply(b"ERROR\r\n"),
    })
    .await;

    init_tracing();
    let client = Client::new(config_for(&[&first.addr, &second.addr]))
        .expect("client")
        .with_adapter(adapter::string())
        .with_strategy(Arc::new(|key: &str, _: usize| if key == "a" { 0 } else { 1 }));
    within(client.connect()).await.expect("connect");

    let started = Instant::now();
    let values = within(client.get_multi(&["a", "b"])).await.expect("multi get");
    assert!(started.elapsed() >= Duration::from_millis(100));

    assert_eq!(values.len(), 2);
    assert_eq!(values["a"].value, Value::Text("1".to_string()));
    assert_eq!(values["b"].value, Value::Text("2".to_string()));
    assert_eq!(first.commands(), vec!["get a"]);
    assert_eq!(second.commands(), vec!["get b"]);
}

#[tokio::test]
async fn multi_get_sends_one_command_per_bucket() {
    let first = MockServer::start(|command| match command {
        "gets a c" => reply(b"VALUE a 0 1 7\r\n1\r\nEND\r\n"),
        _ => reply(b"ERROR\r\n"),
    })
    .await;
    let second = MockServer::start(|_| reply(b"END\r\n")).await;

    init_tracing();
    let client = Client::new(config_for(&[&first.addr, &second.addr]))
        .expect("client")
        .with_strategy(Arc::new(|key: &str, _: usize| if key == "b" { 1 } else { 0 }));
    within(client.connect()).await.expect("connect");

    let values = within(client.gets_multi(&["a", "b", "c"])).await.expect("gets");
    assert_eq!(values.len(), 1);
    assert_eq!(values["a"].cas, Some(7));
    assert_eq!(first.commands(), vec!["gets a c"]);
    assert_eq!(second.commands(), vec!["gets b"]);

    // No bucket has a hit.
    let err = within(client.get_multi(&["b"])).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn lost_connection_fails_outstanding_requests_in_order() {
    init_tracing();
    let server = MockServer::start(|command| match command {
        "get c" => Action::Hangup,
        _ => Action::Silent,
    })
    .await;

    let connection = Connection::spawn(server.addr.clone(), &ReconnectConfig::default(), true);
    within(connection.open()).await.expect("worker").expect("open");

    let log: Arc<Mutex<Vec<(usize, McResult<Reply>)>>> = Arc::default();
    for (id, key) in ["a", "b", "c"].into_iter().enumerate() {
        let log = Arc::clone(&log);
        connection.write(
            Decoder::Retrieval(adapter::raw()),
            Box::new(move |outcome| log.lock().unwrap().push((id, outcome))),
            &format!("get {}", key),
            None,
        );
    }

    wait_until(|| log.lock().unwrap().len() == 3).await;
    let log = log.lock().unwrap();
    let ids: Vec<usize> = log.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, vec![0, 1, 2]);
    for (_, outcome) in log.iter() {
        assert_eq!(outcome.as_ref().unwrap_err().kind, ErrorKind::ConnectionError);
    }
    connection.close();
}

#[tokio::test]
async fn long_keys_are_rejected_before_writing() {
    let server = MockServer::start(|_| reply(b"STORED\r\n")).await;
    let client = connected_client(&[&server.addr]).await;

    let key = "k".repeat(251);
    let err = within(client.set(&key, "v", StoreOptions::default())).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ClientError);

    let key = "k".repeat(250);
    assert!(within(client.add(&key, "v", StoreOptions::default())).await.is_ok());
    assert_eq!(server.commands().len(), 1);
}

#[tokio::test]
async fn requests_before_connect_fail_immediately() {
    init_tracing();
    let server = MockServer::start(|_| reply(b"STORED\r\n")).await;
    let client = Client::new(config_for(&[&server.addr])).expect("client");

    let err = within(client.del("k")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ConnectionError);
    assert!(server.commands().is_empty());
}

#[tokio::test]
async fn close_fails_pending_and_never_reconnects() {
    let server = MockServer::start(|command| match command {
        "get slow" => Action::Silent,
        _ => reply(b"END\r\n"),
    })
    .await;
    let client = connected_client(&[&server.addr]).await;

    let (pending, ()) = tokio::join!(client.get("slow"), async {
        sleep(Duration::from_millis(50)).await;
        client.close();
    });
    assert_eq!(pending.unwrap_err().kind, ErrorKind::ConnectionError);

    let err = within(client.get("other")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ConnectionError);
    assert!(within(client.connect()).await.is_err());

    sleep(Duration::from_millis(100)).await;
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn reconnects_after_server_drops_connection() {
    let server = MockServer::start(|command| match command {
        "get boom" => Action::Hangup,
        "get k" => reply(b"VALUE k 0 2\r\nok\r\nEND\r\n"),
        _ => reply(b"ERROR\r\n"),
    })
    .await;
    let client = connected_client(&[&server.addr]).await;

    let err = within(client.get("boom")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ConnectionError);

    wait_until(|| server.accepted() == 2).await;
    // The new socket may still be finishing its handshake on our side.
    let values = within(async {
        loop {
            match client.get("k").await {
                Err(err) if err.kind == ErrorKind::ConnectionError => {
                    sleep(Duration::from_millis(5)).await
                }
                other => break other,
            }
        }
    })
    .await
    .expect("get after reconnect");
    assert_eq!(values["k"].value, raw_item(0, b"ok"));
}

#[tokio::test]
async fn unsolicited_bytes_force_a_restart() {
    let server = MockServer::start_with_greeting(Some(b"STORED\r\n".to_vec()), |_| reply(b"DELETED\r\n")).await;
    let client = connected_client(&[&server.addr]).await;

    wait_until(|| server.accepted() >= 2).await;
    let deleted = within(async {
        loop {
            match client.del("k").await {
                Err(err) if err.kind == ErrorKind::ConnectionError => {
                    sleep(Duration::from_millis(5)).await
                }
                other => break other,
            }
        }
    })
    .await;
    assert_eq!(deleted, Ok("DELETED".to_string()));
}

#[tokio::test]
async fn fragmented_responses_decode_normally() {
    let server = MockServer::start(|command| match command {
        "get big" => Action::Trickle(b"VALUE big 5 10\r\n0123456789\r\nEND\r\n".to_vec()),
        _ => reply(b"ERROR\r\n"),
    })
    .await;
    let client = connected_client(&[&server.addr]).await;

    let values = within(client.get("big")).await.expect("get");
    assert_eq!(values["big"].value, raw_item(5, b"0123456789"));
}

#[tokio::test]
async fn pipelined_requests_complete_in_write_order() {
    let server = MockServer::start(|command| match command {
        "set a 0 0 1" => reply(b"STORED\r\n"),
        "delete b" => reply(b"NOT_FOUND\r\n"),
        "incr c 1" => reply(b"2\r\n"),
        "bogus" => reply(b"ERROR\r\n"),
        _ => reply(b"END\r\n"),
    })
    .await;
    let client = connected_client(&[&server.addr]).await;

    let (stored, deleted, counter) = within(async {
        tokio::join!(
            client.set("a", "1", StoreOptions::default()),
            client.del("b"),
            client.incr("c", 1),
        )
    })
    .await;
    assert_eq!(stored, Ok("STORED".to_string()));
    assert_eq!(deleted.unwrap_err().kind, ErrorKind::NotFound);
    assert_eq!(counter, Ok(2));
}

#[tokio::test]
async fn gets_and_cas_carry_tokens() {
    let server = MockServer::start(|command| match command {
        "gets k" => reply(b"VALUE k 3 1 42\r\nv\r\nEND\r\n"),
        "cas k 3 0 1 42" => reply(b"EXISTS\r\n"),
        _ => reply(b"ERROR\r\n"),
    })
    .await;
    let client = connected_client(&[&server.addr]).await;

    let values = within(client.gets("k")).await.expect("gets");
    let entry = &values["k"];
    assert_eq!(entry.cas, Some(42));

    let options = StoreOptions {
        flags: 3,
        ..StoreOptions::default()
    };
    let err = within(client.cas("k", "w", 42, options)).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Exists);
    assert_eq!(server.commands(), vec!["gets k", "cas k 3 0 1 42 | w"]);
}

#[tokio::test]
async fn default_ttl_becomes_absolute_exptime() {
    let server = MockServer::start(|_| reply(b"STORED\r\n")).await;
    let mut client = connected_client(&[&server.addr]).await;
    client.set_time_to_live(100);

    within(client.set("k", "v", StoreOptions::default())).await.expect("set");
    let explicit = StoreOptions {
        exptime: Some(30),
        ..StoreOptions::default()
    };
    within(client.replace("k", "v", explicit)).await.expect("replace");

    let commands = server.commands();
    let exptime: u64 = commands[0].split(' ').nth(3).unwrap().parse().unwrap();
    assert!(exptime > 1_000_000_000);
    assert_eq!(commands[1], "replace k 0 30 1 | v");
}

#[tokio::test]
async fn generic_error_line_fails_only_its_request() {
    let server = MockServer::start(|command| match command {
        "append k 0 0 1" => reply(b"ERROR\r\n"),
        "prepend k 0 0 1" => reply(b"NOT_STORED\r\n"),
        _ => reply(b"STORED\r\n"),
    })
    .await;
    let client = connected_client(&[&server.addr]).await;

    let err = within(client.append("k", "x", StoreOptions::default())).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Error);
    let err = within(client.prepend("k", "x", StoreOptions::default())).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotStored);
    assert!(within(client.set("k", "x", StoreOptions::default())).await.is_ok());
}

#[tokio::test]
async fn version_and_stats_fan_out_to_every_server() {
    let first = MockServer::start(|command| match command {
        "version" => reply(b"VERSION 1.6.21\r\n"),
        "stats" => reply(b"STAT pid 10\r\nSTAT uptime 5\r\nEND\r\n"),
        "stats sizes" => reply(b"STAT 96 2\r\nEND\r\n"),
        _ => reply(b"ERROR\r\n"),
    })
    .await;
    let second = MockServer::start(|command| match command {
        "version" => reply(b"VERSION 1.4.5\r\n"),
        _ => reply(b"ERROR\r\n"),
    })
    .await;
    let client = connected_client(&[&first.addr, &second.addr]).await;

    let versions = within(client.version()).await;
    assert_eq!(versions, vec![Ok("1.6.21".to_string()), Ok("1.4.5".to_string())]);

    let stats = within(client.stats(StatsCategory::parse(""))).await;
    assert_eq!(stats.len(), 2);
    match &stats[0] {
        Ok(Stats::Report(report)) => {
            assert_eq!(report.general["pid"], "10");
            assert_eq!(report.general["uptime"], "5");
        }
        other => panic!("unexpected stats {:?}", other),
    }
    assert_eq!(stats[1].as_ref().unwrap_err().kind, ErrorKind::Error);

    let sizes = within(client.stats(StatsCategory::Sizes)).await;
    match &sizes[0] {
        Ok(Stats::Sizes(Some(size))) => {
            assert_eq!(size.bytes, "96");
            assert_eq!(size.items, "2");
        }
        other => panic!("unexpected sizes {:?}", other),
    }
}

#[tokio::test]
async fn adapter_can_be_swapped_at_runtime() {
    let server = MockServer::start(|_| reply(b"VALUE doc 0 7\r\n{\"a\":1}\r\nEND\r\n")).await;
    let mut client = connected_client(&[&server.addr]).await;

    client.set_adapter(adapter::json());
    let values = within(client.get("doc")).await.expect("get");
    assert_eq!(values["doc"].value, Value::Json(serde_json::json!({"a": 1})));
}

#[tokio::test]
async fn keys_that_would_split_commands_are_rejected() {
    let server = MockServer::start(|command| match command {
        "set ok 0 0 1" => reply(b"STORED\r\n"),
        "delete b" => reply(b"DELETED\r\n"),
        _ => reply(b"ERROR\r\n"),
    })
    .await;
    let client = connected_client(&[&server.addr]).await;

    let (injected, stored) = within(async {
        tokio::join!(
            client.get("a\r\ndelete b"),
            client.set("ok", "v", StoreOptions::default()),
        )
    })
    .await;
    assert_eq!(injected.unwrap_err().kind, ErrorKind::ClientError);
    assert_eq!(stored, Ok("STORED".to_string()));

    let err = within(client.set("a b", "v", StoreOptions::default())).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ClientError);
    for result in [
        within(client.del("")).await.map(drop),
        within(client.incr("a\tb", 1)).await.map(drop),
        within(client.get_multi(&["ok", "bad key"])).await.map(drop),
    ] {
        assert_eq!(result.unwrap_err().kind, ErrorKind::ClientError);
    }

    assert_eq!(server.commands(), vec!["set ok 0 0 1 | v"]);
}

#[tokio::test]
async fn impossible_value_length_restarts_connection() {
    let server = MockServer::start(|command| match command {
        "get huge" => Action::Reply(format!("VALUE huge 0 {}\r\nv\r\nEND\r\n", usize::MAX).into_bytes()),
        "get k" => reply(b"VALUE k 0 2\r\nok\r\nEND\r\n"),
        _ => reply(b"ERROR\r\n"),
    })
    .await;
    let client = connected_client(&[&server.addr]).await;

    let err = within(client.get("huge")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ConnectionError);

    wait_until(|| server.accepted() == 2).await;
    let values = within(async {
        loop {
            match client.get("k").await {
                Err(err) if err.kind == ErrorKind::ConnectionError => {
                    sleep(Duration::from_millis(5)).await
                }
                other => break other,
            }
        }
    })
    .await
    .expect("get after restart");
    assert_eq!(values["k"].value, raw_item(0, b"ok"));
}

#[tokio::test]
async fn large_write_does_not_block_reading_replies() {
    const SIZE: usize = 16 * 1024 * 1024;
    let server = MockServer::start(|command| {
        if command == "get big" {
            let mut wire = format!("VALUE big 0 {}\r\n", SIZE).into_bytes();
            wire.resize(wire.len() + SIZE, b'r');
            wire.extend_from_slice(b"\r\nEND\r\n");
            Action::Reply(wire)
        } else {
            reply(b"STORED\r\n")
        }
    })
    .await;
    let client = connected_client(&[&server.addr]).await;

    // The server writes the whole reply before reading the next command,
    // while the client is pushing an equally large value.
    let value = vec![b'w'; SIZE];
    let (fetched, stored) = within(async {
        tokio::join!(client.get("big"), client.set("huge", &value, StoreOptions::default()))
    })
    .await;
    match &fetched.expect("get")["big"].value {
        Value::Raw(item) => assert_eq!(item.size, SIZE),
        other => panic!("unexpected value {:?}", other),
    }
    assert_eq!(stored, Ok("STORED".to_string()));
}

#[tokio::test(start_paused = true)]
async fn reconnect_attempts_back_off_exponentially() {
    init_tracing();
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("addr").to_string()
    };
    let reconnect = ReconnectConfig {
        floor_ms: 10,
        ceiling_ms: 80,
    };
    let connection = Connection::spawn(addr, &reconnect, true);

    let opened = connection.open().await.expect("worker");
    assert_eq!(opened.unwrap_err().kind, ErrorKind::ConnectionError);
    assert_eq!(connection.connect_attempts(), 1);

    // Retries at 10, 30, 70, 150, 230 and 310 ms: doubling, then capped.
    let start = tokio::time::Instant::now();
    for (at_ms, attempts) in [(5, 1), (20, 2), (50, 3), (110, 4), (190, 5), (270, 6), (350, 7)] {
        tokio::time::sleep_until(start + Duration::from_millis(at_ms)).await;
        assert_eq!(connection.connect_attempts(), attempts, "at {} ms", at_ms);
    }

    connection.close();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(connection.connect_attempts(), 7);
}
