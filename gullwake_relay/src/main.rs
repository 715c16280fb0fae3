// CLI probe for exercising a Gullwake relay.
//
// Connects to a relay, prints every system message and relayed payload,
// and optionally broadcasts a small test payload at a fixed cadence. Run
// with RUST_LOG=debug for the engine's own logging.
//
// Usage:
//   relay-probe [OPTIONS]
//     --transport <ws|tcp|udp>  Transport to use (default: udp)
//     --host <HOST>             Relay host (default: 127.0.0.1)
//     --port <PORT>             Relay port (default: 7878)
//     --ssl                     Use TLS for the websocket transport
//     --lobby <ID>              Lobby to join (default: probe-lobby)
//     --cx-id <ID>              Connection id (default: probe-<pid>)
//     --passcode <PASS>         Lobby passcode (optional)
//     --send-every <MS>         Broadcast a test payload every MS
//                               milliseconds; 0 disables (default: 1000)

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use gullwake_relay::{ClientConfig, ConnectOptions, RelayClient, TransportKind};

struct ProbeConfig {
    kind: TransportKind,
    options: ConnectOptions,
    send_every_ms: u64,
}

fn main() {
    env_logger::init();
    let ProbeConfig { kind, options, send_every_ms } = parse_args();

    let mut client = RelayClient::new(ClientConfig::default());
    client.set_system_handler(|json| println!("system: {json}"));
    client.set_relay_handler(|sender, payload| {
        println!("relay from {}: {}", sender.0, String::from_utf8_lossy(payload));
    });

    println!("Connecting to {}:{} over {kind:?}...", options.host, options.port);
    let stop = Arc::new(AtomicBool::new(false));
    let stop_on_failure = stop.clone();
    client.connect(kind, options, move |success, detail| {
        if success {
            println!("Connected.");
        } else {
            println!("Connection ended: {detail}");
            stop_on_failure.store(true, Ordering::SeqCst);
        }
    });

    let mut last_send = Instant::now();
    while !stop.load(Ordering::SeqCst) {
        client.process_events();
        if send_every_ms > 0
            && client.is_connected()
            && last_send.elapsed() >= Duration::from_millis(send_every_ms)
        {
            last_send = Instant::now();
            let payload = format!("probe rtt={}ms", client.get_ping());
            if let Err(e) = client.send_relay(payload.as_bytes(), u64::MAX, true, true, 0) {
                eprintln!("send rejected: {e}");
            }
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    client.disconnect();
}

/// Parse command-line arguments with simple `std::env::args()` matching;
/// no clap dependency.
fn parse_args() -> ProbeConfig {
    let mut config = ProbeConfig {
        kind: TransportKind::Udp,
        options: ConnectOptions {
            lobby_id: "probe-lobby".to_string(),
            cx_id: format!("probe-{}", std::process::id()),
            ..ConnectOptions::default()
        },
        send_every_ms: 1000,
    };
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--transport" => {
                i += 1;
                config.kind = match args.get(i).map(String::as_str) {
                    Some("ws") => TransportKind::WebSocket,
                    Some("tcp") => TransportKind::Tcp,
                    Some("udp") => TransportKind::Udp,
                    _ => {
                        eprintln!("--transport must be ws, tcp, or udp");
                        std::process::exit(1);
                    }
                };
            }
            "--host" => {
                i += 1;
                config.options.host = args.get(i).cloned().unwrap_or_else(|| {
                    eprintln!("--host requires a value");
                    std::process::exit(1);
                });
            }
            "--port" => {
                i += 1;
                config.options.port =
                    args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                        eprintln!("--port requires a valid port number");
                        std::process::exit(1);
                    });
            }
            "--ssl" => {
                config.options.ssl = true;
            }
            "--lobby" => {
                i += 1;
                config.options.lobby_id = args.get(i).cloned().unwrap_or_else(|| {
                    eprintln!("--lobby requires a value");
                    std::process::exit(1);
                });
            }
            "--cx-id" => {
                i += 1;
                config.options.cx_id = args.get(i).cloned().unwrap_or_else(|| {
                    eprintln!("--cx-id requires a value");
                    std::process::exit(1);
                });
            }
            "--passcode" => {
                i += 1;
                config.options.passcode = args.get(i).cloned().unwrap_or_else(|| {
                    eprintln!("--passcode requires a value");
                    std::process::exit(1);
                });
            }
            "--send-every" => {
                i += 1;
                config.send_every_ms =
                    args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                        eprintln!("--send-every requires a number of milliseconds");
                        std::process::exit(1);
                    });
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

fn print_usage() {
    println!("Usage: relay-probe [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --transport <ws|tcp|udp>  Transport to use (default: udp)");
    println!("  --host <HOST>             Relay host (default: 127.0.0.1)");
    println!("  --port <PORT>             Relay port (default: 7878)");
    println!("  --ssl                     Use TLS for the websocket transport");
    println!("  --lobby <ID>              Lobby to join (default: probe-lobby)");
    println!("  --cx-id <ID>              Connection id (default: probe-<pid>)");
    println!("  --passcode <PASS>         Lobby passcode (optional)");
    println!("  --send-every <MS>         Broadcast a test payload every MS");
    println!("                            milliseconds; 0 disables (default: 1000)");
    println!("  --help, -h                Show this help");
}
