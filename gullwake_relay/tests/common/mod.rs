// Shared helpers for the integration tests: callback recorders and the
// client pump loop. Each test drives a real `RelayClient` against a
// scripted stub relay on a loopback socket.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use gullwake_relay::{ConnectOptions, NetId, RelayClient};

/// Ceiling for any single wait; tests fail rather than hang.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the callbacks reported, in arrival order.
#[derive(Debug, Default)]
pub struct Recorded {
    pub results: Vec<(bool, String)>,
    pub relays: Vec<(NetId, Vec<u8>)>,
    pub systems: Vec<String>,
}

pub type Record = Arc<Mutex<Recorded>>;

/// Register relay and system handlers that append into one record.
pub fn attach_recorders(client: &mut RelayClient) -> Record {
    let record = Record::default();
    let relay_record = record.clone();
    client.set_relay_handler(move |sender, payload| {
        relay_record.lock().unwrap().relays.push((sender, payload.to_vec()));
    });
    let system_record = record.clone();
    client.set_system_handler(move |json| {
        system_record.lock().unwrap().systems.push(json.to_string());
    });
    record
}

/// A connect-result callback that appends into the same record.
pub fn result_recorder(record: &Record) -> impl FnMut(bool, &str) + Send + 'static {
    let record = record.clone();
    move |success, detail| {
        record.lock().unwrap().results.push((success, detail.to_string()));
    }
}

/// Connect options every test uses, pointed at a loopback stub.
pub fn options(port: u16) -> ConnectOptions {
    ConnectOptions {
        host: "127.0.0.1".to_string(),
        port,
        lobby_id: "it-lobby".to_string(),
        cx_id: "cx-tester".to_string(),
        passcode: "sesame".to_string(),
        ..ConnectOptions::default()
    }
}

/// Pump `process_events` until `cond` holds or the deadline passes.
pub fn pump_until(
    client: &mut RelayClient,
    deadline: Duration,
    mut cond: impl FnMut(&RelayClient) -> bool,
) -> bool {
    let start = Instant::now();
    loop {
        client.process_events();
        if cond(client) {
            return true;
        }
        if start.elapsed() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}
