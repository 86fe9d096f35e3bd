//! Context wiring: pool job in, share out

use merit_miner::solver::SimulationSolver;
use merit_miner::Context;
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn test_share_travels_from_pool_job_to_submit() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("stratum+tcp://127.0.0.1:{}", listener.local_addr().unwrap().port());
    let (submit_tx, submit_rx) = mpsc::channel::<Value>();

    let pool = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut writer = stream;
        let mut read_json = move || -> Option<Value> {
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(n) if n > 0 => serde_json::from_str(line.trim_end()).ok(),
                _ => None,
            }
        };
        let mut send = |value: Value| {
            writer.write_all(format!("{}\n", value).as_bytes()).unwrap();
        };

        let subscribe = read_json().unwrap();
        send(json!({
            "id": subscribe["id"],
            "result": [[["mining.notify", "ctx"]], "01", 4],
            "error": null
        }));
        read_json().unwrap();

        send(json!({"id": null, "method": "mining.set_difficulty", "params": [1e-9]}));
        send(json!({
            "id": null,
            "method": "mining.notify",
            "params": [
                "ctx-job", "44".repeat(32), "01000000", "ffffffff", [],
                "01000020", "ffff001d", 16, "5a1b2c3d", true
            ]
        }));

        let mut answered = false;
        while let Some(message) = read_json() {
            if message["method"] == "mining.submit" && !answered {
                send(json!({"id": message["id"], "result": true, "error": null}));
                submit_tx.send(message).unwrap();
                answered = true;
            }
        }
    });

    let solver = SimulationSolver::new(1.0).with_attempt_delay(Duration::from_millis(5));
    let context = Arc::new(Context::new(Arc::new(solver)));
    assert!(context.connect_stratum(&url, "MWallet", "x"));
    assert!(context.is_stratum_connected());
    assert!(context.run_stratum());
    assert!(context.run_miner(1, 1, vec![]));

    let submit = submit_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(submit["params"][0], "MWallet");
    assert_eq!(submit["params"][1], "ctx-job");
    assert!(wait_until(|| context.client().accepted_shares() >= 1));

    let stats = context.get_miner_stats().unwrap();
    assert!(stats.total.shares >= 1);
    assert!(stats.total.attempts >= stats.total.shares);

    context.stop_miner();
    context.stop_stratum();
    context.join();
    assert!(!context.is_miner_running());
    assert!(!context.is_stratum_running());
    assert!(!context.is_stratum_connected());
    assert_eq!(context.client().session_id(), None);
    pool.join().unwrap();
}
