use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms
const YEAR_START: i64 = 1_704_067_200_000; // 2024-01-01
const YEAR_END: i64 = YEAR_START + 365 * 24 * HOUR;

async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(format!("bench_{}", Ulid::new()))
        .user("aula")
        .password("aula");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

async fn create_hall(client: &tokio_postgres::Client, capacity: u32) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO halls (id, name, kind, capacity) VALUES ('{id}', 'Bench Hall', 'CLASSROOM', {capacity})"
        ))
        .await
        .unwrap();
    id
}

async fn submit(client: &tokio_postgres::Client, hall_id: Ulid, s: i64, e: i64) -> Ulid {
    let bid = Ulid::new();
    let requester = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, hall_id, requester_id, role, start, "end", purpose) VALUES ('{bid}', '{hall_id}', '{requester}', 'STUDENT', {s}, {e}, 'bench')"#
        ))
        .await
        .unwrap();
    bid
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port).await;
    let hall_id = create_hall(&client, 10).await;

    let n = 2000;
    let mut submit_latencies = Vec::with_capacity(n);
    let mut bookings = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let s = YEAR_START + (i as i64) * HOUR;
        let t = Instant::now();
        let bid = submit(&client, hall_id, s, s + HOUR).await;
        submit_latencies.push(t.elapsed());
        bookings.push(bid);
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} submissions in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("submit latency", &mut submit_latencies);

    // Walk each booking through both approval tiers
    let mut transition_latencies = Vec::with_capacity(n * 2);
    for bid in &bookings {
        for (status, role) in [("APPROVED_STAFF", "STAFF"), ("APPROVED_ADMIN", "ADMIN")] {
            let t = Instant::now();
            client
                .batch_execute(&format!(
                    "UPDATE bookings SET status = '{status}', acting_role = '{role}' WHERE id = '{bid}'"
                ))
                .await
                .unwrap();
            transition_latencies.push(t.elapsed());
        }
    }
    print_latency("transition latency", &mut transition_latencies);
}

async fn phase2_concurrent(host: &str, port: u16) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            // Each task uses its own campus (unique dbname from connect())
            let client = connect(&host, port).await;
            let hall_id = create_hall(&client, 10).await;

            for j in 0..n_per_task {
                let s = YEAR_START + (j as i64) * HOUR;
                submit(&client, hall_id, s, s + HOUR).await;
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} submissions = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load(host: &str, port: u16) {
    // Writer tasks: continuously submit bookings in the background
    let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let host = host.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let hall_id = create_hall(&client, 10).await;
            let mut i = 0i64;
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                let bid = Ulid::new();
                let requester = Ulid::new();
                let s = YEAR_START + i * HOUR;
                let _ = client
                    .batch_execute(&format!(
                        r#"INSERT INTO bookings (id, hall_id, requester_id, role, start, "end", purpose) VALUES ('{bid}', '{hall_id}', '{requester}', 'STUDENT', {s}, {}, 'bench')"#,
                        s + HOUR
                    ))
                    .await;
                i += 1;
            }
        }));
    }

    // Reader tasks: query availability on their own campus and measure latency
    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();

    for _ in 0..n_readers {
        let host = host.to_string();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let hall_id = create_hall(&client, 10).await;

            // Pre-fill bookings so availability has gaps to compute
            for i in 0..50 {
                let s = YEAR_START + (i as i64) * 2 * HOUR;
                submit(&client, hall_id, s, s + HOUR).await;
            }

            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .batch_execute(&format!(
                        r#"SELECT * FROM availability WHERE hall_id = '{hall_id}' AND start >= {YEAR_START} AND "end" <= {YEAR_END}"#
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("availability query", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let hall_id = create_hall(&client, 10).await;

            for i in 0..ops_per_conn {
                let s = YEAR_START + (i as i64) * HOUR;
                submit(&client, hall_id, s, s + HOUR).await;
            }
            success.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(std::sync::atomic::Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("AULA_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("AULA_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid AULA_PORT");

    println!("=== aula stress benchmark ===");
    println!("target: {host}:{port}\n");

    // Each phase uses its own campus (unique dbname) to avoid interference

    println!("[phase 1] sequential write and transition throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] concurrent write throughput");
    phase2_concurrent(&host, port).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
