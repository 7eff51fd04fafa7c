use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Days, Utc};
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};

async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("slotlease")
        .user("slotlease")
        .password(std::env::var("SLOTLEASE_PASSWORD").unwrap_or_else(|_| "slotlease".into()));

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
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
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

/// The named column of every returned row.
async fn column(client: &tokio_postgres::Client, sql: &str, name: &str) -> Vec<String> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => row.get(name).map(str::to_string),
            _ => None,
        })
        .collect()
}

async fn open_slots(client: &tokio_postgres::Client) -> Vec<String> {
    let sql = "SELECT * FROM slots";
    let ids = column(client, sql, "id").await;
    let states = column(client, sql, "state").await;
    ids.into_iter()
        .zip(states)
        .filter(|(_, state)| state == "open")
        .map(|(id, _)| id)
        .collect()
}

async fn hold(client: &tokio_postgres::Client, slot_id: &str) -> Option<String> {
    let sql = format!("INSERT INTO holds (slot_id) VALUES ('{slot_id}')");
    match client.simple_query(&sql).await {
        Ok(msgs) => msgs.into_iter().find_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => row.get("token").map(str::to_string),
            _ => None,
        }),
        Err(_) => None,
    }
}

async fn setup(client: &tokio_postgres::Client) {
    // Leftover open slots from an earlier run; held or booked ones stay.
    client.batch_execute("DELETE FROM slots").await.unwrap();

    let day = Utc::now()
        .date_naive()
        .checked_add_days(Days::new(30))
        .expect("date in range");
    let start = Instant::now();
    let sql = format!(
        r#"INSERT INTO availability (start, "end", tz, frequency, occurrences) VALUES ('{day} 08:00', '{day} 20:00', 'UTC', 'daily', 90)"#
    );
    client.batch_execute(&sql).await.unwrap();
    println!(
        "  generated {} slots in {:.2}ms",
        open_slots(client).await.len(),
        start.elapsed().as_secs_f64() * 1000.0
    );
}

async fn phase1_sequential(host: &str, port: u16, slots: &[String]) {
    let client = connect(host, port).await;
    let mut latencies = Vec::with_capacity(slots.len());
    let start = Instant::now();

    for slot_id in slots {
        let t = Instant::now();
        let token = hold(&client, slot_id).await.expect("slot should be open");
        client
            .batch_execute(&format!(
                "DELETE FROM holds WHERE slot_id = '{slot_id}' AND token = '{token}'"
            ))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = slots.len() as f64 / elapsed.as_secs_f64();
    println!(
        "  {} hold+release cycles in {:.2}s = {ops:.0} cycles/sec",
        slots.len(),
        elapsed.as_secs_f64()
    );
    print_latency("cycle latency", &mut latencies);
}

async fn phase2_contention(host: &str, port: u16, slots: &[String]) {
    let n_tasks = 16;
    let slots = Arc::new(slots.to_vec());
    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let host = host.to_string();
        let slots = slots.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut wins = Vec::new();
            let mut latencies = Vec::with_capacity(slots.len());
            for slot_id in slots.iter() {
                let t = Instant::now();
                if hold(&client, slot_id).await.is_some() {
                    wins.push(slot_id.clone());
                }
                latencies.push(t.elapsed());
            }
            (wins, latencies)
        }));
    }

    let mut winners = Vec::new();
    let mut latencies = Vec::new();
    for h in handles {
        let (wins, lat) = h.await.unwrap();
        winners.extend(wins);
        latencies.extend(lat);
    }
    let elapsed = start.elapsed();

    winners.sort();
    let total = winners.len();
    winners.dedup();
    println!(
        "  {n_tasks} tasks racing for {} slots: {total} grants, {} distinct, in {:.2}s",
        slots.len(),
        winners.len(),
        elapsed.as_secs_f64()
    );
    if total != winners.len() || total != slots.len() {
        println!("  !! expected exactly one grant per slot");
    }
    print_latency("acquire latency", &mut latencies);
}

async fn phase3_list_under_churn(host: &str, port: u16, slots: &[String]) {
    let stop = Arc::new(AtomicBool::new(false));
    let mut churn_handles = Vec::new();

    for chunk in slots.chunks(slots.len().div_ceil(4).max(1)) {
        let host = host.to_string();
        let stop = stop.clone();
        let chunk = chunk.to_vec();
        churn_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            while !stop.load(Ordering::Relaxed) {
                for slot_id in &chunk {
                    if let Some(token) = hold(&client, slot_id).await {
                        let _ = client
                            .batch_execute(&format!(
                                "DELETE FROM holds WHERE slot_id = '{slot_id}' AND token = '{token}'"
                            ))
                            .await;
                    }
                }
            }
        }));
    }

    let n_readers = 8;
    let reads_per_reader = 200;
    let mut reader_handles = Vec::new();
    for _ in 0..n_readers {
        let host = host.to_string();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .batch_execute("SELECT * FROM slots WHERE tz = 'Europe/Berlin'")
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
    stop.store(true, Ordering::Relaxed);
    for h in churn_handles {
        let _ = h.await;
    }

    print_latency("slot listing", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16, slots: &[String]) {
    let start = Instant::now();
    let booked = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for (i, slot_id) in slots.iter().cloned().enumerate() {
        let host = host.to_string();
        let booked = booked.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let Some(token) = hold(&client, &slot_id).await else {
                return;
            };
            let sql = format!(
                "INSERT INTO bookings (slot_id, token, customer_name, customer_email, client_ref) \
                 VALUES ('{slot_id}', '{token}', 'Bench {i}', 'bench{i}@example.com', 'bench-{slot_id}')"
            );
            if client.batch_execute(&sql).await.is_ok() {
                booked.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    println!(
        "  {} connections, hold+book each: {}/{} booked in {:.2}s",
        slots.len(),
        booked.load(Ordering::Relaxed),
        slots.len(),
        start.elapsed().as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("SLOTLEASE_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("SLOTLEASE_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid SLOTLEASE_PORT");

    println!("=== slotlease stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[setup]");
    let setup_client = connect(&host, port).await;
    setup(&setup_client).await;
    let slots = open_slots(&setup_client).await;
    assert!(slots.len() >= 1000, "expected a populated store, got {}", slots.len());

    println!("\n[phase 1] sequential hold/release");
    phase1_sequential(&host, port, &slots[..500]).await;

    println!("\n[phase 2] hold contention");
    phase2_contention(&host, port, &slots[500..700]).await;

    println!("\n[phase 3] listing under hold churn");
    phase3_list_under_churn(&host, port, &slots[700..900]).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port, &slots[900..950]).await;

    let left = setup_client.simple_query("DELETE FROM slots").await.unwrap();
    if let Some(SimpleQueryMessage::CommandComplete(n)) = left.last() {
        println!("\ncleanup removed {n} open slots (held and booked ones stay)");
    }

    println!("\n=== benchmark complete ===");
}
