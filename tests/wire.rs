use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use glowbook::engine::SlotPolicy;
use glowbook::tenant::TenantManager;
use glowbook::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("glowbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, SlotPolicy::default()));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "glowbook".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect(addr: SocketAddr, dbname: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("glowbook")
        .password("glowbook");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

/// Text rows of a simple-protocol query.
async fn rows(client: &Client, sql: &str) -> Vec<Vec<Option<String>>> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(
                (0..row.len())
                    .map(|i| row.get(i).map(str::to_string))
                    .collect(),
            ),
            _ => None,
        })
        .collect()
}

fn insert_booking(id: Ulid, specialist: Ulid, client: Ulid, date: &str, start: &str, end: &str) -> String {
    format!(
        "INSERT INTO bookings (id, specialist_id, client_id, date, start, \"end\", service) \
         VALUES ('{id}', '{specialist}', '{client}', '{date}', '{start}', '{end}', 'Haircut')"
    )
}

fn sqlstate(err: &tokio_postgres::Error) -> String {
    err.as_db_error()
        .map(|e| e.code().code().to_string())
        .unwrap_or_default()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_flow_over_simple_protocol() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "salon_a").await;
    let sid = Ulid::new();
    let cid = Ulid::new();

    let booking = Ulid::new();
    client
        .simple_query(&insert_booking(booking, sid, cid, "2024-06-11", "10:00", "11:00"))
        .await
        .unwrap();

    let err = client
        .simple_query(&insert_booking(Ulid::new(), sid, Ulid::new(), "2024-06-11", "10:30", "11:30"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "23P01");

    client
        .simple_query(&insert_booking(Ulid::new(), sid, Ulid::new(), "2024-06-11", "11:00", "12:00"))
        .await
        .unwrap();

    let slots = rows(
        &client,
        &format!("SELECT * FROM slots WHERE specialist_id = '{sid}' AND date = '2024-06-11' AND duration = 60"),
    )
    .await;
    let starts: Vec<_> = slots.iter().map(|r| r[0].clone().unwrap()).collect();
    assert!(starts.contains(&"09:00".to_string()));
    assert!(!starts.contains(&"10:00".to_string()));
    assert!(!starts.contains(&"11:30".to_string()));
    assert!(starts.contains(&"12:00".to_string()));
    assert_eq!(slots[0][1].as_deref(), Some("10:00"));

    client
        .simple_query(&format!(
            "UPDATE bookings SET status = 'cancelled' WHERE id = '{booking}' AND client_id = '{cid}'"
        ))
        .await
        .unwrap();

    let mine = rows(&client, &format!("SELECT * FROM bookings WHERE client_id = '{cid}'")).await;
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0][8].as_deref(), Some("cancelled"));

    let confirmed = rows(
        &client,
        &format!("SELECT * FROM bookings WHERE specialist_id = '{sid}' AND date = '2024-06-11'"),
    )
    .await;
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0][4].as_deref(), Some("11:00"));
}

#[tokio::test]
async fn off_days_and_breaks() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "salon_b").await;
    let sid = Ulid::new();

    let off_day = Ulid::new();
    client
        .simple_query(&format!(
            "INSERT INTO off_days (id, specialist_id, date, reason) VALUES ('{off_day}', '{sid}', '2024-06-15', 'Vacation')"
        ))
        .await
        .unwrap();
    let err = client
        .simple_query(&format!(
            "INSERT INTO off_days (id, specialist_id, date) VALUES ('{}', '{sid}', '2024-06-15')",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "23505");

    let err = client
        .simple_query(&insert_booking(Ulid::new(), sid, Ulid::new(), "2024-06-15", "10:00", "11:00"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "55000");

    client
        .simple_query(&format!(
            "INSERT INTO breaks (id, specialist_id, day_of_week, start, \"end\", is_recurring) \
             VALUES ('{}', '{sid}', 1, '12:00', '13:00', true)",
            Ulid::new()
        ))
        .await
        .unwrap();

    let breaks = rows(&client, &format!("SELECT * FROM breaks WHERE specialist_id = '{sid}'")).await;
    assert_eq!(breaks.len(), 1);
    assert_eq!(breaks[0][2].as_deref(), Some("1"));
    assert_eq!(breaks[0][3].as_deref(), Some("12:00"));

    let doc = rows(&client, &format!("SELECT * FROM availability WHERE specialist_id = '{sid}'")).await;
    let doc: serde_json::Value = serde_json::from_str(doc[0][0].as_deref().unwrap()).unwrap();
    assert_eq!(doc["offDays"][0]["reason"], "Vacation");
    assert_eq!(doc["breaks"][0]["dayOfWeek"], 1);

    let board = rows(
        &client,
        &format!("SELECT * FROM slot_board WHERE specialist_id = '{sid}' AND date = '2024-06-10' AND duration = 60"),
    )
    .await;
    let at_noon = board.iter().find(|r| r[0].as_deref() == Some("12:00")).unwrap();
    assert_eq!(at_noon[2].as_deref(), Some("on_break"));

    let removed = client
        .execute(
            &format!("DELETE FROM off_days WHERE specialist_id = '{sid}' AND id IN ('{off_day}', '{}')", Ulid::new()),
            &[],
        )
        .await
        .unwrap();
    assert_eq!(removed, 1);
}

#[tokio::test]
async fn extended_protocol_with_parameters() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "salon_c").await;
    let sid = Ulid::new().to_string();
    let cid = Ulid::new().to_string();

    let inserted = client
        .execute(
            "INSERT INTO bookings (id, specialist_id, client_id, date, start, \"end\", service, notes) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            &[
                &Ulid::new().to_string(),
                &sid,
                &cid,
                &"2024-06-12",
                &"14:00",
                &"15:30",
                &"Coloring",
                &"It's a surprise",
            ],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let bookings = client
        .query("SELECT * FROM bookings WHERE client_id = $1", &[&cid])
        .await
        .unwrap();
    assert_eq!(bookings.len(), 1);
    let notes: Option<String> = bookings[0].get("notes");
    assert_eq!(notes.as_deref(), Some("It's a surprise"));
    let end: String = bookings[0].get("end");
    assert_eq!(end, "15:30");

    let slots = client
        .query(
            "SELECT * FROM slots WHERE specialist_id = $1 AND date = $2 AND duration = $3",
            &[&sid, &"2024-06-12", &"30"],
        )
        .await
        .unwrap();
    let starts: Vec<String> = slots.iter().map(|r| r.get("start")).collect();
    assert!(starts.contains(&"13:30".to_string()));
    assert!(!starts.contains(&"14:00".to_string()));
    assert!(!starts.contains(&"15:00".to_string()));
    assert!(starts.contains(&"15:30".to_string()));
}

#[tokio::test]
async fn parameter_text_is_not_reinterpreted() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "salon_e").await;
    let sid = Ulid::new().to_string();
    let cid = Ulid::new().to_string();
    let notes = "deposit $2 paid, balance $1";

    client
        .execute(
            "INSERT INTO bookings (id, specialist_id, client_id, date, start, \"end\", service, notes) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            &[
                &Ulid::new().to_string(),
                &sid,
                &cid,
                &"2024-06-13",
                &"10:00",
                &"11:00",
                &"Pedicure",
                &notes,
            ],
        )
        .await
        .unwrap();

    let bookings = client
        .query("SELECT * FROM bookings WHERE client_id = $1", &[&cid])
        .await
        .unwrap();
    assert_eq!(bookings.len(), 1);
    let stored: Option<String> = bookings[0].get("notes");
    assert_eq!(stored.as_deref(), Some(notes));
    let service: String = bookings[0].get("service");
    assert_eq!(service, "Pedicure");
}

#[tokio::test]
async fn tenants_are_isolated_by_database() {
    let (addr, tm) = start_test_server().await;
    let a = connect(addr, "salon_north").await;
    let b = connect(addr, "salon_south").await;
    let sid = Ulid::new();

    a.simple_query(&insert_booking(Ulid::new(), sid, Ulid::new(), "2024-06-11", "10:00", "11:00"))
        .await
        .unwrap();
    // Same specialist id in another salon: no conflict.
    b.simple_query(&insert_booking(Ulid::new(), sid, Ulid::new(), "2024-06-11", "10:00", "11:00"))
        .await
        .unwrap();

    assert_eq!(tm.tenant_count(), 2);
}

#[tokio::test]
async fn malformed_requests_report_sqlstate() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "salon_d").await;
    let sid = Ulid::new();

    let err = client
        .simple_query(&insert_booking(Ulid::new(), sid, Ulid::new(), "2024-06-11", "11:00", "10:00"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "22007");

    let err = client
        .simple_query(&insert_booking(Ulid::new(), sid, Ulid::new(), "2024-06-11", "25:00", "26:00"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "22007");

    let err = client.simple_query("SELECT * FROM customers").await.unwrap_err();
    assert_eq!(sqlstate(&err), "42601");

    let err = client
        .simple_query(&format!(
            "UPDATE bookings SET status = 'cancelled' WHERE id = '{}' AND client_id = '{}'",
            Ulid::new(),
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "02000");
}
