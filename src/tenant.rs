use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::compactor;
use crate::engine::{Engine, SlotPolicy};
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::observability::TENANTS_ACTIVE;

/// One engine per salon. The tenant is the database name of the pgwire
/// connection; each gets its own WAL file and compactor task.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    policy: SlotPolicy,
}

/// The tenant name is the WAL file stem verbatim: `[A-Za-z0-9_-]+` only, so
/// distinct names always map to distinct files.
fn wal_file_stem(tenant: &str) -> io::Result<&str> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "tenant name too long",
        ));
    }
    if tenant.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "empty tenant name",
        ));
    }
    if !tenant
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid tenant name {tenant:?}: use letters, digits, '_' or '-'"),
        ));
    }
    Ok(tenant)
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, policy: SlotPolicy) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            policy,
        }
    }

    /// Get or lazily load the engine for `tenant`.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        let stem = wal_file_stem(tenant)?;
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        let engine = self
            .engines
            .entry(tenant.to_string())
            .or_try_insert_with(|| {
                let wal_path = self.data_dir.join(format!("{stem}.wal"));
                let engine = Arc::new(Engine::new(
                    wal_path,
                    Arc::new(NotifyHub::new()),
                    self.policy,
                )?);
                tokio::spawn(compactor::run_compactor(
                    engine.clone(),
                    self.compact_threshold,
                ));
                info!("loaded tenant {tenant}");
                Ok::<_, io::Error>(engine)
            })?
            .clone();

        metrics::gauge!(TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::{NaiveDate, NaiveTime};
    use ulid::Ulid;

    use super::*;
    use crate::engine::EngineError;
    use crate::model::{NewBooking, TimeInterval};

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("glowbook_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(name: &str) -> (TenantManager, PathBuf) {
        let dir = test_data_dir(name);
        (TenantManager::new(dir.clone(), 1000, SlotPolicy::default()), dir)
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let (tm, _) = manager("isolation");
        let salon_a = tm.get_or_create("salon_a").unwrap();
        let salon_b = tm.get_or_create("salon_b").unwrap();

        // same specialist id in both salons
        let sid = Ulid::new();
        let date = NaiveDate::from_ymd_opt(2024, 6, 15).unwrap();
        salon_a.add_off_day(Ulid::new(), sid, date, None).await.unwrap();

        assert!(salon_a.is_day_off(sid, date).await);
        assert!(!salon_b.is_day_off(sid, date).await);
        let slots = salon_b.available_slots(sid, date, 30).await.unwrap();
        assert_eq!(slots.first(), NaiveTime::from_hms_opt(9, 0, 0).as_ref());
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let (tm, dir) = manager("lazy");
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        let _engine = tm.get_or_create("my_salon").unwrap();
        assert!(dir.join("my_salon.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let (tm, _) = manager("same_engine");
        let first = tm.get_or_create("foo").unwrap();
        let second = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn tenant_name_must_be_filesystem_safe() {
        let (tm, dir) = manager("unsafe_names");
        for name in ["../evil", "../..", "salon.a", "salon a", "", "sälong"] {
            assert!(tm.get_or_create(name).is_err(), "{name:?} accepted");
        }
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        let _engine = tm.get_or_create("salon-a_2").unwrap();
        assert!(dir.join("salon-a_2.wal").exists());
    }

    #[tokio::test]
    async fn lookalike_names_never_share_a_wal() {
        let (tm, dir) = manager("lookalike");
        let sid = Ulid::new();
        let date = NaiveDate::from_ymd_opt(2024, 6, 11).unwrap();
        let ten = NaiveTime::from_hms_opt(10, 0, 0).unwrap();
        let eleven = NaiveTime::from_hms_opt(11, 0, 0).unwrap();
        let booking = || NewBooking {
            id: Ulid::new(),
            specialist_id: sid,
            client_id: Ulid::new(),
            date,
            interval: TimeInterval::new(ten, eleven).unwrap(),
            service_name: "Haircut".into(),
            notes: None,
        };

        assert!(tm.get_or_create("salon.a").is_err());
        tm.get_or_create("salona")
            .unwrap()
            .create_booking(booking())
            .await
            .unwrap();

        let reopened = TenantManager::new(dir, 1000, SlotPolicy::default());
        let salon = reopened.get_or_create("salona").unwrap();
        assert_eq!(salon.confirmed_bookings(sid, date).await.len(), 1);
        assert!(matches!(
            salon.create_booking(booking()).await,
            Err(EngineError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let (tm, _) = manager("name_too_long");
        let err = tm
            .get_or_create(&"x".repeat(MAX_TENANT_NAME_LEN + 1))
            .err()
            .unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let (tm, _) = manager("count_limit");
        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }
}
