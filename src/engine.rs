mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod slots;

pub use availability::{applicable_breaks, day_exclusions, schedule_applies, DayExclusions};
pub use error::EngineError;
pub use slots::{available_starts, classify, slot_board, Slot, SlotPolicy, SlotState};

use std::collections::HashMap;
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use tracing::info;
use ulid::Ulid;

use crate::limits::MAX_SPECIALISTS_PER_TENANT;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

pub type SharedSpecialistState = Arc<RwLock<SpecialistState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL. Appends that queue up while a flush is
/// in progress are written together and share a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // commit what we have before running the non-append command
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so half-written bytes of this batch
    // don't get committed with the next one.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            commit_batch(wal, &mut vec![(event, response)]);
        }
    }
}

// ── Engine ───────────────────────────────────────────────

/// The scheduling core of one tenant: every specialist's off-days, breaks and
/// bookings, persisted through the WAL.
///
/// Each specialist has its own `RwLock`. A reservation's check-then-write runs
/// entirely under that lock, so at most one of several overlapping requests
/// for the same specialist can commit.
pub struct Engine {
    pub state: DashMap<Ulid, SharedSpecialistState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: off-day/break/booking id → specialist id.
    pub(super) entity_to_specialist: DashMap<Ulid, Ulid>,
    /// Writers hold it shared; compaction holds it exclusively so its
    /// snapshot can't miss an append.
    pub(super) compaction_gate: RwLock<()>,
    pub policy: SlotPolicy,
}

/// Write access to one specialist, taken behind the compaction gate.
pub(super) struct SpecialistWrite<'a> {
    _gate: RwLockReadGuard<'a, ()>,
    state: OwnedRwLockWriteGuard<SpecialistState>,
    /// Set when this write created the calendar; it is dropped again if
    /// nothing was committed and nobody else holds it.
    created_in: Option<&'a DashMap<Ulid, SharedSpecialistState>>,
}

impl Drop for SpecialistWrite<'_> {
    fn drop(&mut self) {
        if let Some(map) = self.created_in
            && self.state.is_empty()
        {
            // map entry + our guard
            map.remove_if(&self.state.id, |_, rs| Arc::strong_count(rs) == 2);
        }
    }
}

impl Deref for SpecialistWrite<'_> {
    type Target = SpecialistState;

    fn deref(&self) -> &SpecialistState {
        &self.state
    }
}

impl DerefMut for SpecialistWrite<'_> {
    fn deref_mut(&mut self) -> &mut SpecialistState {
        &mut self.state
    }
}

/// Apply an event to a specialist. The caller holds its lock.
fn apply_event(ss: &mut SpecialistState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::OffDayAdded {
            id,
            specialist_id,
            date,
            reason,
        } => {
            ss.insert_off_day(OffDay {
                id: *id,
                specialist_id: *specialist_id,
                date: *date,
                reason: reason.clone(),
            });
            entity_map.insert(*id, *specialist_id);
        }
        Event::OffDaysRemoved { ids, .. } => {
            for id in ids {
                if ss.remove_off_day(*id).is_some() {
                    entity_map.remove(id);
                }
            }
        }
        Event::BreakAdded {
            id,
            specialist_id,
            schedule,
            interval,
            description,
        } => {
            ss.insert_break(BreakRule {
                id: *id,
                specialist_id: *specialist_id,
                schedule: *schedule,
                interval: *interval,
                description: description.clone(),
            });
            entity_map.insert(*id, *specialist_id);
        }
        Event::BreakRemoved { id, .. } => {
            ss.remove_break(*id);
            entity_map.remove(id);
        }
        Event::BookingConfirmed {
            id,
            specialist_id,
            client_id,
            date,
            interval,
            service_name,
            notes,
            created_at,
        } => {
            ss.insert_booking(Booking {
                id: *id,
                client_id: *client_id,
                specialist_id: *specialist_id,
                date: *date,
                interval: *interval,
                service_name: service_name.clone(),
                notes: notes.clone(),
                status: BookingStatus::Confirmed,
                created_at: *created_at,
            });
            entity_map.insert(*id, *specialist_id);
        }
        // Cancelled and completed bookings stay on record (and in the entity map).
        Event::BookingCancelled { id, .. } => {
            if let Some(b) = ss.booking_mut(*id) {
                b.status = BookingStatus::Cancelled;
            }
        }
        Event::BookingCompleted { id, .. } => {
            if let Some(b) = ss.booking_mut(*id) {
                b.status = BookingStatus::Completed;
            }
        }
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, policy: SlotPolicy) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        // Replay into plain owned state; locks are only wrapped around it at the end.
        let entity_to_specialist = DashMap::new();
        let mut replayed: HashMap<Ulid, SpecialistState> = HashMap::new();
        for event in &events {
            let sid = event.specialist_id();
            let ss = replayed
                .entry(sid)
                .or_insert_with(|| SpecialistState::new(sid));
            apply_event(ss, event, &entity_to_specialist);
        }

        let state = DashMap::new();
        for (id, ss) in replayed {
            state.insert(id, Arc::new(RwLock::new(ss)));
        }
        if !events.is_empty() {
            info!(
                "replayed {} events for {} specialists from {}",
                events.len(),
                state.len(),
                wal_path.display()
            );
        }

        Ok(Self {
            state,
            wal_tx,
            notify,
            entity_to_specialist,
            compaction_gate: RwLock::new(()),
            policy,
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::StorageFailure("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StorageFailure("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StorageFailure(e.to_string()))
    }

    pub fn get_specialist(&self, id: &Ulid) -> Option<SharedSpecialistState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_specialist_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_specialist.get(entity_id).map(|e| *e.value())
    }

    pub fn list_specialists(&self) -> Vec<Ulid> {
        self.state.iter().map(|e| *e.key()).collect()
    }

    /// Live feed of every event committed for `specialist_id`.
    pub fn subscribe(&self, specialist_id: Ulid) -> broadcast::Receiver<Event> {
        self.notify.subscribe(specialist_id)
    }

    /// WAL-append, then apply, then notify. Memory is only touched once the
    /// event is durable, so a failed append leaves no trace.
    pub(super) async fn persist_and_apply(
        &self,
        ss: &mut SpecialistState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_event(ss, event, &self.entity_to_specialist);
        self.notify.send(ss.id, event);
        Ok(())
    }

    /// Write-lock a specialist, creating its (empty) calendar on first use.
    pub(super) async fn write_specialist(
        &self,
        id: Ulid,
    ) -> Result<SpecialistWrite<'_>, EngineError> {
        let gate = self.compaction_gate.read().await;
        let (rs, created_in) = match self.get_specialist(&id) {
            Some(rs) => (rs, None),
            None => {
                if self.state.len() >= MAX_SPECIALISTS_PER_TENANT {
                    return Err(EngineError::LimitExceeded("too many specialists"));
                }
                let rs = self
                    .state
                    .entry(id)
                    .or_insert_with(|| Arc::new(RwLock::new(SpecialistState::new(id))))
                    .clone();
                (rs, Some(&self.state))
            }
        };
        Ok(SpecialistWrite {
            _gate: gate,
            state: rs.write_owned().await,
            created_in,
        })
    }

    /// Write-lock a specialist that must already exist; `missing` is reported otherwise.
    pub(super) async fn write_existing_specialist(
        &self,
        id: Ulid,
        missing: Ulid,
    ) -> Result<SpecialistWrite<'_>, EngineError> {
        let gate = self.compaction_gate.read().await;
        let rs = self
            .get_specialist(&id)
            .ok_or(EngineError::NotFound(missing))?;
        Ok(SpecialistWrite {
            _gate: gate,
            state: rs.write_owned().await,
            created_in: None,
        })
    }

    /// Lookup entity → specialist, then write-lock that specialist.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<SpecialistWrite<'_>, EngineError> {
        let specialist_id = self
            .get_specialist_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        self.write_existing_specialist(specialist_id, *entity_id).await
    }
}
