//! The hub actor.
//!
//! One task owns the registry, catalog, cycle timer and ping inbox. Callers
//! reach it through a [`HubHandle`]: mutations travel over an mpsc channel
//! and are answered on a oneshot; reads come from the latest published
//! [`HubSnapshot`] and never wait on the actor.
//!
//! Each tick runs, in order: reconcile pings, sweep stale devices, persist
//! devices, evaluate the timer (persist anchor, then dispatch).

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::catalog::{Plant, PlantCatalog};
use crate::db::{Db, LoadReport};
use crate::dispatch::{plan_cycle, run_batch, BatchOutcome, JobDispatcher};
use crate::error::HubError;
use crate::reconcile::{reconcile, PingInbox};
use crate::registry::{Device, DeviceRegistry, Position};
use crate::scheduler::{
    now_unix, CycleStatus, CycleTimer, Evaluation, FireReason, DEFAULT_CYCLE_DURATION_SEC,
    MAX_CYCLE_DURATION_SEC, TICK_INTERVAL,
};
use crate::state::{EventKind, EventLog, HubSnapshot};
use crate::sweeper::{sweep, LIVENESS_WINDOW_SEC};

const COMMAND_BUFFER: usize = 64;

// ---------------------------------------------------------------------------
// Options + commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HubOptions {
    /// Upper bound for a single plant's processing job.
    pub job_timeout: Duration,
    /// Cycle length used when no timer is persisted.
    pub default_cycle_duration: i64,
    pub liveness_window: i64,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(300),
            default_cycle_duration: DEFAULT_CYCLE_DURATION_SEC,
            liveness_window: LIVENESS_WINDOW_SEC,
        }
    }
}

type Reply<T> = oneshot::Sender<T>;

#[derive(Debug)]
pub enum Command {
    ReportPing {
        address: String,
        reply: Reply<bool>,
    },
    AssignDevice {
        device_id: u64,
        plant_index: u32,
        position: Position,
        reply: Reply<Result<Device, HubError>>,
    },
    AddPlant {
        name: String,
        reply: Reply<Result<Plant, HubError>>,
    },
    SetCycleDuration {
        seconds: i64,
        reply: Reply<Result<CycleStatus, HubError>>,
    },
    StartCycle {
        reply: Reply<CycleStatus>,
    },
    ResetCycle {
        reply: Reply<CycleStatus>,
    },
    SetDeviceCommand {
        device_id: u64,
        command: String,
        reply: Reply<Result<(), HubError>>,
    },
    Shutdown,
}

/// What a single tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub created: Vec<u64>,
    pub refreshed: usize,
    pub evicted: Vec<u64>,
    pub fired: Option<FireReason>,
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

pub struct Hub {
    registry: DeviceRegistry,
    catalog: PlantCatalog,
    timer: CycleTimer,
    inbox: PingInbox,
    events: EventLog,

    db: Db,
    dispatcher: Arc<dyn JobDispatcher>,
    jobs: JoinSet<BatchOutcome>,
    opts: HubOptions,

    catalog_dirty: bool,
    timer_dirty: bool,

    started_at: std::time::Instant,
    snapshot_tx: watch::Sender<Arc<HubSnapshot>>,
}

impl Hub {
    /// Restore state from the database. A failed load starts empty; rows
    /// that cannot be decoded are skipped with a warning.
    pub async fn load(db: Db, dispatcher: Arc<dyn JobDispatcher>, opts: HubOptions) -> Self {
        let report = match db.load_state().await {
            Ok(report) => report,
            Err(e) => {
                error!("hub: failed to load persisted state, starting empty: {e:#}");
                LoadReport::default()
            }
        };
        let LoadReport {
            devices,
            plants,
            timer,
            skipped,
        } = report;

        for s in &skipped {
            warn!(table = s.table, key = ?s.key, "hub: skipped malformed record: {}", s.reason);
        }

        let timer_dirty = timer.is_none();
        let timer = timer.unwrap_or_else(|| CycleTimer::new(opts.default_cycle_duration));
        let registry = DeviceRegistry::restore(devices);
        let catalog = PlantCatalog::restore(plants);

        info!(
            devices = registry.len(),
            plants = catalog.len(),
            next_id = registry.next_id(),
            anchor = timer.anchor,
            duration = timer.duration,
            skipped = skipped.len(),
            "hub: state restored"
        );

        let mut events = EventLog::new();
        events.record(
            EventKind::System,
            format!(
                "hub started with {} device(s), {} plant(s)",
                registry.len(),
                catalog.len()
            ),
        );
        if !skipped.is_empty() {
            events.record(
                EventKind::Error,
                format!("{} malformed record(s) skipped on load", skipped.len()),
            );
        }

        let (snapshot_tx, _) = watch::channel(Arc::new(HubSnapshot::empty(timer)));

        let mut hub = Self {
            registry,
            catalog,
            timer,
            inbox: PingInbox::new(),
            events,
            db,
            dispatcher,
            jobs: JoinSet::new(),
            opts,
            catalog_dirty: false,
            timer_dirty,
            started_at: std::time::Instant::now(),
            snapshot_tx,
        };
        hub.publish(now_unix());
        hub
    }

    /// Add configured plants that are not catalogued yet. Returns how many
    /// were added.
    pub fn seed_plants(&mut self, names: &[String]) -> usize {
        let mut added = 0;
        for name in names {
            if self.catalog.contains_name(name.trim()) {
                continue;
            }
            match self.catalog.add(name) {
                Ok(plant) => {
                    info!(index = plant.index, name = %plant.name, "hub: seeded plant");
                    added += 1;
                }
                Err(e) => warn!(name = %name, "hub: cannot seed plant: {e}"),
            }
        }
        if added > 0 {
            self.catalog_dirty = true;
            self.events
                .record(EventKind::Plant, format!("{added} plant(s) seeded from config"));
        }
        added
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    pub async fn tick(&mut self, now: i64) -> TickReport {
        self.reap_jobs();

        // Reconcile
        self.registry.begin_cycle();
        let pings = self.inbox.drain();
        let rec = reconcile(&mut self.registry, pings, now);
        for id in &rec.created {
            if let Some(d) = self.registry.get(*id) {
                info!(device_id = id, address = %d.address, "hub: new device");
                self.events
                    .record(EventKind::Device, format!("device {id} created at {}", d.address));
            }
        }

        // Sweep
        let evicted = sweep(&mut self.registry, now, self.opts.liveness_window);
        for d in &evicted {
            self.events.record(
                EventKind::Device,
                format!("device {} ({}) evicted after {}s silent", d.id, d.address, now - d.last_seen),
            );
        }

        // Persist
        if let Err(e) = self.db.save_devices(&self.registry.list()).await {
            warn!("hub: failed to persist devices: {e:#}");
            self.events
                .record(EventKind::Error, format!("device save failed: {e}"));
        }
        self.flush_catalog().await;

        // Schedule
        let fired = match self.timer.tick(now) {
            Evaluation::Fire(reason) => {
                self.timer_dirty = true;
                self.flush_timer().await;
                self.dispatch(reason);
                Some(reason)
            }
            Evaluation::Wait { remaining } => {
                debug!(remaining, "scheduler: cycle not due");
                None
            }
        };
        self.flush_timer().await;

        self.publish(now);

        TickReport {
            created: rec.created,
            refreshed: rec.refreshed.len(),
            evicted: evicted.iter().map(|d| d.id).collect(),
            fired,
        }
    }

    fn dispatch(&mut self, reason: FireReason) {
        let jobs = plan_cycle(&self.catalog, &self.registry);
        info!(
            ?reason,
            plants = jobs.len(),
            anchor = self.timer.anchor,
            "scheduler: cycle fired"
        );
        self.events.record(
            EventKind::Cycle,
            format!("cycle fired ({reason:?}) for {} plant(s)", jobs.len()),
        );
        if jobs.is_empty() {
            return;
        }
        self.jobs
            .spawn(run_batch(self.dispatcher.clone(), jobs, self.opts.job_timeout));
    }

    fn reap_jobs(&mut self) {
        while let Some(result) = self.jobs.try_join_next() {
            match result {
                Ok(outcome) => {
                    info!(
                        succeeded = outcome.succeeded.len(),
                        failed = outcome.failed.len(),
                        timed_out = outcome.timed_out.len(),
                        "dispatch: batch finished"
                    );
                    if !outcome.failed.is_empty() || !outcome.timed_out.is_empty() {
                        self.events.record(
                            EventKind::Error,
                            format!(
                                "dispatch: plants failed {:?}, timed out {:?}",
                                outcome.failed, outcome.timed_out
                            ),
                        );
                    }
                }
                Err(e) => warn!("dispatch: batch task ended abnormally: {e}"),
            }
        }
    }

    async fn flush_catalog(&mut self) {
        if !self.catalog_dirty {
            return;
        }
        match self.db.save_plants(&self.catalog.list()).await {
            Ok(()) => self.catalog_dirty = false,
            Err(e) => {
                warn!("hub: failed to persist plants, will retry: {e:#}");
                self.events
                    .record(EventKind::Error, format!("plant save failed: {e}"));
            }
        }
    }

    async fn flush_timer(&mut self) {
        if !self.timer_dirty {
            return;
        }
        match self.db.save_timer(&self.timer).await {
            Ok(()) => self.timer_dirty = false,
            Err(e) => {
                warn!("hub: failed to persist cycle timer, will retry: {e:#}");
                self.events
                    .record(EventKind::Error, format!("timer save failed: {e}"));
            }
        }
    }

    fn publish(&self, now: i64) {
        let snapshot = HubSnapshot {
            started_at: self.started_at,
            taken_at: now,
            devices: self.registry.list(),
            plants: self.catalog.list(),
            timer: self.timer,
            pending_pings: self.inbox.len(),
            events: self.events.recent(),
        };
        self.snapshot_tx.send_replace(Arc::new(snapshot));
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Apply one command, publish the new state, then answer the caller.
    pub async fn handle(&mut self, cmd: Command, now: i64) {
        match cmd {
            Command::ReportPing { address, reply } => {
                let queued = self.inbox.report(&address);
                self.publish(now);
                let _ = reply.send(queued);
            }
            Command::AssignDevice {
                device_id,
                plant_index,
                position,
                reply,
            } => {
                let result = self.assign_device(device_id, plant_index, position);
                self.publish(now);
                let _ = reply.send(result);
            }
            Command::AddPlant { name, reply } => {
                let result = self.add_plant(&name);
                self.flush_catalog().await;
                self.publish(now);
                let _ = reply.send(result);
            }
            Command::SetCycleDuration { seconds, reply } => {
                let result = if !(1..=MAX_CYCLE_DURATION_SEC).contains(&seconds) {
                    Err(HubError::InvalidDuration(seconds))
                } else {
                    self.timer.set_duration(seconds);
                    self.timer_changed(format!("cycle duration set to {seconds}s"))
                        .await;
                    Ok(self.timer.status(now))
                };
                self.publish(now);
                let _ = reply.send(result);
            }
            Command::StartCycle { reply } => {
                self.timer.start(now);
                self.timer_changed("cycle started".to_string()).await;
                self.publish(now);
                let _ = reply.send(self.timer.status(now));
            }
            Command::ResetCycle { reply } => {
                self.timer.reset();
                self.timer_changed("cycle reset".to_string()).await;
                self.publish(now);
                let _ = reply.send(self.timer.status(now));
            }
            Command::SetDeviceCommand {
                device_id,
                command,
                reply,
            } => {
                let result = self.registry.set_command(device_id, &command);
                if result.is_ok() {
                    info!(device_id, command = %command, "hub: device command set");
                }
                self.publish(now);
                let _ = reply.send(result);
            }
            Command::Shutdown => {}
        }
    }

    fn assign_device(
        &mut self,
        device_id: u64,
        plant_index: u32,
        position: Position,
    ) -> Result<Device, HubError> {
        let plant = self
            .catalog
            .get(plant_index)
            .ok_or(HubError::UnknownPlant(plant_index))?;
        let displaced = self
            .registry
            .reassign(device_id, plant.index, &plant.name, position)?;

        info!(
            device_id,
            plant = plant_index,
            %position,
            displaced = ?displaced,
            "hub: device assigned"
        );
        self.events.record(
            EventKind::Device,
            format!("device {device_id} assigned to plant {plant_index} position {position}"),
        );
        for id in displaced {
            self.events.record(
                EventKind::Device,
                format!("device {id} unassigned (slot taken by {device_id})"),
            );
        }

        self.registry
            .get(device_id)
            .cloned()
            .ok_or(HubError::UnknownDevice(device_id))
    }

    fn add_plant(&mut self, name: &str) -> Result<Plant, HubError> {
        let plant = self.catalog.add(name)?.clone();
        info!(index = plant.index, name = %plant.name, "hub: plant added");
        self.events.record(
            EventKind::Plant,
            format!("plant {} '{}' added", plant.index, plant.name),
        );
        self.catalog_dirty = true;
        Ok(plant)
    }

    async fn timer_changed(&mut self, detail: String) {
        info!(
            anchor = self.timer.anchor,
            duration = self.timer.duration,
            "scheduler: {detail}"
        );
        self.events.record(EventKind::Cycle, detail);
        self.timer_dirty = true;
        self.flush_timer().await;
    }

    // -----------------------------------------------------------------------
    // Actor loop
    // -----------------------------------------------------------------------

    /// Move the hub onto its own task.
    pub fn spawn(self) -> (HubHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = HubHandle {
            tx,
            snapshot: self.snapshot_tx.subscribe(),
        };
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("hub: running");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick(now_unix()).await;
                    debug!(
                        created = report.created.len(),
                        refreshed = report.refreshed,
                        evicted = report.evicted.len(),
                        fired = ?report.fired,
                        "hub: tick"
                    );
                }
                cmd = rx.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle(cmd, now_unix()).await,
                },
            }
        }

        self.stop().await;
    }

    async fn stop(&mut self) {
        if !self.jobs.is_empty() {
            warn!(jobs = self.jobs.len(), "hub: abandoning in-flight dispatch jobs");
            self.jobs.abort_all();
        }
        if let Err(e) = self.db.save_devices(&self.registry.list()).await {
            warn!("hub: final device save failed: {e:#}");
        }
        self.flush_catalog().await;
        self.flush_timer().await;
        info!("hub: stopped");
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cheap, cloneable access to a running hub.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Arc<HubSnapshot>>,
}

impl HubHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, HubError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| HubError::Stopped)?;
        rx.await.map_err(|_| HubError::Stopped)
    }

    /// Queue a liveness report; it is reconciled on the next tick.
    pub async fn report_ping(&self, address: impl Into<String>) -> Result<bool, HubError> {
        let address = address.into();
        self.request(|reply| Command::ReportPing { address, reply })
            .await
    }

    pub async fn assign_device(
        &self,
        device_id: u64,
        plant_index: u32,
        position: Position,
    ) -> Result<Device, HubError> {
        self.request(|reply| Command::AssignDevice {
            device_id,
            plant_index,
            position,
            reply,
        })
        .await?
    }

    pub async fn add_plant(&self, name: impl Into<String>) -> Result<Plant, HubError> {
        let name = name.into();
        self.request(|reply| Command::AddPlant { name, reply }).await?
    }

    pub async fn set_cycle_duration(&self, seconds: i64) -> Result<CycleStatus, HubError> {
        self.request(|reply| Command::SetCycleDuration { seconds, reply })
            .await?
    }

    pub async fn start_cycle(&self) -> Result<CycleStatus, HubError> {
        self.request(|reply| Command::StartCycle { reply }).await
    }

    pub async fn reset_cycle(&self) -> Result<CycleStatus, HubError> {
        self.request(|reply| Command::ResetCycle { reply }).await
    }

    pub async fn set_device_command(
        &self,
        device_id: u64,
        command: impl Into<String>,
    ) -> Result<(), HubError> {
        let command = command.into();
        self.request(|reply| Command::SetDeviceCommand {
            device_id,
            command,
            reply,
        })
        .await?
    }

    pub fn snapshot(&self) -> Arc<HubSnapshot> {
        self.snapshot.borrow().clone()
    }

    /// `None` for unknown devices.
    pub fn get_device_command(&self, device_id: u64) -> Option<String> {
        self.snapshot()
            .device_command(device_id)
            .map(str::to_string)
    }

    pub fn list_devices(&self) -> Vec<Device> {
        self.snapshot().devices.clone()
    }

    pub fn list_plants(&self) -> Vec<Plant> {
        self.snapshot().plants.clone()
    }

    pub fn get_cycle_status(&self) -> CycleStatus {
        self.snapshot().cycle_status(now_unix())
    }

    /// Ask the hub to stop. In-flight dispatch jobs are abandoned.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
