//! Processing-job dispatch.
//!
//! When the cycle timer fires, the hub plans one job per catalogued plant and
//! hands the batch to a [`JobDispatcher`] on a detached task. Jobs run in
//! catalog order; a failing or hung job is logged and the next plant still
//! runs.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use crate::catalog::PlantCatalog;
use crate::config::DispatcherSection;
use crate::registry::{DeviceRegistry, Position};

// ---------------------------------------------------------------------------
// Job plan
// ---------------------------------------------------------------------------

/// A device taking part in a plant's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssignedDevice {
    pub device_id: u64,
    pub address: String,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlantJob {
    pub plant_index: u32,
    pub plant_name: String,
    pub devices: Vec<AssignedDevice>,
}

/// One job per plant, in catalog order. Plants without devices still get a
/// job; the pipeline decides what to do with an empty capture set.
pub fn plan_cycle(catalog: &PlantCatalog, registry: &DeviceRegistry) -> Vec<PlantJob> {
    catalog
        .iter()
        .map(|plant| PlantJob {
            plant_index: plant.index,
            plant_name: plant.name.clone(),
            devices: registry
                .assigned_to(plant.index)
                .into_iter()
                .map(|d| AssignedDevice {
                    device_id: d.id,
                    address: d.address.clone(),
                    position: d.position,
                })
                .collect(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Dispatcher trait + implementations
// ---------------------------------------------------------------------------

#[async_trait]
pub trait JobDispatcher: Send + Sync {
    /// Run the capture-and-analysis job for one plant.
    async fn run_cycle(&self, plant_index: u32, devices: &[AssignedDevice]) -> Result<()>;
}

/// Runs an external program once per plant:
/// `program [args..] <plant_index> [POSITION=address ..]`.
pub struct ProcessDispatcher {
    program: String,
    args: Vec<String>,
}

impl ProcessDispatcher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn job_args(&self, plant_index: u32, devices: &[AssignedDevice]) -> Vec<String> {
        let mut args = self.args.clone();
        args.push(plant_index.to_string());
        args.extend(
            devices
                .iter()
                .map(|d| format!("{}={}", d.position, d.address)),
        );
        args
    }
}

#[async_trait]
impl JobDispatcher for ProcessDispatcher {
    async fn run_cycle(&self, plant_index: u32, devices: &[AssignedDevice]) -> Result<()> {
        let args = self.job_args(plant_index, devices);
        let status = Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("failed to spawn {}", self.program))?;

        if !status.success() {
            bail!("{} exited with {status} for plant {plant_index}", self.program);
        }
        Ok(())
    }
}

/// Logs what would run. Used when no program is configured.
pub struct DryRunDispatcher;

#[async_trait]
impl JobDispatcher for DryRunDispatcher {
    async fn run_cycle(&self, plant_index: u32, devices: &[AssignedDevice]) -> Result<()> {
        info!(
            plant = plant_index,
            devices = devices.len(),
            "dispatch: dry run (no program configured)"
        );
        Ok(())
    }
}

pub fn from_config(section: &DispatcherSection) -> Arc<dyn JobDispatcher> {
    match section.program.as_deref() {
        Some(program) if !program.trim().is_empty() => {
            info!(program, "dispatch: using process dispatcher");
            Arc::new(ProcessDispatcher::new(program, section.args.clone()))
        }
        _ => {
            warn!("dispatch: no program configured, cycles will be dry runs");
            Arc::new(DryRunDispatcher)
        }
    }
}

// ---------------------------------------------------------------------------
// Batch runner
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub succeeded: Vec<u32>,
    pub failed: Vec<u32>,
    pub timed_out: Vec<u32>,
}

/// Run every job in order, each bounded by `job_timeout`. Never fails: every
/// result is logged and recorded in the outcome.
pub async fn run_batch(
    dispatcher: Arc<dyn JobDispatcher>,
    jobs: Vec<PlantJob>,
    job_timeout: Duration,
) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();

    for job in jobs {
        let run = dispatcher.run_cycle(job.plant_index, &job.devices);
        match tokio::time::timeout(job_timeout, run).await {
            Ok(Ok(())) => {
                info!(
                    plant = job.plant_index,
                    name = %job.plant_name,
                    devices = job.devices.len(),
                    "dispatch: job completed"
                );
                outcome.succeeded.push(job.plant_index);
            }
            Ok(Err(e)) => {
                warn!(plant = job.plant_index, name = %job.plant_name, "dispatch: job failed: {e:#}");
                outcome.failed.push(job.plant_index);
            }
            Err(_) => {
                warn!(
                    plant = job.plant_index,
                    name = %job.plant_name,
                    timeout_sec = job_timeout.as_secs(),
                    "dispatch: job timed out"
                );
                outcome.timed_out.push(job.plant_index);
            }
        }
    }

    outcome
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Records every call; plants in `fail` return an error, plants in
    /// `hang` never finish.
    #[derive(Default)]
    pub(crate) struct RecordingDispatcher {
        pub calls: Mutex<Vec<(u32, Vec<AssignedDevice>)>>,
        pub fail: HashSet<u32>,
        pub hang: HashSet<u32>,
    }

    impl RecordingDispatcher {
        pub fn plants(&self) -> Vec<u32> {
            self.calls.lock().unwrap().iter().map(|(p, _)| *p).collect()
        }
    }

    #[async_trait]
    impl JobDispatcher for RecordingDispatcher {
        async fn run_cycle(&self, plant_index: u32, devices: &[AssignedDevice]) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((plant_index, devices.to_vec()));
            if self.hang.contains(&plant_index) {
                std::future::pending::<()>().await;
            }
            if self.fail.contains(&plant_index) {
                bail!("camera offline");
            }
            Ok(())
        }
    }

    fn job(index: u32) -> PlantJob {
        PlantJob {
            plant_index: index,
            plant_name: format!("plant-{index}"),
            devices: vec![],
        }
    }

    // -- plan_cycle --------------------------------------------------------

    #[test]
    fn plan_follows_catalog_order_with_assigned_devices() {
        let mut catalog = PlantCatalog::new();
        catalog.add("Basil").unwrap();
        catalog.add("Mint").unwrap();

        let mut reg = DeviceRegistry::new();
        let a = reg.upsert_by_address("10.0.0.1", 1).id();
        let b = reg.upsert_by_address("10.0.0.2", 1).id();
        reg.upsert_by_address("10.0.0.3", 1);
        reg.reassign(a, 2, "Mint", Position::Y).unwrap();
        reg.reassign(b, 2, "Mint", Position::X).unwrap();

        let jobs = plan_cycle(&catalog, &reg);

        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].plant_index, 1);
        assert!(jobs[0].devices.is_empty());
        assert_eq!(jobs[1].plant_name, "Mint");
        let positions: Vec<Position> = jobs[1].devices.iter().map(|d| d.position).collect();
        assert_eq!(positions, vec![Position::X, Position::Y]);
        assert_eq!(jobs[1].devices[0].address, "10.0.0.2");
    }

    #[test]
    fn plan_empty_catalog_is_empty() {
        let reg = DeviceRegistry::new();
        assert!(plan_cycle(&PlantCatalog::new(), &reg).is_empty());
    }

    // -- run_batch ---------------------------------------------------------

    #[tokio::test]
    async fn batch_runs_every_plant_in_order() {
        let rec = Arc::new(RecordingDispatcher::default());
        let out = run_batch(rec.clone(), vec![job(1), job(2), job(3)], Duration::from_secs(5)).await;
        assert_eq!(rec.plants(), vec![1, 2, 3]);
        assert_eq!(out.succeeded, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn failure_does_not_stop_later_plants() {
        let rec = Arc::new(RecordingDispatcher {
            fail: HashSet::from([1]),
            ..Default::default()
        });
        let out = run_batch(rec.clone(), vec![job(1), job(2)], Duration::from_secs(5)).await;
        assert_eq!(rec.plants(), vec![1, 2]);
        assert_eq!(out.failed, vec![1]);
        assert_eq!(out.succeeded, vec![2]);
    }

    #[tokio::test]
    async fn timeout_does_not_stop_later_plants() {
        let rec = Arc::new(RecordingDispatcher {
            hang: HashSet::from([2]),
            ..Default::default()
        });
        let out = run_batch(
            rec.clone(),
            vec![job(1), job(2), job(3)],
            Duration::from_millis(50),
        )
        .await;
        assert_eq!(rec.plants(), vec![1, 2, 3]);
        assert_eq!(out.timed_out, vec![2]);
        assert_eq!(out.succeeded, vec![1, 3]);
    }

    // -- ProcessDispatcher -------------------------------------------------

    #[test]
    fn process_args_carry_plant_and_positions() {
        let d = ProcessDispatcher::new("capture", vec!["--fast".into()]);
        let devices = vec![
            AssignedDevice {
                device_id: 4,
                address: "10.0.0.4".into(),
                position: Position::X,
            },
            AssignedDevice {
                device_id: 7,
                address: "10.0.0.7".into(),
                position: Position::Z,
            },
        ];
        assert_eq!(
            d.job_args(3, &devices),
            vec!["--fast", "3", "X=10.0.0.4", "Z=10.0.0.7"]
        );
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let d = ProcessDispatcher::new("/nonexistent/plant-capture", vec![]);
        let err = d.run_cycle(1, &[]).await.unwrap_err();
        assert!(format!("{err:#}").contains("failed to spawn"));
    }

    #[tokio::test]
    async fn dry_run_always_succeeds() {
        assert!(DryRunDispatcher.run_cycle(1, &[]).await.is_ok());
    }
}
