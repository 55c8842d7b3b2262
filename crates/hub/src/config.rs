//! TOML config file loading, validation, and startup seeding of the hub.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::hub::{Hub, HubOptions};
use crate::scheduler::{DEFAULT_CYCLE_DURATION_SEC, MAX_CYCLE_DURATION_SEC};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cycle: CycleSection,
    #[serde(default)]
    pub dispatcher: DispatcherSection,
    #[serde(default)]
    pub plants: Vec<PlantEntry>,
}

#[derive(Debug, Deserialize)]
pub struct CycleSection {
    /// Cycle length used when no timer has been persisted yet.
    #[serde(default = "default_cycle_duration")]
    pub duration_sec: i64,
}

impl Default for CycleSection {
    fn default() -> Self {
        Self {
            duration_sec: default_cycle_duration(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DispatcherSection {
    /// Program run once per plant when a cycle fires. Unset means dry run.
    #[serde(default)]
    pub program: Option<String>,
    /// Leading arguments passed before the plant number.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_job_timeout")]
    pub job_timeout_sec: u64,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            job_timeout_sec: default_job_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PlantEntry {
    pub name: String,
}

fn default_cycle_duration() -> i64 {
    DEFAULT_CYCLE_DURATION_SEC
}

fn default_job_timeout() -> u64 {
    300
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_cycle(&mut errors);
        self.validate_dispatcher(&mut errors);
        self.validate_plants(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_cycle(&self, errors: &mut Vec<String>) {
        let d = self.cycle.duration_sec;
        if d <= 0 {
            errors.push(format!("cycle: duration_sec must be positive, got {d}"));
        } else if d > MAX_CYCLE_DURATION_SEC {
            errors.push(format!(
                "cycle: duration_sec must be at most {MAX_CYCLE_DURATION_SEC}, got {d}"
            ));
        }
    }

    fn validate_dispatcher(&self, errors: &mut Vec<String>) {
        let d = &self.dispatcher;
        if let Some(program) = &d.program {
            if program.trim().is_empty() {
                errors.push("dispatcher: program is empty (omit it for dry runs)".to_string());
            }
        } else if !d.args.is_empty() {
            errors.push("dispatcher: args given without a program".to_string());
        }
        if d.job_timeout_sec == 0 {
            errors.push("dispatcher: job_timeout_sec must be positive".to_string());
        }
    }

    fn validate_plants(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<&str> = HashSet::new();
        for (i, p) in self.plants.iter().enumerate() {
            let name = p.name.trim();
            if name.is_empty() {
                errors.push(format!("plants[{i}]: name is empty"));
            } else if !seen.insert(name) {
                errors.push(format!("plant '{name}': duplicate name"));
            }
        }
    }

    pub fn hub_options(&self) -> HubOptions {
        HubOptions {
            job_timeout: Duration::from_secs(self.dispatcher.job_timeout_sec),
            default_cycle_duration: self.cycle.duration_sec,
            ..HubOptions::default()
        }
    }

    pub fn plant_names(&self) -> Vec<String> {
        self.plants.iter().map(|p| p.name.trim().to_string()).collect()
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Like [`load`], but a missing file yields the defaults.
pub fn load_or_default(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        info!(path, "config file not found, using defaults");
        return Ok(Config::default());
    }
    load(path)
}

/// Seed configured plants into the hub's catalog. Returns how many were
/// new.
pub fn apply(config: &Config, hub: &mut Hub) -> usize {
    let added = hub.seed_plants(&config.plant_names());

    info!(
        plants = config.plants.len(),
        added,
        "config applied"
    );

    added
}

// ===========================================================================
// Tests
// ===========================================================================
