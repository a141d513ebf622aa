//! Crontab tick source.
//!
//! A registry of crontab expressions with a one-second tick loop; every
//! matching second emits the crontab string. Routing ticks to hooks is the
//! module manager's job.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{Timelike, Utc};
use cron::Schedule;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct ScheduleManager {
    entries: Mutex<HashMap<String, Schedule>>,
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    stop: CancellationToken,
}

impl ScheduleManager {
    pub fn new(stop: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        ScheduleManager { entries: Mutex::new(HashMap::new()), tx, rx: Mutex::new(Some(rx)), stop }
    }

    pub fn take_ticks(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.rx.lock().unwrap().take()
    }

    /// Register a crontab (6-field, seconds first). Idempotent.
    pub fn add(&self, crontab: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(crontab) {
            return Ok(());
        }
        let schedule = Schedule::from_str(crontab)
            .with_context(|| format!("bad crontab '{}'", crontab))?;
        info!(crontab, "schedule registered");
        entries.insert(crontab.to_string(), schedule);
        Ok(())
    }

    pub fn remove(&self, crontab: &str) {
        self.entries.lock().unwrap().remove(crontab);
    }

    /// Spawn the tick loop.
    pub fn start(self: &std::sync::Arc<Self>) {
        let this = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Utc::now().with_nanosecond(0).expect("zero nanosecond is valid");
                        let due: Vec<String> = {
                            let entries = this.entries.lock().unwrap();
                            entries
                                .iter()
                                .filter(|(_, s)| s.includes(now))
                                .map(|(c, _)| c.clone())
                                .collect()
                        };
                        for crontab in due {
                            debug!(crontab = %crontab, "schedule tick");
                            let _ = this.tx.send(crontab);
                        }
                    }
                    _ = this.stop.cancelled() => {
                        info!("schedule manager stopped");
                        return;
                    }
                }
            }
        });
    }
}
