//! File-backed alarm service.
//!
//! Registrations live in a JSON spool under the runtime directory, which is
//! a tmpfs on most systems: the spool survives process death and is wiped
//! by a reboot, just like OS alarms. The spool also records the simulated
//! permission flags and the version of the build that last touched it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use reveille_engine::{
    AlarmService, Exactness, NotificationId, PlatformError, Repeat, TriggerRegistration,
    TriggerRoute,
};
use reveille_store::FileLock;

/// Current spool format version.
const SPOOL_VERSION: u32 = 1;

/// Errors reading or writing the spool.
#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported spool version {0}")]
    UnsupportedVersion(u32),
}

impl From<SpoolError> for PlatformError {
    fn from(e: SpoolError) -> Self {
        PlatformError::Io(e.to_string())
    }
}

/// One spooled trigger. The id is the map key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SpoolRecord {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    fire_at: DateTime<Utc>,
    exactness: Exactness,
    repeat: Repeat,
    route: TriggerRoute,
    /// Base64 of the opaque payload.
    payload: String,
}

/// Spool file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SpoolFile {
    version: u32,
    /// Version of the build that last wrote the spool.
    #[serde(default)]
    app_version: Option<String>,
    #[serde(default = "default_true")]
    exact_permitted: bool,
    #[serde(default)]
    battery_exempt: bool,
    #[serde(default)]
    triggers: BTreeMap<NotificationId, SpoolRecord>,
}

fn default_true() -> bool {
    true
}

impl Default for SpoolFile {
    fn default() -> Self {
        Self {
            version: SPOOL_VERSION,
            app_version: None,
            exact_permitted: true,
            battery_exempt: false,
            triggers: BTreeMap::new(),
        }
    }
}

impl SpoolFile {
    /// A corrupt payload is handed on empty: the trigger still fires and
    /// renders the default text, and reconciliation sees it as stale.
    fn registration(id: NotificationId, record: &SpoolRecord) -> TriggerRegistration {
        let payload = STANDARD.decode(&record.payload).unwrap_or_else(|e| {
            warn!(%id, error = %e, "corrupt spooled payload, delivering without it");
            Vec::new()
        });
        TriggerRegistration {
            id,
            fire_at: record.fire_at,
            exactness: record.exactness,
            repeat: record.repeat,
            route: record.route,
            payload,
        }
    }

    fn registrations(&self) -> Vec<TriggerRegistration> {
        self.triggers
            .iter()
            .map(|(id, record)| Self::registration(*id, record))
            .collect()
    }

    fn insert(&mut self, trigger: &TriggerRegistration) {
        self.triggers.insert(
            trigger.id,
            SpoolRecord {
                fire_at: trigger.fire_at,
                exactness: trigger.exactness,
                repeat: trigger.repeat,
                route: trigger.route,
                payload: STANDARD.encode(&trigger.payload),
            },
        );
    }
}

/// When a trigger is actually delivered.
///
/// Inexact triggers are batched to the next whole minute unless the battery
/// optimization exemption has been granted.
pub fn delivery_time(trigger: &TriggerRegistration, battery_exempt: bool) -> DateTime<Utc> {
    if trigger.exactness == Exactness::Exact || battery_exempt {
        return trigger.fire_at;
    }
    match trigger.fire_at.duration_trunc(Duration::minutes(1)) {
        Ok(minute) if minute < trigger.fire_at => minute + Duration::minutes(1),
        _ => trigger.fire_at,
    }
}

/// Alarm service backed by a JSON spool file.
///
/// Writers hold a [`FileLock`] so the CLI and the daemon can share the spool.
#[derive(Debug)]
pub struct SpoolAlarmService {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SpoolAlarmService {
    /// Open the spool at the default or specified path.
    pub fn open(path: Option<PathBuf>) -> Self {
        Self {
            path: path.unwrap_or_else(Self::default_path),
            write_lock: Mutex::new(()),
        }
    }

    /// Get the default spool path.
    pub fn default_path() -> PathBuf {
        dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("reveille")
            .join("alarms.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the spool file exists. A missing spool means the machine
    /// rebooted since the last run, or nothing ever ran.
    pub async fn exists(&self) -> bool {
        fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Version of the build that last stamped the spool.
    pub async fn app_version(&self) -> Result<Option<String>, SpoolError> {
        Ok(self.read_file().await?.app_version)
    }

    /// Record `version` as the build now owning the spool.
    pub async fn stamp_app_version(&self, version: &str) -> Result<(), SpoolError> {
        self.update(|file| file.app_version = Some(version.to_string()))
            .await
    }

    pub async fn set_exact_permission(&self, permitted: bool) -> Result<(), SpoolError> {
        self.update(|file| file.exact_permitted = permitted).await
    }

    pub async fn set_battery_exempt(&self, exempt: bool) -> Result<(), SpoolError> {
        self.update(|file| file.battery_exempt = exempt).await
    }

    pub async fn battery_exempt(&self) -> Result<bool, SpoolError> {
        Ok(self.read_file().await?.battery_exempt)
    }

    /// Remove and return every trigger delivered by `now`, re-arming daily ones.
    pub async fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<TriggerRegistration>, SpoolError> {
        let _lock = self.lock().await?;
        let mut file = self.read_file().await?;

        let mut due = Vec::new();
        for trigger in file.registrations() {
            if delivery_time(&trigger, file.battery_exempt) <= now {
                due.push(trigger);
            }
        }
        if due.is_empty() {
            return Ok(due);
        }

        for fired in &due {
            match fired.after_fire(now) {
                Some(next) => file.insert(&next),
                None => {
                    file.triggers.remove(&fired.id);
                }
            }
        }
        self.write_file(&file).await?;
        debug!(count = due.len(), "took due triggers");
        Ok(due)
    }

    /// Serialize writers in this process and in every other one.
    async fn lock(&self) -> Result<(MutexGuard<'_, ()>, FileLock), SpoolError> {
        let guard = self.write_lock.lock().await;
        let lock = FileLock::acquire(&self.path).await?;
        Ok((guard, lock))
    }

    async fn update(&self, change: impl FnOnce(&mut SpoolFile)) -> Result<(), SpoolError> {
        let _lock = self.lock().await?;
        let mut file = self.read_file().await?;
        change(&mut file);
        self.write_file(&file).await
    }

    async fn read_file(&self) -> Result<SpoolFile, SpoolError> {
        if !fs::try_exists(&self.path).await? {
            return Ok(SpoolFile::default());
        }

        let content = fs::read_to_string(&self.path).await?;
        let file: SpoolFile = serde_json::from_str(&content)?;
        if file.version != SPOOL_VERSION {
            return Err(SpoolError::UnsupportedVersion(file.version));
        }
        Ok(file)
    }

    async fn write_file(&self, file: &SpoolFile) -> Result<(), SpoolError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(file)?;
        let tmp_path = self.path.with_extension("json.tmp");
        let mut tmp = fs::File::create(&tmp_path).await?;
        tmp.write_all(content.as_bytes()).await?;
        tmp.sync_all().await?;
        drop(tmp);
        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl AlarmService for SpoolAlarmService {
    async fn register(&self, trigger: TriggerRegistration) -> Result<(), PlatformError> {
        let _lock = self.lock().await?;
        let mut file = self.read_file().await?;
        if trigger.exactness == Exactness::Exact && !file.exact_permitted {
            return Err(PlatformError::PermissionDenied);
        }
        file.insert(&trigger);
        self.write_file(&file).await?;
        Ok(())
    }

    async fn cancel(&self, id: NotificationId) -> Result<(), PlatformError> {
        let _lock = self.lock().await?;
        let mut file = self.read_file().await?;
        if file.triggers.remove(&id).is_some() {
            self.write_file(&file).await?;
        }
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<TriggerRegistration>, PlatformError> {
        Ok(self.read_file().await?.registrations())
    }

    async fn exact_permission(&self) -> bool {
        match self.read_file().await {
            Ok(file) => file.exact_permitted,
            Err(e) => {
                warn!(error = %e, "cannot read spool, assuming no exact permission");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn spool(dir: &TempDir) -> SpoolAlarmService {
        SpoolAlarmService::open(Some(dir.path().join("run").join("alarms.json")))
    }

    fn trigger(id: i32, fire_at: DateTime<Utc>, exactness: Exactness) -> TriggerRegistration {
        TriggerRegistration {
            id: NotificationId::new(id),
            fire_at,
            exactness,
            repeat: Repeat::Never,
            route: TriggerRoute::Render,
            payload: vec![0xa5, 0x00, 0xff, id as u8],
        }
    }

    #[tokio::test]
    async fn test_missing_spool_is_empty_and_permitted() {
        let dir = TempDir::new().unwrap();
        let spool = spool(&dir);
        assert!(!spool.exists().await);
        assert!(spool.pending().await.unwrap().is_empty());
        assert!(spool.exact_permission().await);
    }

    #[tokio::test]
    async fn test_registrations_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let at = Utc.timestamp_millis_opt(1_900_000_000_000).unwrap();
        spool(&dir)
            .register(trigger(3, at, Exactness::Exact))
            .await
            .unwrap();

        let reopened = spool(&dir);
        assert!(reopened.exists().await);
        assert_eq!(
            reopened.pending().await.unwrap(),
            vec![trigger(3, at, Exactness::Exact)]
        );
    }

    #[tokio::test]
    async fn test_register_replaces_and_cancel_removes() {
        let dir = TempDir::new().unwrap();
        let spool = spool(&dir);
        let at = Utc::now() + Duration::hours(1);
        spool.register(trigger(1, at, Exactness::Exact)).await.unwrap();
        spool
            .register(trigger(1, at + Duration::hours(1), Exactness::Inexact))
            .await
            .unwrap();

        let pending = spool.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].exactness, Exactness::Inexact);

        spool.cancel(NotificationId::new(1)).await.unwrap();
        spool.cancel(NotificationId::new(1)).await.unwrap();
        assert!(spool.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exact_refused_without_permission() {
        let dir = TempDir::new().unwrap();
        let spool = spool(&dir);
        spool.set_exact_permission(false).await.unwrap();

        let err = spool
            .register(trigger(1, Utc::now(), Exactness::Exact))
            .await
            .unwrap_err();
        assert_eq!(err, PlatformError::PermissionDenied);
        spool
            .register(trigger(1, Utc::now(), Exactness::Inexact))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_take_due_consumes_one_shot_and_rearms_daily() {
        let dir = TempDir::new().unwrap();
        let spool = spool(&dir);
        let now = Utc::now();
        let mut daily = trigger(2, now - Duration::minutes(1), Exactness::Exact);
        daily.repeat = Repeat::Daily;
        spool
            .register(trigger(1, now - Duration::seconds(5), Exactness::Exact))
            .await
            .unwrap();
        spool.register(daily).await.unwrap();
        spool
            .register(trigger(3, now + Duration::hours(1), Exactness::Exact))
            .await
            .unwrap();

        let due: Vec<_> = spool.take_due(now).await.unwrap().iter().map(|t| t.id.get()).collect();
        assert_eq!(due, vec![1, 2]);

        let left = spool.pending().await.unwrap();
        let ids: Vec<_> = left.iter().map(|t| t.id.get()).collect();
        assert_eq!(ids, vec![2, 3]);
        assert!(left[0].fire_at > now);
    }

    #[tokio::test]
    async fn test_corrupt_payload_does_not_block_other_triggers() {
        let dir = TempDir::new().unwrap();
        let spool = spool(&dir);
        let now = Utc::now();
        spool
            .register(trigger(1, now - Duration::seconds(2), Exactness::Exact))
            .await
            .unwrap();
        spool
            .register(trigger(2, now - Duration::seconds(1), Exactness::Exact))
            .await
            .unwrap();

        // Damage the first record on disk
        let mut raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(spool.path()).await.unwrap()).unwrap();
        raw["triggers"]["1"]["payload"] = serde_json::Value::from("%%% not base64 %%%");
        fs::write(spool.path(), raw.to_string()).await.unwrap();

        assert_eq!(spool.pending().await.unwrap().len(), 2);

        let due = spool.take_due(now).await.unwrap();
        assert_eq!(due.len(), 2);
        assert!(due[0].payload.is_empty());
        assert_eq!(due[1], trigger(2, due[1].fire_at, Exactness::Exact));
        assert!(spool.pending().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_handles_share_the_spool_safely() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run").join("alarms.json");
        let handles = [
            std::sync::Arc::new(SpoolAlarmService::open(Some(path.clone()))),
            std::sync::Arc::new(SpoolAlarmService::open(Some(path.clone()))),
        ];
        let at = Utc::now() + Duration::hours(1);

        let mut tasks = Vec::new();
        for id in 0..20 {
            let spool = std::sync::Arc::clone(&handles[id as usize % 2]);
            tasks.push(tokio::spawn(async move {
                spool.register(trigger(id, at, Exactness::Exact)).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let reopened = SpoolAlarmService::open(Some(path));
        assert_eq!(reopened.pending().await.unwrap().len(), 20);
    }

    #[test]
    fn test_inexact_batched_to_next_minute() {
        let at = Utc.with_ymd_and_hms(2030, 1, 1, 8, 0, 10).unwrap();
        let next_minute = Utc.with_ymd_and_hms(2030, 1, 1, 8, 1, 0).unwrap();

        assert_eq!(delivery_time(&trigger(1, at, Exactness::Exact), false), at);
        assert_eq!(
            delivery_time(&trigger(1, at, Exactness::Inexact), false),
            next_minute
        );
        assert_eq!(delivery_time(&trigger(1, at, Exactness::Inexact), true), at);
    }

    #[tokio::test]
    async fn test_version_stamp_and_flags_persist() {
        let dir = TempDir::new().unwrap();
        let spool = spool(&dir);
        assert_eq!(spool.app_version().await.unwrap(), None);

        spool.stamp_app_version("1.2.3").await.unwrap();
        spool.set_battery_exempt(true).await.unwrap();

        let reopened = SpoolAlarmService::open(Some(spool.path().to_path_buf()));
        assert_eq!(reopened.app_version().await.unwrap().as_deref(), Some("1.2.3"));
        assert!(reopened.battery_exempt().await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_version_rejected() {
        let dir = TempDir::new().unwrap();
        let spool = spool(&dir);
        fs::create_dir_all(spool.path().parent().unwrap()).await.unwrap();
        fs::write(spool.path(), r#"{"version": 9, "triggers": {}}"#)
            .await
            .unwrap();

        assert!(matches!(
            spool.pending().await,
            Err(PlatformError::Io(_))
        ));
        assert!(!spool.exact_permission().await);
    }
}
