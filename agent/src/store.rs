//! Last-known-location persistence: a small JSON record on disk plus a
//! mirror into a key-value store, updated only when a fix improves on what
//! is already held. The GPS loop is the single writer.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use telit_modem::GpsFix;
use tracing::{debug, info};

/// The persisted location record. Coordinates are rounded to 4 decimal
/// places; finer digits are noise at consumer resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastKnownLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub hdop: f64,
}

impl LastKnownLocation {
    pub fn from_fix(fix: &GpsFix) -> Self {
        Self {
            latitude: round4(fix.latitude),
            longitude: round4(fix.longitude),
            altitude: fix.altitude,
            hdop: fix.hdop,
        }
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Settable/gettable store for last-known state. The daemon mirrors the
/// location record into one of these for other processes to consume.
pub trait KvStore: Send {
    fn set(&mut self, key: &str, value: &str) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<String>>;
}

/// File-backed [`KvStore`]: one flat JSON object, written through on every
/// set.
pub struct FileKvStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl FileKvStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .wrap_err_with(|| format!("corrupt kv store {}", path.display()))?,
            Err(_) => BTreeMap::new(),
        };
        Ok(Self { path, entries })
    }
}

impl KvStore for FileKvStore {
    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_owned(), value.to_owned());
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let text = serde_json::to_string(&self.entries)?;
        fs::write(&self.path, text)
            .wrap_err_with(|| format!("writing kv store {}", self.path.display()))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).cloned())
    }
}

/// Holds the current best location and decides whether a new fix supersedes
/// it.
///
/// A record seeded from a provisioned file is marked as such and is always
/// superseded by the first decoded fix, whatever its HDOP; the camera may
/// have moved since the seed was written. Real records are only replaced by
/// a fix whose HDOP is at least as good.
pub struct LocationStore {
    path: PathBuf,
    kv: Option<Box<dyn KvStore>>,
    current: Option<LastKnownLocation>,
    seeded: bool,
}

impl LocationStore {
    /// Opens the store over the given cache file, loading any record a
    /// previous run left behind.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let current = fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok());
        Self {
            path,
            kv: None,
            current,
            seeded: false,
        }
    }

    /// Attaches a key-value store to mirror accepted records into.
    #[must_use]
    pub fn with_kv(mut self, kv: Box<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn current(&self) -> Option<&LastKnownLocation> {
        self.current.as_ref()
    }

    /// Seeds from a provisioned location file, if one exists. Returns true
    /// when a seed was loaded.
    pub fn seed_from_file(&mut self, src: &Path) -> Result<bool> {
        let Ok(text) = fs::read_to_string(src) else {
            return Ok(false);
        };
        let seed: LastKnownLocation = serde_json::from_str(&text)
            .wrap_err_with(|| format!("corrupt seed file {}", src.display()))?;
        info!(
            latitude = seed.latitude,
            longitude = seed.longitude,
            "seeding location from provisioned record"
        );
        self.persist(&seed)?;
        self.current = Some(seed);
        self.seeded = true;
        Ok(true)
    }

    /// Offers a decoded fix. Persists and returns true when it supersedes
    /// the held record.
    pub fn record(&mut self, fix: &GpsFix) -> Result<bool> {
        let candidate = LastKnownLocation::from_fix(fix);
        let accept = self.seeded
            || self
                .current
                .as_ref()
                .is_none_or(|held| candidate.hdop <= held.hdop);
        if !accept {
            debug!(
                hdop = candidate.hdop,
                held = self.current.as_ref().map(|c| c.hdop),
                "fix does not improve on the held record"
            );
            return Ok(false);
        }
        info!(
            latitude = candidate.latitude,
            longitude = candidate.longitude,
            altitude = candidate.altitude,
            hdop = candidate.hdop,
            "new location"
        );
        self.persist(&candidate)?;
        self.current = Some(candidate);
        self.seeded = false;
        Ok(true)
    }

    fn persist(&mut self, loc: &LastKnownLocation) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let text = serde_json::to_string(loc)?;
        fs::write(&self.path, text).wrap_err_with(|| {
            format!("writing location cache {}", self.path.display())
        })?;
        if let Some(kv) = self.kv.as_mut() {
            kv.set("LATITUDE", &loc.latitude.to_string())?;
            kv.set("LONGITUDE", &loc.longitude.to_string())?;
            kv.set("ALTITUDE", &loc.altitude.to_string())?;
            kv.set("HDOP", &loc.hdop.to_string())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fix(latitude: f64, longitude: f64, hdop: f64) -> GpsFix {
        GpsFix {
            latitude,
            longitude,
            altitude: 18.1,
            hdop,
            nsat_gps: 9,
            nsat_glonass: 4,
            utc: "122330.000".into(),
            date: "090821".into(),
        }
    }

    #[test]
    fn coordinates_are_rounded_to_four_decimals() {
        let loc = LastKnownLocation::from_fix(&fix(37.38745833, -122.03807166, 1.2));
        assert_eq!(loc.latitude, 37.3875);
        assert_eq!(loc.longitude, -122.0381);
    }

    #[test]
    fn better_hdop_supersedes_worse_never_the_reverse() {
        let dir = TempDir::new().unwrap();
        let mut store = LocationStore::open(dir.path().join("location.json"));

        assert!(store.record(&fix(37.0, -122.0, 4.0)).unwrap());
        assert!(store.record(&fix(37.1, -122.1, 1.5)).unwrap());
        assert!(!store.record(&fix(37.2, -122.2, 3.0)).unwrap());
        assert_eq!(store.current().unwrap().latitude, 37.1);
    }

    #[test]
    fn seeded_record_yields_to_the_first_real_fix() {
        let dir = TempDir::new().unwrap();
        let seed_path = dir.path().join("seed.json");
        fs::write(
            &seed_path,
            r#"{"latitude":10.0,"longitude":20.0,"altitude":0.0,"hdop":0.5}"#,
        )
        .unwrap();

        let mut store = LocationStore::open(dir.path().join("location.json"));
        assert!(store.seed_from_file(&seed_path).unwrap());

        // Far worse HDOP than the seed claims, accepted anyway.
        assert!(store.record(&fix(37.0, -122.0, 8.0)).unwrap());
        assert_eq!(store.current().unwrap().latitude, 37.0);

        // But from then on the improvement rule applies.
        assert!(!store.record(&fix(38.0, -121.0, 9.0)).unwrap());
    }

    #[test]
    fn records_survive_a_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("location.json");

        let mut store = LocationStore::open(&path);
        store.record(&fix(37.0, -122.0, 2.0)).unwrap();
        drop(store);

        let store = LocationStore::open(&path);
        assert_eq!(store.current().unwrap().hdop, 2.0);
    }

    #[test]
    fn kv_mirror_receives_accepted_records() {
        let dir = TempDir::new().unwrap();
        let kv = FileKvStore::open(dir.path().join("kv.json")).unwrap();
        let mut store = LocationStore::open(dir.path().join("location.json"))
            .with_kv(Box::new(kv));

        store.record(&fix(37.38745833, -122.0, 1.5)).unwrap();

        let kv = FileKvStore::open(dir.path().join("kv.json")).unwrap();
        assert_eq!(kv.get("LATITUDE").unwrap().as_deref(), Some("37.3875"));
        assert_eq!(kv.get("HDOP").unwrap().as_deref(), Some("1.5"));
    }
}
