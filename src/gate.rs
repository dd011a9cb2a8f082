// src/gate.rs

//! Ordering gate: a location record may only be filed into a destination that a
//! MASTER record already created.

use crate::classify::{Destination, Location};
use crate::error::{FilingError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use tracing::{debug, info, warn};

/// Marker kept next to the PO workbook.
pub const STATE_FILE: &str = ".filing-state.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilingState {
    NotStarted,
    MasterWritten,
}

/// Persistence of the per-destination lifecycle.
pub trait LifecycleStore: Send + Sync {
    fn state(&self, destination: &Destination) -> Result<FilingState>;

    /// Claim a destination that does not exist yet. Must fail with
    /// `DestinationAlreadyExists` if anything else created it first.
    fn reserve(&self, destination: &Destination) -> Result<()>;

    fn mark_master_written(&self, destination: &Destination) -> Result<()>;

    /// Undo a `reserve` that never reached `MasterWritten`.
    fn release(&self, destination: &Destination);
}

/// What the sink writer should do with the record.
#[must_use]
pub enum GateDecision<'a> {
    /// Nothing filed yet: export the template into a new workbook, then `commit`.
    FirstWrite(Reservation<'a>),
    /// The workbook exists: patch it in place.
    Patch,
}

impl GateDecision<'_> {
    pub fn is_first_write(&self) -> bool {
        matches!(self, GateDecision::FirstWrite(_))
    }
}

/// Claim on a freshly created destination. Dropped without `commit` it gives the
/// destination back, so a failed MASTER can simply be re-run.
pub struct Reservation<'a> {
    store: &'a dyn LifecycleStore,
    destination: Destination,
    committed: bool,
}

impl Reservation<'_> {
    pub fn commit(mut self) -> Result<()> {
        self.store.mark_master_written(&self.destination)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            warn!(dir = %self.destination.dir.display(), "MASTER not finalized, releasing destination");
            self.store.release(&self.destination);
        }
    }
}

pub fn ensure_ordered<'a>(
    store: &'a dyn LifecycleStore,
    destination: &Destination,
    location: &Location,
) -> Result<GateDecision<'a>> {
    match (store.state(destination)?, location) {
        (FilingState::MasterWritten, _) => Ok(GateDecision::Patch),
        (FilingState::NotStarted, Location::Master) => {
            store.reserve(destination)?;
            info!(dir = %destination.dir.display(), "Destination created for MASTER");
            Ok(GateDecision::FirstWrite(Reservation {
                store,
                destination: destination.clone(),
                committed: false,
            }))
        }
        (FilingState::NotStarted, Location::Site(code)) => Err(FilingError::MasterNotYetProcessed {
            style: destination.full_style.clone(),
            company_po: destination.company_po.clone(),
            location: code.clone(),
        }),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StateMarker {
    state: FilingState,
    style: String,
    company_po: String,
}

/// Lifecycle kept on disk: the destination directory is the reservation, the marker
/// file is the committed state.
#[derive(Debug, Default)]
pub struct FsLifecycleStore;

impl LifecycleStore for FsLifecycleStore {
    fn state(&self, destination: &Destination) -> Result<FilingState> {
        let marker = destination.dir.join(STATE_FILE);
        if marker.is_file() {
            let text = fs::read_to_string(&marker)?;
            let parsed: StateMarker = serde_json::from_str(&text).map_err(|e| {
                FilingError::Config(format!("corrupt state marker {}: {e}", marker.display()))
            })?;
            return Ok(parsed.state);
        }
        // Destinations filed before the marker existed only have the workbook.
        if destination.workbook_path().is_file() {
            info!(dir = %destination.dir.display(), "Adopting destination without state marker");
            return Ok(FilingState::MasterWritten);
        }
        // A reservation that was never committed or released (the process died mid-write).
        if destination.dir.exists() {
            return Err(FilingError::StaleReservation(destination.dir.clone()));
        }
        Ok(FilingState::NotStarted)
    }

    fn reserve(&self, destination: &Destination) -> Result<()> {
        if let Some(parent) = destination.dir.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::create_dir(&destination.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(FilingError::DestinationAlreadyExists(destination.dir.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn mark_master_written(&self, destination: &Destination) -> Result<()> {
        let marker = StateMarker {
            state: FilingState::MasterWritten,
            style: destination.full_style.clone(),
            company_po: destination.company_po.clone(),
        };
        let json = serde_json::to_string_pretty(&marker)
            .map_err(|e| FilingError::Config(format!("state marker: {e}")))?;
        fs::write(destination.dir.join(STATE_FILE), json)?;
        Ok(())
    }

    fn release(&self, destination: &Destination) {
        if let Err(e) = fs::remove_dir_all(&destination.dir) {
            warn!(error = %e, dir = %destination.dir.display(), "Could not remove released destination");
            return;
        }
        // `{style}/PO` and `{style}` go too when this reservation was all they held.
        for parent in destination.dir.ancestors().skip(1).take(2) {
            if fs::remove_dir(parent).is_err() {
                break;
            }
            debug!(dir = %parent.display(), "Removed empty parent of released destination");
        }
    }
}

#[cfg(test)]
pub use memory::MemoryLifecycleStore;

#[cfg(test)]
mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// In-memory lifecycle for tests: presence in the map means "directory exists".
    #[derive(Debug, Default)]
    pub struct MemoryLifecycleStore {
        states: Mutex<HashMap<PathBuf, FilingState>>,
    }

    impl MemoryLifecycleStore {
        pub fn exists(&self, destination: &Destination) -> bool {
            self.states.lock().unwrap().contains_key(&destination.dir)
        }
    }

    impl LifecycleStore for MemoryLifecycleStore {
        fn state(&self, destination: &Destination) -> Result<FilingState> {
            Ok(self
                .states
                .lock()
                .unwrap()
                .get(&destination.dir)
                .copied()
                .unwrap_or(FilingState::NotStarted))
        }

        fn reserve(&self, destination: &Destination) -> Result<()> {
            let mut states = self.states.lock().unwrap();
            if states.contains_key(&destination.dir) {
                return Err(FilingError::DestinationAlreadyExists(destination.dir.clone()));
            }
            states.insert(destination.dir.clone(), FilingState::NotStarted);
            Ok(())
        }

        fn mark_master_written(&self, destination: &Destination) -> Result<()> {
            self.states
                .lock()
                .unwrap()
                .insert(destination.dir.clone(), FilingState::MasterWritten);
            Ok(())
        }

        fn release(&self, destination: &Destination) {
            self.states.lock().unwrap().remove(&destination.dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn destination(root: &Path) -> Destination {
        Destination::new(root, "AB12-PT", "PO555").unwrap()
    }

    fn ga1() -> Location {
        Location::Site("GA1".to_string())
    }

    #[test]
    fn test_location_before_master_is_blocked() {
        let store = MemoryLifecycleStore::default();
        let dest = destination(Path::new("/f"));
        let err = ensure_ordered(&store, &dest, &ga1()).err().unwrap();
        assert!(matches!(
            err,
            FilingError::MasterNotYetProcessed { ref location, ref company_po, .. }
                if location == "GA1" && company_po == "PO555"
        ));
        assert!(!store.exists(&dest));
    }

    #[test]
    fn test_master_then_location() {
        let store = MemoryLifecycleStore::default();
        let dest = destination(Path::new("/f"));

        let decision = ensure_ordered(&store, &dest, &Location::Master).unwrap();
        let GateDecision::FirstWrite(reservation) = decision else {
            panic!("MASTER on an empty destination must be a first write");
        };
        reservation.commit().unwrap();

        for location in [ga1(), Location::Site("PL1".into()), Location::Master] {
            let decision = ensure_ordered(&store, &dest, &location).unwrap();
            assert!(!decision.is_first_write());
        }
    }

    #[test]
    fn test_uncommitted_master_is_released() {
        let store = MemoryLifecycleStore::default();
        let dest = destination(Path::new("/f"));

        {
            let decision = ensure_ordered(&store, &dest, &Location::Master).unwrap();
            assert!(decision.is_first_write());
            assert!(store.exists(&dest));
        }
        assert!(!store.exists(&dest));
        assert!(ensure_ordered(&store, &dest, &ga1()).is_err());
        assert!(ensure_ordered(&store, &dest, &Location::Master).unwrap().is_first_write());
    }

    #[test]
    fn test_competing_master_reservation() {
        let store = MemoryLifecycleStore::default();
        let dest = destination(Path::new("/f"));
        let _first = ensure_ordered(&store, &dest, &Location::Master).unwrap();
        let second = ensure_ordered(&store, &dest, &Location::Master);
        assert!(matches!(second, Err(FilingError::DestinationAlreadyExists(_))));
    }

    #[test]
    fn test_fs_store_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsLifecycleStore;
        let dest = destination(tmp.path());

        assert_eq!(store.state(&dest).unwrap(), FilingState::NotStarted);
        let decision = ensure_ordered(&store, &dest, &Location::Master).unwrap();
        assert!(dest.dir.is_dir());
        let GateDecision::FirstWrite(reservation) = decision else {
            panic!("expected first write");
        };
        reservation.commit().unwrap();

        assert!(dest.dir.join(STATE_FILE).is_file());
        assert_eq!(store.state(&dest).unwrap(), FilingState::MasterWritten);
        assert!(matches!(ensure_ordered(&store, &dest, &ga1()), Ok(GateDecision::Patch)));
    }

    #[test]
    fn test_fs_store_releases_and_rejects_existing_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsLifecycleStore;
        let dest = destination(tmp.path());

        drop(ensure_ordered(&store, &dest, &Location::Master).unwrap());
        assert!(!dest.dir.exists());
        // Nothing else lived under the style folder, so it is gone as well.
        assert!(!tmp.path().join("AB12").exists());
        assert!(tmp.path().is_dir());

        store.reserve(&dest).unwrap();
        assert!(matches!(
            store.reserve(&dest),
            Err(FilingError::DestinationAlreadyExists(_))
        ));
    }

    #[test]
    fn test_fs_store_release_keeps_sibling_destinations() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsLifecycleStore;
        let filed = Destination::new(tmp.path(), "AB12-PT", "PO100").unwrap();
        let dest = destination(tmp.path());

        store.reserve(&filed).unwrap();
        store.mark_master_written(&filed).unwrap();
        drop(ensure_ordered(&store, &dest, &Location::Master).unwrap());

        assert!(!dest.dir.exists());
        assert!(filed.dir.join(STATE_FILE).is_file());
    }

    #[test]
    fn test_fs_store_reports_stale_reservation() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsLifecycleStore;
        let dest = destination(tmp.path());
        // A run that died between reserve and commit leaves a bare directory behind.
        store.reserve(&dest).unwrap();

        for location in [Location::Master, ga1()] {
            let err = ensure_ordered(&store, &dest, &location).err().unwrap();
            assert!(matches!(err, FilingError::StaleReservation(ref dir) if *dir == dest.dir));
            assert!(err.to_string().contains("remove the directory"));
        }
        assert!(dest.dir.is_dir());

        fs::remove_dir(&dest.dir).unwrap();
        assert!(ensure_ordered(&store, &dest, &Location::Master).unwrap().is_first_write());
    }

    #[test]
    fn test_fs_store_adopts_legacy_workbook() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsLifecycleStore;
        let dest = destination(tmp.path());
        fs::create_dir_all(&dest.dir).unwrap();
        fs::write(dest.workbook_path(), b"placeholder").unwrap();
        assert_eq!(store.state(&dest).unwrap(), FilingState::MasterWritten);
    }
}
