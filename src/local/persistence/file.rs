use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{data_loss, internal_error, primary_lease_lost, SyncResult};
use crate::local::persistence::{LocalState, PersistenceBackend, StateChanges};
use crate::model::BatchId;
use crate::platform::runtime;

const MANIFEST_FILE: &str = "manifest.json";
const MANIFEST_TEMP_FILE: &str = "manifest.json.tmp";
const LEASE_FILE: &str = "owner.lock";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct OwnerLease {
    owner_id: String,
    lease_expires_at_ms: i64,
}

/// Names the file holding each part of the committed state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct Manifest {
    generation: u64,
    next_batch_id: BatchId,
    remote_documents: String,
    targets: String,
    index: String,
    /// User storage key to file name.
    users: BTreeMap<String, String>,
}

impl Manifest {
    fn part_files(&self) -> impl Iterator<Item = &String> {
        [&self.remote_documents, &self.targets, &self.index]
            .into_iter()
            .chain(self.users.values())
    }
}

fn part_file(stem: &str, generation: u64) -> String {
    format!("{stem}.{generation}.json")
}

fn user_stem(storage_key: &str) -> String {
    format!("user-{}", URL_SAFE_NO_PAD.encode(storage_key))
}

/// Durable backend keeping each part of the state in its own JSON file under
/// one directory.
///
/// A commit writes the changed parts to new files and then renames a fresh
/// `manifest.json` into place, so a crash leaves either the old or the new
/// state. Files the manifest no longer names are removed afterwards. Only the
/// holder of the primary lease (`owner.lock`) may commit.
#[derive(Debug)]
pub struct FilePersistence {
    directory: PathBuf,
    owner_id: String,
    lease_duration: Duration,
    manifest: Option<Manifest>,
}

impl FilePersistence {
    pub fn new(directory: PathBuf, owner_id: String, lease_duration: Duration) -> Self {
        Self {
            directory,
            owner_id,
            lease_duration,
            manifest: None,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    fn ensure_directory(&self) -> SyncResult<()> {
        fs::create_dir_all(&self.directory).map_err(|err| {
            internal_error(format!(
                "Failed to create persistence directory {}: {err}",
                self.directory.display()
            ))
        })
    }

    fn read_lease(&self) -> SyncResult<Option<OwnerLease>> {
        match fs::read_to_string(self.path(LEASE_FILE)) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(lease) => Ok(Some(lease)),
                Err(err) => {
                    log::warn!("ignoring unreadable owner lease: {err}");
                    Ok(None)
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(internal_error(format!("Failed to read owner lease: {err}"))),
        }
    }

    /// Takes or renews the lease unless another owner holds an unexpired one.
    fn renew_lease(&self) -> SyncResult<()> {
        let now = runtime::now_millis();
        if let Some(existing) = self.read_lease()? {
            if existing.owner_id != self.owner_id && existing.lease_expires_at_ms > now {
                log::warn!(
                    "primary lease held by {} until {}",
                    existing.owner_id,
                    existing.lease_expires_at_ms
                );
                return Err(primary_lease_lost());
            }
        }
        let lease = OwnerLease {
            owner_id: self.owner_id.clone(),
            lease_expires_at_ms: now + self.lease_duration.as_millis() as i64,
        };
        let encoded = serde_json::to_string(&lease)
            .map_err(|err| internal_error(format!("Failed to encode owner lease: {err}")))?;
        fs::write(self.path(LEASE_FILE), encoded)
            .map_err(|err| internal_error(format!("Failed to write owner lease: {err}")))
    }

    fn read_manifest(&self) -> SyncResult<Option<Manifest>> {
        let contents = match fs::read_to_string(self.path(MANIFEST_FILE)) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(internal_error(format!("Failed to read manifest: {err}")));
            }
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|err| data_loss(format!("Local state is corrupt: {err}")))
    }

    fn write_manifest(&self, manifest: &Manifest) -> SyncResult<()> {
        let encoded = serde_json::to_vec(manifest)
            .map_err(|err| internal_error(format!("Failed to encode manifest: {err}")))?;
        let temp = self.path(MANIFEST_TEMP_FILE);
        fs::write(&temp, encoded)
            .map_err(|err| internal_error(format!("Failed to write manifest: {err}")))?;
        fs::rename(&temp, self.path(MANIFEST_FILE))
            .map_err(|err| internal_error(format!("Failed to replace manifest: {err}")))
    }

    fn read_part<T: DeserializeOwned>(&self, name: &str) -> SyncResult<T> {
        let contents = fs::read_to_string(self.path(name))
            .map_err(|err| data_loss(format!("Local state part {name} is unreadable: {err}")))?;
        serde_json::from_str(&contents)
            .map_err(|err| data_loss(format!("Local state is corrupt: {err}")))
    }

    fn write_part<T: Serialize>(&self, stem: &str, generation: u64, part: &T) -> SyncResult<String> {
        let name = part_file(stem, generation);
        let encoded = serde_json::to_vec(part)
            .map_err(|err| internal_error(format!("Failed to encode {stem}: {err}")))?;
        fs::write(self.path(&name), encoded)
            .map_err(|err| internal_error(format!("Failed to write {stem}: {err}")))?;
        Ok(name)
    }

    fn remove_part(&self, name: &str) {
        if let Err(err) = fs::remove_file(self.path(name)) {
            if err.kind() != ErrorKind::NotFound {
                log::warn!("failed to remove superseded state file {name}: {err}");
            }
        }
    }

    /// Drops part files left behind by commits that never reached the
    /// manifest.
    fn remove_unreferenced_parts(&self, manifest: &Manifest) {
        let Ok(entries) = fs::read_dir(&self.directory) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_part = name.ends_with(".json") && name != MANIFEST_FILE;
            if is_part && !manifest.part_files().any(|part| *part == name) {
                self.remove_part(&name);
            }
        }
    }
}

impl PersistenceBackend for FilePersistence {
    fn load(&mut self) -> SyncResult<Option<LocalState>> {
        self.ensure_directory()?;
        let Some(manifest) = self.read_manifest()? else {
            return Ok(None);
        };
        let users = manifest
            .users
            .iter()
            .map(|(storage_key, name)| Ok((storage_key.clone(), Arc::new(self.read_part(name)?))))
            .collect::<SyncResult<BTreeMap<_, _>>>()?;
        let state = LocalState {
            remote_documents: Arc::new(self.read_part(&manifest.remote_documents)?),
            targets: Arc::new(self.read_part(&manifest.targets)?),
            index: Arc::new(self.read_part(&manifest.index)?),
            users,
            next_batch_id: manifest.next_batch_id,
        };
        self.remove_unreferenced_parts(&manifest);
        self.manifest = Some(manifest);
        Ok(Some(state))
    }

    fn commit(&mut self, state: &LocalState, changes: &StateChanges) -> SyncResult<()> {
        self.ensure_directory()?;
        self.renew_lease()?;
        let (mut manifest, changes) = match &self.manifest {
            Some(current) => (current.clone(), changes.clone()),
            None => (Manifest::default(), StateChanges::everything(state)),
        };
        manifest.generation += 1;
        manifest.next_batch_id = state.next_batch_id;
        let generation = manifest.generation;

        let mut superseded = Vec::new();
        if changes.remote_documents {
            let name = self.write_part("remote_documents", generation, &*state.remote_documents)?;
            superseded.push(std::mem::replace(&mut manifest.remote_documents, name));
        }
        if changes.targets {
            let name = self.write_part("targets", generation, &*state.targets)?;
            superseded.push(std::mem::replace(&mut manifest.targets, name));
        }
        if changes.index {
            let name = self.write_part("index", generation, &*state.index)?;
            superseded.push(std::mem::replace(&mut manifest.index, name));
        }
        for storage_key in &changes.users {
            let Some(user_state) = state.users.get(storage_key) else {
                continue;
            };
            let name = self.write_part(&user_stem(storage_key), generation, &**user_state)?;
            superseded.extend(manifest.users.insert(storage_key.clone(), name));
        }

        self.write_manifest(&manifest)?;
        self.manifest = Some(manifest);
        for name in superseded.iter().filter(|name| !name.is_empty()) {
            self.remove_part(name);
        }
        Ok(())
    }

    fn acquire_lease(&mut self) -> SyncResult<()> {
        self.ensure_directory()?;
        self.renew_lease()
    }

    fn release_lease(&mut self) -> SyncResult<()> {
        match self.read_lease()? {
            Some(lease) if lease.owner_id == self.owner_id => {
                fs::remove_file(self.path(LEASE_FILE))
                    .map_err(|err| internal_error(format!("Failed to release owner lease: {err}")))
            }
            _ => Ok(()),
        }
    }

    fn is_durable(&self) -> bool {
        true
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use crate::error::is_primary_lease_lost;
    use crate::local::persistence::{GcReferences, Persistence, Transaction};
    use crate::local::reference_set::ReferenceSet;
    use crate::model::{
        DocumentKey, FieldPath, MutableDocument, Mutation, SnapshotVersion, Timestamp, User,
    };
    use crate::settings::GarbageCollectionPolicy;
    use crate::value::{MapValue, Value};
    use std::collections::BTreeSet;

    fn temp_dir(label: &str) -> PathBuf {
        let unique = format!(
            "docsync-{label}-{}-{}",
            std::process::id(),
            runtime::now_millis()
        );
        std::env::temp_dir().join(unique)
    }

    fn backend(dir: &Path, owner: &str) -> FilePersistence {
        FilePersistence::new(dir.to_path_buf(), owner.to_string(), Duration::from_secs(30))
    }

    fn open(dir: &Path, owner: &str) -> Persistence {
        let mut persistence = Persistence::new(
            Box::new(backend(dir, owner)),
            GarbageCollectionPolicy::default(),
        );
        persistence.start().unwrap();
        persistence
    }

    fn run(persistence: &mut Persistence, user: &User, work: impl FnOnce(&mut Transaction<'_>)) {
        let pinned = ReferenceSet::new();
        let refs = GcReferences {
            active_targets: BTreeSet::new(),
            pinned: &pinned,
            released: &BTreeSet::new(),
        };
        persistence
            .run_transaction("test", user, &refs, |txn| {
                work(txn);
                Ok(())
            })
            .unwrap();
    }

    fn found(key: &DocumentKey, fields: MapValue) -> MutableDocument {
        MutableDocument::new_found(key.clone(), SnapshotVersion::new(Timestamp::new(3, 0)), fields)
    }

    fn stored_files(dir: &Path, prefix: &str) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .flatten()
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(prefix))
            .count()
    }

    #[test]
    fn state_survives_restart() {
        let dir = temp_dir("restart");
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let user = User::authenticated("alice");
        {
            let mut persistence = open(&dir, "owner-a");
            run(&mut persistence, &user, |txn| {
                txn.add_remote_document(found(&key, MapValue::empty()), SnapshotVersion::min());
            });
            run(&mut persistence, &user, |txn| {
                txn.add_mutation_batch(Timestamp::now(), vec![Mutation::delete(key.clone())]);
            });
            persistence.shutdown().unwrap();
        }

        let reopened = open(&dir, "owner-b");
        assert!(reopened.state().remote_documents().contains(&key));
        assert_eq!(reopened.state().mutation_queue(&user).len(), 1);
        assert_eq!(reopened.state().next_batch_id, 2);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn non_finite_doubles_survive_restart() {
        let dir = temp_dir("doubles");
        let key = DocumentKey::from_string("readings/r").unwrap();
        let fields = MapValue::new(BTreeMap::from([
            ("nan".to_string(), Value::from_double(f64::NAN)),
            ("up".to_string(), Value::from_double(f64::INFINITY)),
            ("down".to_string(), Value::from_double(f64::NEG_INFINITY)),
        ]));
        {
            let mut persistence = open(&dir, "owner-a");
            run(&mut persistence, &User::unauthenticated(), |txn| {
                txn.add_remote_document(found(&key, fields), SnapshotVersion::min());
            });
            persistence.shutdown().unwrap();
        }

        let reopened = open(&dir, "owner-a");
        let document = reopened.state().remote_documents().get(&key);
        let read = |name: &str| {
            document
                .field(&FieldPath::from_dot_separated(name).unwrap())
                .and_then(Value::as_double)
                .unwrap()
        };
        assert!(read("nan").is_nan());
        assert_eq!(read("up"), f64::INFINITY);
        assert_eq!(read("down"), f64::NEG_INFINITY);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn unchanged_parts_are_not_rewritten() {
        let dir = temp_dir("parts");
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let user = User::authenticated("alice");
        let mut persistence = open(&dir, "owner-a");
        run(&mut persistence, &user, |txn| {
            txn.add_remote_document(found(&key, MapValue::empty()), SnapshotVersion::min());
        });
        let first = backend(&dir, "reader").read_manifest().unwrap().unwrap();

        for _ in 0..3 {
            run(&mut persistence, &user, |txn| {
                txn.add_mutation_batch(Timestamp::now(), vec![Mutation::delete(key.clone())]);
            });
        }
        let last = backend(&dir, "reader").read_manifest().unwrap().unwrap();
        assert_eq!(last.generation, first.generation + 3);
        assert_eq!(last.remote_documents, first.remote_documents);
        assert_eq!(last.targets, first.targets);
        assert!(dir.join(&last.remote_documents).exists());
        assert_eq!(stored_files(&dir, "user-"), 1);
        assert_eq!(stored_files(&dir, "remote_documents"), 1);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn stray_parts_are_removed_on_load() {
        let dir = temp_dir("stray");
        let mut persistence = open(&dir, "owner-a");
        run(&mut persistence, &User::unauthenticated(), |txn| {
            txn.add_remote_document(
                found(&DocumentKey::from_string("rooms/a").unwrap(), MapValue::empty()),
                SnapshotVersion::min(),
            );
        });
        persistence.shutdown().unwrap();
        fs::write(dir.join("remote_documents.99.json"), "{}").unwrap();

        let reopened = open(&dir, "owner-a");
        assert_eq!(reopened.state().remote_documents().len(), 1);
        assert!(!dir.join("remote_documents.99.json").exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn live_lease_blocks_second_owner() {
        let dir = temp_dir("lease");
        let mut first = backend(&dir, "owner-a");
        first.acquire_lease().unwrap();

        let state = LocalState::default();
        let changes = StateChanges::everything(&state);
        let mut second = backend(&dir, "owner-b");
        let err = second.acquire_lease().unwrap_err();
        assert!(is_primary_lease_lost(&err));
        assert!(second.commit(&state, &changes).is_err());

        first.release_lease().unwrap();
        second.acquire_lease().unwrap();
        second.commit(&state, &changes).unwrap();
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupt_manifest_reports_data_loss() {
        let dir = temp_dir("corrupt");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(MANIFEST_FILE), "{not json").unwrap();
        let err = backend(&dir, "owner").load().unwrap_err();
        assert_eq!(err.code_str(), "docsync/data-loss");
        let _ = fs::remove_dir_all(&dir);
    }
}
