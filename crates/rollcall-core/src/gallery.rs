//! Identity gallery: identity → reference embeddings, persisted to a JSON file.
//!
//! Every mutation runs read → modify → persist under the write lock. The
//! change is staged on a copy and only committed once the file has been
//! replaced, so a failed write leaves both disk and memory untouched.
//! Readers take a cheap `Arc` snapshot for matching.

use crate::matcher::{MatchError, Matcher};
use crate::types::{Candidate, Embedding, EmbeddingError, EmbeddingRecord, Verification};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("bad embedding: {0}")]
    BadEmbedding(#[from] EmbeddingError),
    #[error("identity not found: {0}")]
    NotFound(String),
    #[error("identity not registered: {0}")]
    NotRegistered(String),
    #[error("failed to persist gallery to {path}: {source}")]
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize gallery: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<MatchError> for GalleryError {
    fn from(err: MatchError) -> Self {
        match err {
            MatchError::BadEmbedding(e) => GalleryError::BadEmbedding(e),
            MatchError::BadCandidate { source, .. } => GalleryError::BadEmbedding(source),
        }
    }
}

/// Display attributes attached to an identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// Counts for reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GalleryStats {
    pub identities: usize,
    pub embeddings: usize,
    pub last_updated: Option<DateTime<Utc>>,
}

/// What `set_single` / `add_sample` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
struct Sample {
    embedding: Embedding,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct IdentityEntry {
    profile: IdentityProfile,
    /// Never empty; the first sample is the canonical embedding.
    samples: Vec<Sample>,
}

type Entries = BTreeMap<String, IdentityEntry>;

#[derive(Default)]
struct GalleryState {
    entries: Entries,
    /// Flattened `(identity, sample)` rows in id order, rebuilt on commit.
    snapshot: Arc<[Candidate]>,
    last_updated: Option<DateTime<Utc>>,
}

impl GalleryState {
    fn new(entries: Entries, last_updated: Option<DateTime<Utc>>) -> Self {
        let snapshot = entries
            .iter()
            .flat_map(|(id, entry)| {
                entry.samples.iter().map(move |s| Candidate {
                    identity_id: id.clone(),
                    embedding: s.embedding.clone(),
                })
            })
            .collect::<Vec<_>>()
            .into();
        Self {
            entries,
            snapshot,
            last_updated,
        }
    }
}

/// Thread-safe identity gallery backed by a single JSON file.
pub struct EmbeddingGallery {
    path: PathBuf,
    dim: usize,
    state: RwLock<GalleryState>,
}

impl EmbeddingGallery {
    /// Load the gallery from `path`.
    ///
    /// A missing file yields an empty gallery. A corrupt file is logged and
    /// also yields an empty gallery; the process keeps running. Stored
    /// vectors of the wrong dimension are skipped individually.
    pub fn load(path: impl Into<PathBuf>, dim: usize) -> Self {
        let path = path.into();
        let entries = read_entries(&path, dim).unwrap_or_else(|reason| {
            tracing::warn!(
                path = %path.display(),
                error = %reason,
                "starting with an empty gallery"
            );
            Entries::new()
        });
        let state = GalleryState::new(entries, None);
        tracing::info!(
            path = %path.display(),
            identities = state.entries.len(),
            embeddings = state.snapshot.len(),
            dim,
            "gallery loaded"
        );

        Self {
            path,
            dim,
            state: RwLock::new(state),
        }
    }

    /// Re-read the backing file, replacing the in-memory gallery. Picks up
    /// registrations made by another process. A missing file empties the
    /// gallery; a corrupt or unreadable one leaves it as it was.
    pub fn reload(&self) -> GalleryStats {
        let read = read_entries(&self.path, self.dim);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match read {
            Ok(entries) => {
                *state = GalleryState::new(entries, Some(Utc::now()));
                tracing::info!(
                    identities = state.entries.len(),
                    embeddings = state.snapshot.len(),
                    "gallery reloaded"
                );
            }
            Err(reason) => tracing::warn!(
                path = %self.path.display(),
                error = %reason,
                "gallery reload failed; keeping current gallery"
            ),
        }
        GalleryStats {
            identities: state.entries.len(),
            embeddings: state.snapshot.len(),
            last_updated: state.last_updated,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Persist the full gallery atomically (temp file + rename).
    pub fn save(&self) -> Result<(), GalleryError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        write_atomic(&self.path, &state.entries)
    }

    /// Replace the identity's embeddings with exactly one canonical vector.
    pub fn set_single(
        &self,
        identity_id: &str,
        embedding: Embedding,
    ) -> Result<Registration, GalleryError> {
        embedding.validate(Some(self.dim))?;

        let outcome = self.mutate(|entries| {
            let sample = Sample {
                embedding,
                created_at: Utc::now(),
            };
            match entries.get_mut(identity_id) {
                Some(entry)
                    if entry.samples.len() == 1 && entry.samples[0].embedding == sample.embedding =>
                {
                    Ok(Registration::Unchanged)
                }
                Some(entry) => {
                    entry.samples = vec![sample];
                    Ok(Registration::Updated)
                }
                None => {
                    entries.insert(
                        identity_id.to_string(),
                        IdentityEntry {
                            profile: IdentityProfile::default(),
                            samples: vec![sample],
                        },
                    );
                    Ok(Registration::Created)
                }
            }
        })?;

        tracing::info!(identity = identity_id, ?outcome, "set single embedding");
        Ok(outcome)
    }

    /// Append one more sample for the identity (multi-sample mode).
    /// An exact duplicate of an existing sample is ignored.
    pub fn add_sample(
        &self,
        identity_id: &str,
        embedding: Embedding,
    ) -> Result<Registration, GalleryError> {
        embedding.validate(Some(self.dim))?;

        let outcome = self.mutate(|entries| {
            let sample = Sample {
                embedding,
                created_at: Utc::now(),
            };
            match entries.get_mut(identity_id) {
                Some(entry) if entry.samples.iter().any(|s| s.embedding == sample.embedding) => {
                    Ok(Registration::Unchanged)
                }
                Some(entry) => {
                    entry.samples.push(sample);
                    Ok(Registration::Updated)
                }
                None => {
                    entries.insert(
                        identity_id.to_string(),
                        IdentityEntry {
                            profile: IdentityProfile::default(),
                            samples: vec![sample],
                        },
                    );
                    Ok(Registration::Created)
                }
            }
        })?;

        tracing::info!(identity = identity_id, ?outcome, "added embedding sample");
        Ok(outcome)
    }

    /// Update display attributes of a registered identity.
    pub fn set_profile(&self, identity_id: &str, profile: IdentityProfile) -> Result<(), GalleryError> {
        self.mutate(|entries| {
            let entry = entries
                .get_mut(identity_id)
                .ok_or_else(|| GalleryError::NotFound(identity_id.to_string()))?;
            entry.profile = profile;
            Ok(())
        })
    }

    /// Remove an identity and all of its vectors.
    pub fn remove(&self, identity_id: &str) -> Result<(), GalleryError> {
        self.mutate(|entries| {
            entries
                .remove(identity_id)
                .map(|_| ())
                .ok_or_else(|| GalleryError::NotFound(identity_id.to_string()))
        })?;
        tracing::info!(identity = identity_id, "identity removed");
        Ok(())
    }

    /// Drop every identity.
    pub fn clear(&self) -> Result<(), GalleryError> {
        let removed = self.mutate(|entries| {
            let n = entries.len();
            entries.clear();
            Ok(n)
        })?;
        tracing::warn!(removed, "gallery cleared");
        Ok(())
    }

    pub fn list_identities(&self) -> Vec<String> {
        self.read().entries.keys().cloned().collect()
    }

    /// Total embedding count across all identities.
    pub fn size(&self) -> usize {
        self.read().snapshot.len()
    }

    pub fn identity_count(&self) -> usize {
        self.read().entries.len()
    }

    pub fn contains(&self, identity_id: &str) -> bool {
        self.read().entries.contains_key(identity_id)
    }

    pub fn profile(&self, identity_id: &str) -> Option<IdentityProfile> {
        self.read().entries.get(identity_id).map(|e| e.profile.clone())
    }

    /// The identity's canonical (first) embedding.
    pub fn canonical(&self, identity_id: &str) -> Option<Embedding> {
        self.read()
            .entries
            .get(identity_id)
            .and_then(|e| e.samples.first())
            .map(|s| s.embedding.clone())
    }

    pub fn records(&self, identity_id: &str) -> Vec<EmbeddingRecord> {
        self.read()
            .entries
            .get(identity_id)
            .map(|e| {
                e.samples
                    .iter()
                    .map(|s| EmbeddingRecord {
                        identity_id: identity_id.to_string(),
                        embedding: s.embedding.clone(),
                        created_at: s.created_at,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Immutable matching snapshot, ordered by identity id then sample order.
    pub fn snapshot(&self) -> Arc<[Candidate]> {
        Arc::clone(&self.read().snapshot)
    }

    /// 1:1 check of `query` against the claimed identity's canonical embedding.
    pub fn verify(
        &self,
        identity_id: &str,
        query: &Embedding,
        matcher: &impl Matcher,
    ) -> Result<Verification, GalleryError> {
        let stored = self
            .canonical(identity_id)
            .ok_or_else(|| GalleryError::NotRegistered(identity_id.to_string()))?;
        Ok(matcher.verify(query, &stored)?)
    }

    pub fn stats(&self) -> GalleryStats {
        let state = self.read();
        GalleryStats {
            identities: state.entries.len(),
            embeddings: state.snapshot.len(),
            last_updated: state.last_updated,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, GalleryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Entries) -> Result<T, GalleryError>,
    ) -> Result<T, GalleryError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let mut staged = state.entries.clone();
        let out = f(&mut staged)?;
        if staged != state.entries {
            write_atomic(&self.path, &staged)?;
            *state = GalleryState::new(staged, Some(Utc::now()));
        }
        Ok(out)
    }
}

// --- On-disk format ---

/// Accepted per-identity shapes: a bare vector (registration mode), a list
/// of vectors (bulk mode), or a full profile object (what we write).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredEntry {
    Single(Vec<f32>),
    Many(Vec<Vec<f32>>),
    Profile(StoredProfile),
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredProfile {
    #[serde(flatten)]
    profile: IdentityProfile,
    samples: Vec<StoredSample>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredSample {
    vector: Vec<f32>,
    #[serde(default = "Utc::now")]
    created_at: DateTime<Utc>,
}

/// Parse the backing file. A missing file is an empty gallery; a corrupt or
/// unreadable one is an error carrying the reason.
fn read_entries(path: &Path, dim: usize) -> Result<Entries, String> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice::<BTreeMap<String, StoredEntry>>(&bytes)
            .map(|stored| normalize(stored, dim))
            .map_err(|e| format!("corrupt gallery file: {e}")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no gallery file; starting empty");
            Ok(Entries::new())
        }
        Err(e) => Err(format!("unreadable gallery file: {e}")),
    }
}

fn normalize(stored: BTreeMap<String, StoredEntry>, dim: usize) -> Entries {
    let loaded_at = Utc::now();
    let mut entries = Entries::new();

    for (id, entry) in stored {
        let (profile, raw): (IdentityProfile, Vec<(Vec<f32>, DateTime<Utc>)>) = match entry {
            StoredEntry::Single(v) => (IdentityProfile::default(), vec![(v, loaded_at)]),
            StoredEntry::Many(vs) => (
                IdentityProfile::default(),
                vs.into_iter().map(|v| (v, loaded_at)).collect(),
            ),
            StoredEntry::Profile(p) => (
                p.profile,
                p.samples.into_iter().map(|s| (s.vector, s.created_at)).collect(),
            ),
        };

        let mut samples = Vec::with_capacity(raw.len());
        for (values, created_at) in raw {
            let embedding = Embedding::new(values);
            match embedding.validate(Some(dim)) {
                Ok(()) => samples.push(Sample {
                    embedding,
                    created_at,
                }),
                Err(e) => tracing::warn!(identity = %id, error = %e, "skipping stored embedding"),
            }
        }

        if samples.is_empty() {
            tracing::warn!(identity = %id, "no usable embeddings; identity dropped");
            continue;
        }
        entries.insert(id, IdentityEntry { profile, samples });
    }

    entries
}

fn write_atomic(path: &Path, entries: &Entries) -> Result<(), GalleryError> {
    let stored: BTreeMap<&str, StoredProfile> = entries
        .iter()
        .map(|(id, entry)| {
            (
                id.as_str(),
                StoredProfile {
                    profile: entry.profile.clone(),
                    samples: entry
                        .samples
                        .iter()
                        .map(|s| StoredSample {
                            vector: s.embedding.values.clone(),
                            created_at: s.created_at,
                        })
                        .collect(),
                },
            )
        })
        .collect();
    let bytes = serde_json::to_vec_pretty(&stored)?;

    let persist_err = |source| GalleryError::Persist {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(persist_err)?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let written = std::fs::File::create(&tmp_path).and_then(|mut f| {
        f.write_all(&bytes)?;
        f.sync_all()
    });
    if let Err(e) = written {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(persist_err(e));
    }

    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(persist_err(e));
    }

    tracing::debug!(path = %path.display(), identities = entries.len(), "gallery saved");
    Ok(())
}
