//! Per-tenant write-ahead log.
//!
//! Each tenant (token) owns a directory of numbered segments under the WAL
//! root. Exactly one segment per tenant is *active* (writable); the rest are
//! *sealed* and wait for the forwarder. Appends are serialized per tenant
//! and acknowledged only after fsync. Rotation is adaptive (size, activity,
//! age), quotas are enforced before every write, and startup recovery
//! rebuilds tenant state from disk, treating every surviving segment as
//! sealed.

pub mod segment;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::auth::TokenIdentity;
use crate::config::{SharedSettings, WalSettings};
use crate::error::GatewayError;
use crate::metrics::Metrics;
use crate::model::NormalizedRecord;
use segment::{SegmentReader, SegmentWriter};

/// Acknowledgement for one durable append.
#[derive(Debug, Clone, Copy)]
pub struct Ack {
    pub segment_seq: u64,
    pub first_offset: u64,
    pub count: usize,
}

/// A sealed segment eligible for forwarding.
#[derive(Debug, Clone)]
pub struct SegmentHandle {
    pub tenant: String,
    pub label: String,
    pub seq: u64,
    pub path: PathBuf,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct QuotaState {
    pub bytes: u64,
    pub age: Duration,
    pub ratio: f64,
}

/// Per-tenant numbers for the admin status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct TenantOverview {
    pub tenant: String,
    /// Hashed directory name under the WAL root; never the token itself.
    pub dir: String,
    pub bytes_on_disk: u64,
    pub oldest_record_age_secs: u64,
    pub active_segments: u64,
    pub sealed_segments: u64,
}

/// One segment sealed by an admin flush.
#[derive(Debug, Clone, Serialize)]
pub struct FlushedSegment {
    pub tenant: String,
    pub seq: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
struct SealedSegment {
    seq: u64,
    path: PathBuf,
    bytes: u64,
    created_unix_ms: u64,
}

struct WriterState {
    active: Option<SegmentWriter>,
    next_seq: u64,
}

#[derive(Default)]
struct Shelf {
    sealed: BTreeMap<u64, SealedSegment>,
}

impl Shelf {
    fn bytes(&self) -> u64 {
        self.sealed.values().map(|s| s.bytes).sum()
    }
}

struct TenantSlot {
    safe_name: String,
    label: StdMutex<String>,
    token_hash: AtomicU64,
    dir: PathBuf,
    writer: Mutex<WriterState>,
    shelf: StdMutex<Shelf>,
    active_bytes: AtomicU64,
    active_created_unix_ms: AtomicU64,
}

impl TenantSlot {
    fn label(&self) -> String {
        self.label
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn bytes_on_disk(&self) -> u64 {
        let sealed = {
            let shelf = self
                .shelf
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            shelf.bytes()
        };
        sealed + self.active_bytes.load(Ordering::Relaxed)
    }

    fn oldest_record_unix_ms(&self) -> Option<u64> {
        let shelf_oldest = {
            let shelf = self
                .shelf
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            shelf.sealed.values().map(|s| s.created_unix_ms).min()
        };
        let active = match self.active_created_unix_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        };
        match (shelf_oldest, active) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Why a segment came into existence or was sealed; used as a metric label.
mod reason {
    pub const INGEST: &str = "ingest";
    pub const SIZE: &str = "size";
    pub const ACTIVE: &str = "active";
    pub const IDLE: &str = "idle";
    pub const FORCE: &str = "force";
    pub const FLUSH: &str = "flush";
}

/// Adaptive rotation: decide whether the active segment must seal after a
/// successful append. Returns the rotation reason, or `None` to keep going.
fn rotation_decision(
    size: u64,
    age: Duration,
    idle_for: Duration,
    wal: &WalSettings,
) -> Option<&'static str> {
    let force_after = Duration::from_secs(wal.force_rotation_hours * 3600);
    if size >= wal.segment_max_bytes {
        return Some(reason::SIZE);
    }
    if size < wal.min_rotation_bytes && age < force_after {
        return None;
    }
    let idle_threshold = Duration::from_secs(wal.idle_threshold_minutes * 60);
    if idle_for < idle_threshold
        && age >= Duration::from_secs(wal.rotation_time_active_minutes * 60)
        && size >= wal.min_rotation_bytes
    {
        return Some(reason::ACTIVE);
    }
    if idle_for >= idle_threshold && age >= Duration::from_secs(wal.rotation_time_idle_hours * 3600)
    {
        return Some(reason::IDLE);
    }
    if age >= force_after {
        return Some(reason::FORCE);
    }
    None
}

pub struct WalManager {
    settings: Arc<SharedSettings>,
    metrics: Arc<Metrics>,
    tenants: StdMutex<HashMap<String, Arc<TenantSlot>>>,
    seal_notify: Arc<Notify>,
    durability_error_since: StdMutex<Option<Instant>>,
    recovered: AtomicBool,
}

impl WalManager {
    pub fn new(settings: Arc<SharedSettings>, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            metrics,
            tenants: StdMutex::new(HashMap::new()),
            seal_notify: Arc::new(Notify::new()),
            durability_error_since: StdMutex::new(None),
            recovered: AtomicBool::new(false),
        })
    }

    /// Signaled whenever a segment seals; the forwarder parks on this.
    pub fn seal_notifier(&self) -> Arc<Notify> {
        self.seal_notify.clone()
    }

    pub fn root_path(&self) -> PathBuf {
        self.settings.snapshot().wal.root_path.clone()
    }

    /// Startup scan: rebuild tenant state from disk. Previously-active
    /// segments become sealed (we never resume writing into an old
    /// segment); zero-length or malformed-header files are purged.
    pub fn recover(&self) -> Result<(), GatewayError> {
        let snapshot = self.settings.snapshot();
        let root = &snapshot.wal.root_path;
        std::fs::create_dir_all(root)?;

        // Map hashed directory names back to registry names for labels.
        let names_by_safe: HashMap<String, String> = snapshot
            .security
            .api_keys
            .iter()
            .map(|(token, entry)| (crate::auth::token_safe_name(token), entry.name.clone()))
            .collect();

        let mut recovered_tenants = 0usize;
        let mut recovered_segments = 0usize;
        for dir_entry in std::fs::read_dir(root)? {
            let dir_entry = dir_entry?;
            if !dir_entry.file_type()?.is_dir() {
                continue;
            }
            let safe_name = dir_entry.file_name().to_string_lossy().to_string();
            let dir = dir_entry.path();

            let mut shelf = Shelf::default();
            let mut token_hash = 0u64;
            let mut max_seq = 0u64;
            for file in std::fs::read_dir(&dir)? {
                let file = file?;
                let file_name = file.file_name().to_string_lossy().to_string();
                let Some(seq) = segment::parse_segment_seq(&file_name) else {
                    continue;
                };
                let path = file.path();
                max_seq = max_seq.max(seq);
                match segment::read_header(&path) {
                    Ok(header) => {
                        token_hash = header.token_hash;
                        let bytes = segment::file_len(&path)?;
                        shelf.sealed.insert(
                            seq,
                            SealedSegment {
                                seq,
                                path,
                                bytes,
                                created_unix_ms: header.created_unix_ms,
                            },
                        );
                        recovered_segments += 1;
                    }
                    Err(err) => {
                        warn!(
                            segment = %path.display(),
                            "purging malformed segment during recovery: {err}"
                        );
                        self.metrics.segments_corrupt_total.inc();
                        let _ = std::fs::remove_file(&path);
                    }
                }
            }

            let label = names_by_safe
                .get(&safe_name)
                .cloned()
                .unwrap_or_else(|| safe_name.clone());
            let slot = Arc::new(TenantSlot {
                safe_name: safe_name.clone(),
                label: StdMutex::new(label),
                token_hash: AtomicU64::new(token_hash),
                dir,
                writer: Mutex::new(WriterState {
                    active: None,
                    next_seq: max_seq + 1,
                }),
                shelf: StdMutex::new(shelf),
                active_bytes: AtomicU64::new(0),
                active_created_unix_ms: AtomicU64::new(0),
            });
            self.update_gauges(&slot);
            self.tenants
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(safe_name, slot);
            recovered_tenants += 1;
        }

        self.recovered.store(true, Ordering::SeqCst);
        info!(
            tenants = recovered_tenants,
            segments = recovered_segments,
            root = %root.display(),
            "WAL recovery complete"
        );
        if recovered_segments > 0 {
            self.seal_notify.notify_waiters();
        }
        Ok(())
    }

    pub fn recovered_ok(&self) -> bool {
        self.recovered.load(Ordering::SeqCst)
    }

    /// How long durable writes have been failing, if they currently are.
    pub fn durability_degraded_for(&self) -> Option<Duration> {
        self.durability_error_since
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .map(|since| since.elapsed())
    }

    /// Free-space ratio of the volume holding the WAL root. Also refreshes
    /// the gauge. Returns 1.0 when the statfs itself fails so a broken probe
    /// cannot reject ingest on its own.
    pub fn disk_free_ratio(&self) -> f64 {
        let root = self.root_path();
        let ratio = match (fs2::available_space(&root), fs2::total_space(&root)) {
            (Ok(available), Ok(total)) if total > 0 => available as f64 / total as f64,
            _ => 1.0,
        };
        self.metrics.disk_free_ratio.set(ratio);
        ratio
    }

    fn slot_for(&self, identity: &TokenIdentity) -> Result<Arc<TenantSlot>, GatewayError> {
        let mut tenants = self
            .tenants
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(slot) = tenants.get(&identity.safe_name) {
            slot.token_hash.store(identity.token_hash, Ordering::Relaxed);
            let mut label = slot
                .label
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if *label != identity.name {
                *label = identity.name.clone();
            }
            return Ok(slot.clone());
        }

        let dir = self
            .settings
            .snapshot()
            .wal
            .root_path
            .join(&identity.safe_name);
        std::fs::create_dir_all(&dir)?;
        let slot = Arc::new(TenantSlot {
            safe_name: identity.safe_name.clone(),
            label: StdMutex::new(identity.name.clone()),
            token_hash: AtomicU64::new(identity.token_hash),
            dir,
            writer: Mutex::new(WriterState {
                active: None,
                next_seq: 1,
            }),
            shelf: StdMutex::new(Shelf::default()),
            active_bytes: AtomicU64::new(0),
            active_created_unix_ms: AtomicU64::new(0),
        });
        tenants.insert(identity.safe_name.clone(), slot.clone());
        Ok(slot)
    }

    /// Durably append a batch for one tenant. Returns only after fsync.
    pub async fn append(
        &self,
        identity: &TokenIdentity,
        records: &[NormalizedRecord],
    ) -> Result<Ack, GatewayError> {
        let snapshot = self.settings.snapshot();
        let wal = &snapshot.wal;
        let slot = self.slot_for(identity)?;
        let label = slot.label();

        let mut payloads = Vec::with_capacity(records.len());
        let mut write_size = 0u64;
        for record in records {
            let payload = serde_json::to_vec(record)
                .map_err(|e| GatewayError::Internal(format!("record encoding failed: {e}")))?;
            write_size += segment::frame_len(payload.len());
            payloads.push(payload);
        }

        if self.disk_free_ratio() < wal.disk_free_min_ratio {
            return Err(GatewayError::QuotaHard);
        }

        let mut writer = slot.writer.lock().await;

        self.enforce_quota(&slot, &label, wal, write_size);
        let bytes_after = slot.bytes_on_disk() + write_size;
        if bytes_after as f64 > 0.8 * wal.token_wal_quota_bytes as f64 {
            self.metrics
                .wal_backpressure_total
                .with_label_values(&[&label])
                .inc();
            return Err(GatewayError::QuotaSoft);
        }

        // A write never carries the active segment past the size limit.
        let mut create_reason = reason::INGEST;
        if let Some(active) = &writer.active {
            if active.bytes + write_size > wal.segment_max_bytes {
                self.seal_active(&slot, &mut writer, reason::SIZE)?;
                create_reason = reason::SIZE;
            }
        }
        if writer.active.is_none() {
            self.open_active(&slot, &mut writer, create_reason)?;
        }

        let started = Instant::now();
        let Some(active) = writer.active.as_mut() else {
            return Err(GatewayError::Internal("no active segment".to_string()));
        };
        let (segment_seq, first_offset) = match active.append(&payloads) {
            Ok(offset) => {
                self.clear_durability_error();
                slot.active_bytes.store(active.bytes, Ordering::Relaxed);
                (active.seq, offset)
            }
            Err(err) => {
                self.note_durability_error();
                return Err(GatewayError::Internal(format!("WAL append failed: {err}")));
            }
        };
        self.metrics
            .wal_append_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        // Adaptive rotation runs after every successful append.
        if let Some(active) = &writer.active {
            if let Some(why) = rotation_decision(active.bytes, active.age(), active.idle_for(), wal)
            {
                self.seal_active(&slot, &mut writer, why)?;
            }
        }
        drop(writer);

        self.update_gauges(&slot);
        Ok(Ack {
            segment_seq,
            first_offset,
            count: records.len(),
        })
    }

    /// Evict oldest sealed segments while the byte or age quota is blown.
    /// The only path by which unforwarded data is lost, and it is counted.
    fn enforce_quota(&self, slot: &TenantSlot, label: &str, wal: &WalSettings, write_size: u64) {
        let age_limit_ms = wal.token_wal_quota_age_hours * 3_600_000;
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;

        let mut evicted = Vec::new();
        {
            let mut shelf = slot
                .shelf
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            loop {
                let over_bytes = shelf.bytes() + slot.active_bytes.load(Ordering::Relaxed)
                    + write_size
                    > wal.token_wal_quota_bytes;
                let over_age = shelf
                    .sealed
                    .values()
                    .next()
                    .map(|s| now_ms.saturating_sub(s.created_unix_ms) > age_limit_ms)
                    .unwrap_or(false);
                if !over_bytes && !over_age {
                    break;
                }
                let Some(seq) = shelf.sealed.keys().next().copied() else {
                    break;
                };
                if let Some(segment) = shelf.sealed.remove(&seq) {
                    evicted.push(segment);
                }
            }
        }

        for segment in evicted {
            warn!(
                tenant = label,
                seq = segment.seq,
                bytes = segment.bytes,
                "evicting sealed segment to enforce quota"
            );
            let _ = std::fs::remove_file(&segment.path);
            self.metrics
                .quota_evicted_total
                .with_label_values(&[label])
                .inc();
        }
    }

    fn open_active(
        &self,
        slot: &TenantSlot,
        writer: &mut WriterState,
        why: &'static str,
    ) -> Result<(), GatewayError> {
        let seq = writer.next_seq;
        let created_ms = Utc::now().timestamp_millis().max(0) as u64;
        let segment = SegmentWriter::create(
            &slot.dir,
            seq,
            slot.token_hash.load(Ordering::Relaxed),
            created_ms,
        )
        .map_err(|err| {
            self.note_durability_error();
            GatewayError::Internal(format!("segment create failed: {err}"))
        })?;
        writer.next_seq += 1;
        slot.active_bytes.store(segment.bytes, Ordering::Relaxed);
        slot.active_created_unix_ms
            .store(created_ms, Ordering::Relaxed);
        writer.active = Some(segment);
        self.metrics
            .wal_segments_created_total
            .with_label_values(&[&slot.label(), why])
            .inc();
        debug!(tenant = %slot.label(), seq, cause = why, "opened active segment");
        Ok(())
    }

    fn seal_active(
        &self,
        slot: &TenantSlot,
        writer: &mut WriterState,
        why: &'static str,
    ) -> Result<(), GatewayError> {
        let Some(active) = writer.active.take() else {
            return Ok(());
        };
        let seq = active.seq;
        let sealed = active.seal().map_err(|err| {
            self.note_durability_error();
            GatewayError::Internal(format!("segment seal failed: {err}"))
        })?;
        self.metrics.segment_size_bytes.observe(sealed.bytes as f64);
        {
            let mut shelf = slot
                .shelf
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            shelf.sealed.insert(
                sealed.seq,
                SealedSegment {
                    seq: sealed.seq,
                    path: sealed.path,
                    bytes: sealed.bytes,
                    created_unix_ms: sealed.created_unix_ms,
                },
            );
        }
        slot.active_bytes.store(0, Ordering::Relaxed);
        slot.active_created_unix_ms.store(0, Ordering::Relaxed);
        debug!(tenant = %slot.label(), seq, cause = why, "sealed segment");
        self.seal_notify.notify_waiters();
        Ok(())
    }

    /// Force-rotate active segments. `token` narrows to one tenant (matched
    /// by bearer token or registry name); `force` also seals empty segments.
    pub async fn seal(&self, token: Option<&str>, force: bool) -> Vec<FlushedSegment> {
        let target_safe = token.map(crate::auth::token_safe_name);
        let slots: Vec<Arc<TenantSlot>> = {
            let tenants = self
                .tenants
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            tenants
                .values()
                .filter(|slot| match (&target_safe, token) {
                    (Some(safe), Some(raw)) => {
                        slot.safe_name == *safe || slot.label() == raw
                    }
                    _ => true,
                })
                .cloned()
                .collect()
        };

        let mut flushed = Vec::new();
        for slot in slots {
            let mut writer = slot.writer.lock().await;
            let seal_worthy = writer
                .active
                .as_ref()
                .map(|a| a.records > 0 || force)
                .unwrap_or(false);
            if !seal_worthy {
                continue;
            }
            let seq = writer.active.as_ref().map(|a| a.seq).unwrap_or_default();
            let bytes = writer.active.as_ref().map(|a| a.bytes).unwrap_or_default();
            if self.seal_active(&slot, &mut writer, reason::FLUSH).is_ok() {
                flushed.push(FlushedSegment {
                    tenant: slot.label(),
                    seq,
                    bytes,
                });
            }
            drop(writer);
            self.update_gauges(&slot);
        }
        flushed
    }

    /// Tenants currently known to the WAL, for round-robin scheduling.
    pub fn tenant_names(&self) -> Vec<String> {
        let tenants = self
            .tenants
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut names: Vec<String> = tenants.keys().cloned().collect();
        names.sort();
        names
    }

    /// Sealed segments of one tenant, oldest first.
    pub fn list_sealed(&self, safe_name: &str) -> Vec<SegmentHandle> {
        let slot = {
            let tenants = self
                .tenants
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            tenants.get(safe_name).cloned()
        };
        let Some(slot) = slot else {
            return Vec::new();
        };
        let label = slot.label();
        let shelf = slot
            .shelf
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        shelf
            .sealed
            .values()
            .map(|s| SegmentHandle {
                tenant: slot.safe_name.clone(),
                label: label.clone(),
                seq: s.seq,
                path: s.path.clone(),
                bytes: s.bytes,
            })
            .collect()
    }

    /// Stream the records of a sealed segment.
    pub fn open_reader(&self, handle: &SegmentHandle) -> Result<RecordIter, GatewayError> {
        let expected_hash = {
            let tenants = self
                .tenants
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            tenants
                .get(&handle.tenant)
                .map(|slot| slot.token_hash.load(Ordering::Relaxed))
                .unwrap_or(0)
        };
        let reader = SegmentReader::open(&handle.path, expected_hash).map_err(|err| {
            self.metrics.segments_corrupt_total.inc();
            GatewayError::Internal(format!("segment {} unreadable: {err}", handle.path.display()))
        })?;
        Ok(RecordIter { reader })
    }

    /// Remove a sealed segment from disk and bookkeeping. Idempotent.
    pub fn delete(&self, handle: &SegmentHandle) {
        match std::fs::remove_file(&handle.path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                segment = %handle.path.display(),
                "failed to delete segment: {err}"
            ),
        }
        let slot = {
            let tenants = self
                .tenants
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            tenants.get(&handle.tenant).cloned()
        };
        if let Some(slot) = slot {
            {
                let mut shelf = slot
                    .shelf
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                shelf.sealed.remove(&handle.seq);
            }
            self.update_gauges(&slot);
        }
    }

    pub fn quota_state(&self, safe_name: &str) -> Option<QuotaState> {
        let slot = {
            let tenants = self
                .tenants
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            tenants.get(safe_name).cloned()
        }?;
        let bytes = slot.bytes_on_disk();
        let quota = self.settings.snapshot().wal.token_wal_quota_bytes;
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        let age = slot
            .oldest_record_unix_ms()
            .map(|ms| Duration::from_millis(now_ms.saturating_sub(ms)))
            .unwrap_or_default();
        Some(QuotaState {
            bytes,
            age,
            ratio: bytes as f64 / quota as f64,
        })
    }

    /// Snapshot of every tenant for the admin status endpoint.
    pub fn overview(&self) -> Vec<TenantOverview> {
        let slots: Vec<Arc<TenantSlot>> = {
            let tenants = self
                .tenants
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            tenants.values().cloned().collect()
        };
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        let mut overviews: Vec<TenantOverview> = slots
            .iter()
            .map(|slot| {
                let sealed = {
                    let shelf = slot
                        .shelf
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    shelf.sealed.len() as u64
                };
                let active = u64::from(slot.active_bytes.load(Ordering::Relaxed) > 0);
                TenantOverview {
                    tenant: slot.label(),
                    dir: slot.safe_name.clone(),
                    bytes_on_disk: slot.bytes_on_disk(),
                    oldest_record_age_secs: slot
                        .oldest_record_unix_ms()
                        .map(|ms| now_ms.saturating_sub(ms) / 1000)
                        .unwrap_or(0),
                    active_segments: active,
                    sealed_segments: sealed,
                }
            })
            .collect();
        overviews.sort_by(|a, b| a.tenant.cmp(&b.tenant));
        overviews
    }

    fn update_gauges(&self, slot: &TenantSlot) {
        let label = slot.label();
        self.metrics
            .wal_disk_usage_bytes
            .with_label_values(&[&label])
            .set(slot.bytes_on_disk() as i64);
        self.metrics
            .wal_segments_active
            .with_label_values(&[&label])
            .set(i64::from(slot.active_bytes.load(Ordering::Relaxed) > 0));
    }

    fn note_durability_error(&self) {
        let mut since = self
            .durability_error_since
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        since.get_or_insert_with(Instant::now);
    }

    fn clear_durability_error(&self) {
        let mut since = self
            .durability_error_since
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *since = None;
    }
}

/// Iterator over `(record, offset)` pairs of one segment. Terminates at the
/// first undecodable or corrupt frame, per the replay contract.
pub struct RecordIter {
    reader: SegmentReader,
}

impl Iterator for RecordIter {
    type Item = (NormalizedRecord, u64);

    fn next(&mut self) -> Option<Self::Item> {
        let (payload, offset) = self.reader.next_frame()?;
        match serde_json::from_slice(&payload) {
            Ok(record) => Some((record, offset)),
            Err(err) => {
                warn!(offset, "undecodable record terminates segment replay: {err}");
                None
            }
        }
    }
}
