//! Shared radio medium
//!
//! Devices whose radios share a channel, group and address form a broadcast
//! bucket. A packet sent by one member is queued at every other member of the
//! bucket. Each bucket sits behind its own lock, which is the single point
//! where concurrent sends are serialized, so every receiver observes packets
//! in the same global send order.
//!
//! Lock order is membership map, then bucket map, then a single bucket. A
//! send never holds more than one of them at a time.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use mbit_protocol::{DeviceId, RadioSettings};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::RadioError;

/// Highest transmit power level
pub const MAX_POWER: u8 = 7;

/// Addressing key of a broadcast bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    pub channel: u8,
    pub group: u8,
    pub address: u32,
}

impl BucketKey {
    /// Key a device joins with the given radio settings
    pub fn from_settings(settings: &RadioSettings) -> Self {
        Self {
            channel: settings.channel,
            group: settings.group,
            address: settings.address,
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ch{}/grp{}/0x{:08X}",
            self.channel, self.group, self.address
        )
    }
}

/// What happens when a packet arrives at a full receive queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Evict the oldest queued packet to make room
    #[default]
    DropOldest,
    /// Discard the arriving packet
    DropNewest,
}

/// What happens to queued packets when a device moves to another bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReconfigurePolicy {
    /// Discard packets queued under the old membership
    #[default]
    Flush,
    /// Carry queued packets over to the new bucket
    Preserve,
}

/// Received signal strength model
///
/// `rssi = base_dbm - (MAX_POWER - power) * step_db`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RssiModel {
    /// RSSI reported for a full-power transmission
    pub base_dbm: i16,
    /// Attenuation per power level below maximum
    pub step_db: i16,
}

impl Default for RssiModel {
    fn default() -> Self {
        Self {
            base_dbm: -30,
            step_db: 8,
        }
    }
}

impl RssiModel {
    /// RSSI seen by receivers of a packet sent at `power`
    pub fn rssi(&self, power: u8) -> i16 {
        let below_max = i16::from(MAX_POWER.saturating_sub(power));
        self.base_dbm.saturating_sub(below_max.saturating_mul(self.step_db))
    }
}

/// Radio domain configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioDomainConfig {
    /// Full-queue policy
    pub overflow: OverflowPolicy,
    /// Bucket-move policy
    pub reconfigure: ReconfigurePolicy,
    /// Signal strength model
    pub rssi: RssiModel,
    /// Capacity of each member's arrival notice channel
    pub notify_buffer: usize,
}

impl Default for RadioDomainConfig {
    fn default() -> Self {
        Self {
            overflow: OverflowPolicy::default(),
            reconfigure: ReconfigurePolicy::default(),
            rssi: RssiModel::default(),
            notify_buffer: 32,
        }
    }
}

/// A packet queued at a receiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Sending device
    pub from: DeviceId,
    /// Raw payload bytes
    pub payload: Vec<u8>,
    /// Signal strength in dBm
    pub rssi: i16,
    /// Sender's virtual time at the moment of sending
    pub timestamp_micros: u64,
}

/// Arrival notification delivered to a member's session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioNotice {
    pub from: DeviceId,
    pub length: u16,
}

/// Channel a member's session listens on for arrival notices
pub type RadioNotifier = mpsc::Sender<RadioNotice>;

/// Outcome of a broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    /// Bucket the packet was sent in
    pub key: BucketKey,
    /// Members that queued the packet
    pub delivered: usize,
    /// Packets lost to full queues (evicted or refused)
    pub dropped: usize,
}

struct Member {
    queue: VecDeque<Packet>,
    capacity: usize,
    notifier: Option<RadioNotifier>,
}

impl Member {
    fn new(capacity: usize, notifier: Option<RadioNotifier>) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            notifier,
        }
    }

    /// Queue a packet; returns (queued, dropped)
    fn enqueue(&mut self, packet: Packet, policy: OverflowPolicy) -> (bool, usize) {
        if self.capacity == 0 {
            return (false, 1);
        }
        let mut dropped = 0;
        while self.queue.len() >= self.capacity {
            match policy {
                OverflowPolicy::DropOldest => {
                    self.queue.pop_front();
                    dropped += 1;
                }
                OverflowPolicy::DropNewest => return (false, 1),
            }
        }
        self.queue.push_back(packet);
        (true, dropped)
    }

    fn shrink_to(&mut self, capacity: usize) {
        self.capacity = capacity;
        while self.queue.len() > capacity {
            self.queue.pop_front();
        }
    }

    fn notify(&self, notice: RadioNotice) {
        if let Some(tx) = &self.notifier {
            // A full or closed notifier never holds up the sender
            let _ = tx.try_send(notice);
        }
    }
}

#[derive(Default)]
struct Bucket {
    members: BTreeMap<DeviceId, Member>,
}

/// Process-wide broadcast medium shared by every session
pub struct RadioDomain {
    config: RadioDomainConfig,
    membership: Mutex<HashMap<DeviceId, BucketKey>>,
    buckets: Mutex<HashMap<BucketKey, Arc<Mutex<Bucket>>>>,
}

impl RadioDomain {
    /// Create an empty domain
    pub fn new(config: RadioDomainConfig) -> Self {
        Self {
            config,
            membership: Mutex::new(HashMap::new()),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Domain configuration
    pub fn config(&self) -> &RadioDomainConfig {
        &self.config
    }

    /// Register a device in `key`'s bucket, moving it if already registered
    ///
    /// Rejoining the same bucket keeps the queue (trimmed to the new
    /// capacity). Moving to another bucket applies the reconfigure policy.
    pub fn join(
        &self,
        device: DeviceId,
        key: BucketKey,
        capacity: usize,
        notifier: Option<RadioNotifier>,
    ) {
        let mut membership = self.membership.lock();

        let carried = match membership.get(&device).copied() {
            Some(old_key) if old_key == key => {
                if let Some(bucket) = self.bucket(&key) {
                    let mut bucket = bucket.lock();
                    if let Some(member) = bucket.members.get_mut(&device) {
                        member.shrink_to(capacity);
                        member.notifier = notifier;
                    }
                }
                return;
            }
            Some(old_key) => {
                let removed = self.detach(device, old_key);
                debug!("{} moving {} -> {}", device, old_key, key);
                match self.config.reconfigure {
                    ReconfigurePolicy::Flush => VecDeque::new(),
                    ReconfigurePolicy::Preserve => removed.map(|m| m.queue).unwrap_or_default(),
                }
            }
            None => VecDeque::new(),
        };

        let mut member = Member::new(capacity, notifier);
        member.queue = carried;
        member.shrink_to(capacity);

        let bucket = {
            let mut buckets = self.buckets.lock();
            Arc::clone(buckets.entry(key).or_default())
        };
        bucket.lock().members.insert(device, member);
        membership.insert(device, key);
        debug!("{} joined {}", device, key);
    }

    /// Move an already registered device to `key`
    pub fn reconfigure(
        &self,
        device: DeviceId,
        key: BucketKey,
        capacity: usize,
        notifier: Option<RadioNotifier>,
    ) -> Result<(), RadioError> {
        if self.bucket_of(device).is_none() {
            return Err(RadioError::NotRegistered(device));
        }
        self.join(device, key, capacity, notifier);
        Ok(())
    }

    /// Remove a device from its bucket, discarding its queue
    ///
    /// Returns false when the device was not registered.
    pub fn leave(&self, device: DeviceId) -> bool {
        let mut membership = self.membership.lock();
        let Some(key) = membership.remove(&device) else {
            return false;
        };
        self.detach(device, key);
        debug!("{} left {}", device, key);
        true
    }

    /// Broadcast a payload from `sender` to every other member of its bucket
    ///
    /// Returns `None` when the sender is not registered.
    pub fn send(
        &self,
        sender: DeviceId,
        payload: &[u8],
        power: u8,
        now_micros: u64,
    ) -> Option<SendReport> {
        let key = self.bucket_of(sender)?;
        let bucket = self.bucket(&key)?;
        let rssi = self.config.rssi.rssi(power);
        let notice = RadioNotice {
            from: sender,
            length: u16::try_from(payload.len()).unwrap_or(u16::MAX),
        };

        let mut report = SendReport {
            key,
            delivered: 0,
            dropped: 0,
        };

        let mut bucket = bucket.lock();
        if !bucket.members.contains_key(&sender) {
            return None;
        }
        for (id, member) in bucket.members.iter_mut() {
            if *id == sender {
                continue;
            }
            let packet = Packet {
                from: sender,
                payload: payload.to_vec(),
                rssi,
                timestamp_micros: now_micros,
            };
            let (queued, dropped) = member.enqueue(packet, self.config.overflow);
            report.dropped += dropped;
            if queued {
                report.delivered += 1;
                member.notify(notice);
            }
        }
        trace!(
            "{} sent {} bytes in {}: delivered={} dropped={}",
            sender,
            payload.len(),
            key,
            report.delivered,
            report.dropped
        );
        Some(report)
    }

    /// Pop the oldest packet queued for `device`
    pub fn receive(&self, device: DeviceId) -> Option<Packet> {
        let key = self.bucket_of(device)?;
        let bucket = self.bucket(&key)?;
        let mut bucket = bucket.lock();
        bucket.members.get_mut(&device)?.queue.pop_front()
    }

    /// Number of packets queued for `device`
    pub fn queue_len(&self, device: DeviceId) -> usize {
        let Some(key) = self.bucket_of(device) else {
            return 0;
        };
        self.bucket(&key)
            .and_then(|b| b.lock().members.get(&device).map(|m| m.queue.len()))
            .unwrap_or(0)
    }

    /// Bucket a device currently belongs to
    pub fn bucket_of(&self, device: DeviceId) -> Option<BucketKey> {
        self.membership.lock().get(&device).copied()
    }

    /// Members of a bucket, in id order
    pub fn members(&self, key: &BucketKey) -> Vec<DeviceId> {
        self.bucket(key)
            .map(|b| b.lock().members.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Number of non-empty buckets
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }

    fn bucket(&self, key: &BucketKey) -> Option<Arc<Mutex<Bucket>>> {
        self.buckets.lock().get(key).cloned()
    }

    /// Remove a member from a bucket, dropping the bucket once empty
    ///
    /// Caller must hold the membership lock.
    fn detach(&self, device: DeviceId, key: BucketKey) -> Option<Member> {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.get(&key).cloned()?;
        let mut guard = bucket.lock();
        let removed = guard.members.remove(&device);
        if guard.members.is_empty() {
            buckets.remove(&key);
        }
        removed
    }
}

impl fmt::Debug for RadioDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RadioDomain")
            .field("config", &self.config)
            .field("members", &self.membership.lock().len())
            .field("buckets", &self.bucket_count())
            .finish()
    }
}
