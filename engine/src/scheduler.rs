use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::SchedulerConfig;
use crate::error::FetchError;
use crate::tiles::{ScheduledTile, TileKey};

/// Identifies one fetch attempt. The host hands it back on completion; a
/// ticket that no longer matches the inflight attempt for its key is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FetchTicket {
    pub key: TileKey,
    pub generation: u64,
    pub serial: u64,
}

/// What the host should fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub ticket: FetchTicket,
    pub url: String,
    pub attempt: u32,
    /// Sent as `Authorization: Bearer <token>` when present.
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub tile: ScheduledTile,
    pub attempt: u32,
    pub ready_at: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InflightItem {
    pub tile: ScheduledTile,
    pub attempt: u32,
    pub ticket: FetchTicket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSnapshot {
    pub inflight: usize,
    pub queued: usize,
    pub aborted: u64,
    pub retries: u64,
    pub failed: u64,
}

/// A tile whose retries are exhausted.
#[derive(Debug, Clone, PartialEq)]
pub struct TileFailure {
    pub tile: ScheduledTile,
    pub error: FetchError,
    pub attempt_count: u32,
}

/// Side effects the host must carry out, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEffect {
    Start(FetchRequest),
    Cancel(FetchTicket),
    /// Call `poll` at this time (ms). Replaces any earlier wake-up.
    WakeAt(f64),
    Failed(TileFailure),
    Snapshot(SchedulerSnapshot),
}

/// `min(max_delay, base * 2^(attempt-1)) * jitter`.
pub fn backoff_delay(attempt: u32, config: &SchedulerConfig, jitter: f64) -> f64 {
    let exponent = attempt.saturating_sub(1).min(52) as i32;
    let delay = (config.retry_base_delay_ms * 2f64.powi(exponent)).min(config.retry_max_delay_ms);
    delay * jitter
}

/// Priority queue of tile fetches with bounded concurrency, retry with
/// backoff and visibility-driven cancellation.
///
/// The scheduler performs no I/O. Every public operation records effects
/// that the caller drains with [`FetchScheduler::drain_effects`].
#[derive(Debug)]
pub struct FetchScheduler {
    config: SchedulerConfig,
    rng: SmallRng,
    queue: Vec<QueueItem>,
    inflight: HashMap<TileKey, InflightItem>,
    failed_keys: HashSet<TileKey>,
    generation: u64,
    next_serial: u64,
    aborted: u64,
    retries: u64,
    failed: u64,
    armed_wake: Option<f64>,
    effects: Vec<SchedulerEffect>,
    changed: bool,
}

impl FetchScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_rng(config, SmallRng::from_entropy())
    }

    pub fn with_rng(config: SchedulerConfig, rng: SmallRng) -> Self {
        Self {
            config,
            rng,
            queue: Vec::new(),
            inflight: HashMap::new(),
            failed_keys: HashSet::new(),
            generation: 0,
            next_serial: 0,
            aborted: 0,
            retries: 0,
            failed: 0,
            armed_wake: None,
            effects: Vec::new(),
            changed: false,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_inflight(&self, key: TileKey) -> bool {
        self.inflight.contains_key(&key)
    }

    /// The tile `ticket` was issued for, if it is still the live attempt.
    pub fn live_tile(&self, ticket: FetchTicket) -> Option<&ScheduledTile> {
        if ticket.generation != self.generation {
            return None;
        }
        self.inflight
            .get(&ticket.key)
            .filter(|item| item.ticket == ticket)
            .map(|item| &item.tile)
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            inflight: self.inflight.len(),
            queued: self.queue.len(),
            aborted: self.aborted,
            retries: self.retries,
            failed: self.failed,
        }
    }

    pub fn drain_effects(&mut self) -> Vec<SchedulerEffect> {
        std::mem::take(&mut self.effects)
    }

    /// Replace the wanted set.
    ///
    /// Known keys only get their url, bounds and distance refreshed. Queued
    /// keys that are no longer wanted are dropped, inflight ones are
    /// cancelled and counted as aborted.
    pub fn schedule(&mut self, tiles: &[ScheduledTile], now: f64) {
        let wanted: HashMap<TileKey, &ScheduledTile> =
            tiles.iter().map(|tile| (tile.key, tile)).collect();

        let queued_before = self.queue.len();
        self.queue.retain(|item| wanted.contains_key(&item.tile.key));
        if self.queue.len() != queued_before {
            self.changed = true;
        }

        let mut stale: Vec<TileKey> = self
            .inflight
            .keys()
            .filter(|key| !wanted.contains_key(key))
            .copied()
            .collect();
        stale.sort_unstable();
        for key in stale {
            if let Some(item) = self.inflight.remove(&key) {
                debug!(tile = %key, "cancelling fetch that left the view");
                self.aborted += 1;
                self.changed = true;
                self.effects.push(SchedulerEffect::Cancel(item.ticket));
            }
        }

        for tile in tiles {
            if let Some(item) = self.inflight.get_mut(&tile.key) {
                item.tile.clone_from(tile);
            } else if let Some(item) = self.queue.iter_mut().find(|item| item.tile.key == tile.key) {
                item.tile.clone_from(tile);
            } else if !self.failed_keys.contains(&tile.key) {
                self.queue.push(QueueItem {
                    tile: tile.clone(),
                    attempt: 0,
                    ready_at: now,
                });
                self.changed = true;
            }
        }

        self.pump(now);
        self.finish();
    }

    /// Timer wake-up: the previously armed deadline has fired.
    pub fn poll(&mut self, now: f64) {
        self.armed_wake = None;
        self.pump(now);
        self.finish();
    }

    /// Settle a successful fetch. Returns the tile if `ticket` is still the
    /// live attempt for its key; stale results return `None` and must be
    /// discarded without creating GPU resources.
    pub fn complete(&mut self, ticket: FetchTicket, now: f64) -> Option<ScheduledTile> {
        let item = self.take_live(ticket)?;
        self.changed = true;
        self.pump(now);
        self.finish();
        Some(item.tile)
    }

    /// Settle a failed fetch: retry with backoff, or report it exhausted.
    pub fn fail(&mut self, ticket: FetchTicket, error: FetchError, now: f64) {
        let Some(item) = self.take_live(ticket) else {
            return;
        };
        self.changed = true;

        if error.is_cancellation() {
            self.aborted += 1;
        } else if item.attempt < self.config.max_retries {
            let attempt = item.attempt + 1;
            let jitter = self.jitter();
            let delay = backoff_delay(attempt, &self.config, jitter);
            debug!(tile = %item.tile.key, attempt, delay_ms = delay, %error, "retrying tile");
            self.retries += 1;
            self.queue.push(QueueItem {
                tile: item.tile,
                attempt,
                ready_at: now + delay,
            });
        } else {
            let attempt_count = item.attempt + 1;
            warn!(tile = %item.tile.key, attempt_count, %error, "tile failed");
            self.failed += 1;
            self.failed_keys.insert(item.tile.key);
            self.effects.push(SchedulerEffect::Failed(TileFailure {
                tile: item.tile,
                error,
                attempt_count,
            }));
        }

        self.pump(now);
        self.finish();
    }

    /// Start a new generation: cancel everything inflight, drop the queue
    /// and forget failures. Results from the old generation become stale.
    pub fn reset(&mut self) {
        self.generation += 1;
        let mut inflight: Vec<InflightItem> = self.inflight.drain().map(|(_, item)| item).collect();
        inflight.sort_unstable_by_key(|item| item.tile.key);
        for item in inflight {
            self.aborted += 1;
            self.effects.push(SchedulerEffect::Cancel(item.ticket));
        }
        self.queue.clear();
        self.failed_keys.clear();
        self.armed_wake = None;
        self.changed = true;
        debug!(generation = self.generation, "scheduler reset");
        self.finish();
    }

    fn take_live(&mut self, ticket: FetchTicket) -> Option<InflightItem> {
        if ticket.generation != self.generation {
            debug!(tile = %ticket.key, generation = ticket.generation, "discarding result from old generation");
            return None;
        }
        match self.inflight.get(&ticket.key) {
            Some(item) if item.ticket == ticket => self.inflight.remove(&ticket.key),
            _ => {
                debug!(tile = %ticket.key, "discarding stale fetch result");
                None
            }
        }
    }

    fn jitter(&mut self) -> f64 {
        let (min, max) = (self.config.jitter_min, self.config.jitter_max);
        if max > min {
            self.rng.gen_range(min..=max)
        } else {
            min
        }
    }

    /// Index of the queue head: earliest ready time, then distance, then
    /// finer tier, then key.
    fn head(&self) -> Option<usize> {
        self.queue
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.ready_at
                    .total_cmp(&b.ready_at)
                    .then_with(|| a.tile.distance_sq.total_cmp(&b.tile.distance_sq))
                    .then_with(|| Reverse(a.tile.tier()).cmp(&Reverse(b.tile.tier())))
                    .then_with(|| a.tile.key.cmp(&b.tile.key))
            })
            .map(|(index, _)| index)
    }

    fn pump(&mut self, now: f64) {
        let mut wake = None;
        while self.inflight.len() < self.config.max_concurrency {
            let Some(index) = self.head() else {
                break;
            };
            if self.queue[index].ready_at > now {
                wake = Some(self.queue[index].ready_at);
                break;
            }
            let item = self.queue.swap_remove(index);
            self.next_serial += 1;
            let ticket = FetchTicket {
                key: item.tile.key,
                generation: self.generation,
                serial: self.next_serial,
            };
            self.effects.push(SchedulerEffect::Start(FetchRequest {
                ticket,
                url: item.tile.url.clone(),
                attempt: item.attempt,
                auth_token: None,
            }));
            self.inflight.insert(
                item.tile.key,
                InflightItem {
                    tile: item.tile,
                    attempt: item.attempt,
                    ticket,
                },
            );
            self.changed = true;
        }

        if wake != self.armed_wake {
            self.armed_wake = wake;
            if let Some(deadline) = wake {
                self.effects.push(SchedulerEffect::WakeAt(deadline));
            }
        }
    }

    fn finish(&mut self) {
        if std::mem::take(&mut self.changed) {
            let snapshot = self.snapshot();
            self.effects.push(SchedulerEffect::Snapshot(snapshot));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::viewport::Rect;

    fn tile(tier: u8, x: u32, y: u32, distance_sq: f64) -> ScheduledTile {
        let key = TileKey::new(tier, x, y);
        ScheduledTile {
            key,
            bounds: Rect::new(x as f64 * 256.0, y as f64 * 256.0, 256.0, 256.0),
            distance_sq,
            url: format!("/tiles/{key}"),
        }
    }

    fn grid(n: u32) -> Vec<ScheduledTile> {
        (0..n).map(|i| tile(10, i, 0, i as f64)).collect()
    }

    fn scheduler() -> FetchScheduler {
        FetchScheduler::with_rng(SchedulerConfig::default(), SmallRng::seed_from_u64(7))
    }

    fn starts(effects: &[SchedulerEffect]) -> Vec<FetchRequest> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                SchedulerEffect::Start(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    fn wake(effects: &[SchedulerEffect]) -> Option<f64> {
        effects.iter().find_map(|effect| match effect {
            SchedulerEffect::WakeAt(at) => Some(*at),
            _ => None,
        })
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        let config = SchedulerConfig::default();
        assert_eq!(backoff_delay(1, &config, 1.0), 120.0);
        assert_eq!(backoff_delay(2, &config, 1.0), 240.0);
        assert_eq!(backoff_delay(3, &config, 1.0), 480.0);
        assert_eq!(backoff_delay(10, &config, 1.0), 2_000.0);
        assert_eq!(backoff_delay(1, &config, 0.85), 102.0);
    }

    #[test]
    fn starts_nearest_tiles_up_to_max_concurrency() {
        let mut s = scheduler();
        s.schedule(&grid(10), 0.0);
        let started = starts(&s.drain_effects());
        assert_eq!(started.len(), 6);
        let xs: Vec<u32> = started.iter().map(|r| r.ticket.key.x()).collect();
        assert_eq!(xs, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(s.snapshot().inflight, 6);
        assert_eq!(s.snapshot().queued, 4);
    }

    #[test]
    fn inflight_never_exceeds_max_concurrency() {
        let mut s = scheduler();
        let mut now = 0.0;
        for round in 0..40u32 {
            now += 16.0;
            let n = 3 + round % 11;
            let set: Vec<ScheduledTile> = (0..n)
                .map(|i| tile(10, (i + round) % 17, round % 3, i as f64))
                .collect();
            s.schedule(&set, now);
            let started = starts(&s.drain_effects());
            assert!(s.inflight_len() <= 6);
            // Settle every other started fetch to keep the pipeline moving.
            for request in started.iter().step_by(2) {
                if round % 4 == 0 {
                    s.fail(request.ticket, FetchError::Network("reset".into()), now);
                } else {
                    s.complete(request.ticket, now);
                }
                assert!(s.inflight_len() <= 6);
            }
            s.drain_effects();
        }
    }

    #[test]
    fn same_set_twice_starts_nothing_new() {
        let mut s = scheduler();
        let set = grid(9);
        s.schedule(&set, 0.0);
        s.drain_effects();
        s.schedule(&set, 5.0);
        let effects = s.drain_effects();
        assert!(starts(&effects).is_empty());
        assert!(effects.is_empty(), "unchanged state emits no snapshot: {effects:?}");
    }

    #[test]
    fn refresh_updates_metadata_of_known_keys() {
        let mut s = scheduler();
        let mut set = grid(8);
        s.schedule(&set, 0.0);
        s.drain_effects();
        set[7].distance_sq = -1.0;
        set[7].url = "/moved".to_string();
        set[0].url = "/moved-inflight".to_string();
        s.schedule(&set, 1.0);
        assert!(starts(&s.drain_effects()).is_empty());

        let first = s.inflight.get(&set[0].key).map(|item| item.tile.url.clone());
        assert_eq!(first.as_deref(), Some("/moved-inflight"));

        // The refreshed distance now puts x=7 ahead of x=6.
        let ticket = s.inflight.get(&set[1].key).map(|item| item.ticket);
        s.complete(ticket.expect("inflight"), 2.0);
        let started = starts(&s.drain_effects());
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].url, "/moved");
    }

    #[test]
    fn empty_schedule_then_restore() {
        let mut s = scheduler();
        let set = grid(9);
        s.schedule(&set, 0.0);
        s.drain_effects();
        let before = s.snapshot();

        s.schedule(&[], 10.0);
        let cancels = s
            .drain_effects()
            .iter()
            .filter(|e| matches!(e, SchedulerEffect::Cancel(_)))
            .count();
        assert_eq!(cancels, 6);
        assert_eq!(s.snapshot().inflight, 0);
        assert_eq!(s.snapshot().queued, 0);
        assert_eq!(s.snapshot().aborted, 6);

        s.schedule(&set, 20.0);
        let started = starts(&s.drain_effects());
        assert_eq!(started.len(), 6);
        assert_eq!(s.snapshot().inflight, before.inflight);
        assert_eq!(s.snapshot().queued, before.queued);
        let mut inflight: Vec<TileKey> = s.inflight.keys().copied().collect();
        inflight.sort_unstable();
        assert_eq!(inflight, set[..6].iter().map(|t| t.key).collect::<Vec<_>>());
    }

    #[test]
    fn panning_away_cancels_without_failing_and_late_result_is_discarded() {
        let mut s = scheduler();
        let a = tile(10, 0, 0, 0.0);
        let b = tile(10, 5, 5, 1.0);
        s.schedule(&[a.clone(), b.clone()], 0.0);
        let started = starts(&s.drain_effects());
        let ticket_a = started[0].ticket;
        assert_eq!(ticket_a.key, a.key);

        s.schedule(std::slice::from_ref(&b), 10.0);
        let effects = s.drain_effects();
        assert!(effects.contains(&SchedulerEffect::Cancel(ticket_a)));
        assert_eq!(s.snapshot().aborted, 1);
        assert_eq!(s.snapshot().failed, 0);

        assert_eq!(s.complete(ticket_a, 20.0), None);
        s.fail(ticket_a, FetchError::Cancelled, 20.0);
        assert_eq!(s.snapshot().failed, 0);
        assert_eq!(s.snapshot().aborted, 1);
    }

    #[test]
    fn retries_with_backoff_then_reports_once() {
        let mut s = scheduler();
        let t = tile(10, 3, 3, 0.0);
        s.schedule(std::slice::from_ref(&t), 0.0);
        let mut request = starts(&s.drain_effects()).remove(0);
        assert_eq!(request.attempt, 0);

        let mut now = 50.0;
        let mut delays = Vec::new();
        for expected in [120.0, 240.0] {
            s.fail(request.ticket, FetchError::Http { status: 503 }, now);
            let effects = s.drain_effects();
            assert!(starts(&effects).is_empty(), "retry must not start early");
            let deadline = wake(&effects).expect("wake armed");
            let delay = deadline - now;
            assert!(
                delay >= expected * 0.85 - 1e-9 && delay <= expected * 1.15 + 1e-9,
                "delay {delay} outside jitter for {expected}"
            );
            delays.push(delay);

            s.poll(deadline - 1.0);
            let effects = s.drain_effects();
            assert!(starts(&effects).is_empty());
            assert_eq!(wake(&effects), Some(deadline));

            s.poll(deadline);
            request = starts(&s.drain_effects()).remove(0);
            now = deadline + 30.0;
        }
        assert_eq!(request.attempt, 2);
        assert_eq!(delays.len(), 2);

        s.fail(request.ticket, FetchError::Http { status: 503 }, now);
        let failures: Vec<TileFailure> = s
            .drain_effects()
            .into_iter()
            .filter_map(|e| match e {
                SchedulerEffect::Failed(failure) => Some(failure),
                _ => None,
            })
            .collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].attempt_count, 3);
        assert_eq!(failures[0].error, FetchError::Http { status: 503 });
        assert_eq!(s.snapshot().retries, 2);
        assert_eq!(s.snapshot().failed, 1);

        // Still visible, but not retried again in this generation.
        s.schedule(std::slice::from_ref(&t), now + 100.0);
        assert!(starts(&s.drain_effects()).is_empty());
        assert_eq!(s.snapshot().queued, 0);
    }

    #[test]
    fn earlier_ready_time_starts_before_nearer_tile() {
        let mut s = FetchScheduler::with_rng(
            SchedulerConfig {
                max_concurrency: 1,
                ..SchedulerConfig::default()
            },
            SmallRng::seed_from_u64(1),
        );
        let blocker = tile(10, 9, 9, 100.0);
        s.schedule(std::slice::from_ref(&blocker), 0.0);
        let first = starts(&s.drain_effects()).remove(0);
        let older = tile(10, 2, 2, 50.0);
        let near = tile(10, 1, 1, 1.0);
        s.schedule(&[blocker.clone(), older.clone()], 10.0);
        s.schedule(&[blocker, older.clone(), near], 20.0);
        s.drain_effects();
        s.complete(first.ticket, 30.0);
        let next = starts(&s.drain_effects()).remove(0);
        assert_eq!(next.ticket.key, older.key);
    }

    #[test]
    fn backoff_item_waits_even_when_it_leads_the_queue() {
        let mut s = FetchScheduler::with_rng(
            SchedulerConfig {
                max_concurrency: 1,
                ..SchedulerConfig::default()
            },
            SmallRng::seed_from_u64(1),
        );
        let retried = tile(10, 1, 1, 1.0);
        s.schedule(std::slice::from_ref(&retried), 0.0);
        let first = starts(&s.drain_effects()).remove(0);
        s.fail(first.ticket, FetchError::Http { status: 503 }, 5.0);
        let effects = s.drain_effects();
        assert!(starts(&effects).is_empty());
        let deadline = wake(&effects).expect("retry wake armed");
        assert!(deadline > 5.0);
        s.poll(deadline - 1.0);
        assert!(starts(&s.drain_effects()).is_empty());
        s.poll(deadline);
        assert_eq!(starts(&s.drain_effects())[0].ticket.key, retried.key);
    }

    #[test]
    fn reset_cancels_and_invalidates_old_tickets() {
        let mut s = scheduler();
        s.schedule(&grid(3), 0.0);
        let started = starts(&s.drain_effects());
        s.reset();
        let effects = s.drain_effects();
        let cancelled = effects
            .iter()
            .filter(|e| matches!(e, SchedulerEffect::Cancel(_)))
            .count();
        assert_eq!(cancelled, 3);
        assert!(matches!(effects.last(), Some(SchedulerEffect::Snapshot(_))));
        assert_eq!(s.generation(), 1);

        s.schedule(&grid(3), 1.0);
        s.drain_effects();
        assert_eq!(s.complete(started[0].ticket, 2.0), None);
        assert!(s.is_inflight(started[0].ticket.key));
    }

    #[test]
    fn superseded_attempt_is_stale() {
        let mut s = scheduler();
        let t = tile(10, 0, 0, 0.0);
        s.schedule(std::slice::from_ref(&t), 0.0);
        let first = starts(&s.drain_effects()).remove(0);
        s.schedule(&[], 1.0);
        s.schedule(std::slice::from_ref(&t), 2.0);
        let second = starts(&s.drain_effects()).remove(0);
        assert_ne!(first.ticket, second.ticket);
        assert_eq!(s.complete(first.ticket, 3.0), None);
        assert_eq!(s.complete(second.ticket, 3.0).map(|t| t.key), Some(t.key));
        assert_eq!(s.snapshot().inflight, 0);
    }

    #[test]
    fn one_snapshot_per_operation() {
        let mut s = scheduler();
        s.schedule(&grid(10), 0.0);
        let snapshots = s
            .drain_effects()
            .iter()
            .filter(|e| matches!(e, SchedulerEffect::Snapshot(_)))
            .count();
        assert_eq!(snapshots, 1);
    }
}
