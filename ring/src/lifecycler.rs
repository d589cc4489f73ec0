//! The lifecycler: the per-process state machine owning one instance's
//! entry in the ring.
//!
//! Exactly one lifecycler runs per process per logical ring. It drives the
//! instance through `PENDING -> JOINING -> ACTIVE -> LEAVING -> removed`,
//! writing every transition to the shared KV with compare-and-swap so
//! concurrent lifecyclers never clobber each other's entries:
//!
//! * **Join.** After an optional `join_after` delay the instance inserts
//!   itself with `num_tokens` random tokens (restored from the tokens file
//!   when configured, so restarts keep stable placement).
//! * **Observe.** While JOINING the ring is re-read and any token also
//!   claimed by a lexicographically smaller instance id is regenerated -
//!   the resolution for two concurrent joins picking the same token.
//! * **Heartbeat.** Every `heartbeat_period` the instance refreshes its
//!   entry's timestamp, re-inserting the entry if something removed it.
//!   The same CAS sweeps out peers whose heartbeats are older than
//!   `auto_forget_periods x heartbeat_timeout`, so crashed instances are
//!   expelled without operator action.
//! * **Leave.** Graceful shutdown transitions to LEAVING, runs the
//!   transfer/flush hooks, sleeps `final_sleep`, then removes the entry
//!   (which the gossip KV turns into a LEFT tombstone).
//! * **Handoff.** Optionally, a starting instance adopts the tokens of a
//!   LEAVING donor after pulling its data via the transfer hook, instead of
//!   generating fresh tokens.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::{Backoff, BackoffConfig};
use clock::TimeProvider;
use kv::Client;
use observability_deps::tracing::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::desc::{Desc, InstanceDesc, InstanceState};
use crate::tokens::{generate_tokens, load_tokens_file, save_tokens_file};
use crate::RingConfig;

/// Lifecycler configuration.
#[derive(Debug, Clone)]
pub struct LifecyclerConfig {
    /// The ring this lifecycler registers into.
    pub ring: RingConfig,

    /// This instance's id: stable across restarts of one instance.
    pub id: String,

    /// The address advertised to other ring members.
    pub addr: String,

    /// The availability zone advertised to the ring, if any.
    pub zone: String,

    /// Tokens to claim on the ring.
    pub num_tokens: usize,

    /// How often the instance refreshes its heartbeat (and runs the
    /// auto-forget sweep).
    pub heartbeat_period: Duration,

    /// Delay between process start and inserting tokens into the ring.
    pub join_after: Duration,

    /// Minimum ACTIVE dwell before [`Lifecycler::check_ready`] reports
    /// ready.
    pub min_ready_duration: Duration,

    /// How long to observe the ring for token conflicts while JOINING. Zero
    /// skips straight to ACTIVE.
    pub observe_period: Duration,

    /// Sleep between finishing the leave hooks and removing the ring entry,
    /// letting in-flight requests drain.
    pub final_sleep: Duration,

    /// Handoff attempts against a LEAVING donor before generating fresh
    /// tokens. Zero disables handoff entirely.
    pub max_transfer_retries: usize,

    /// Persist this instance's tokens here, restoring them at startup.
    pub tokens_file_path: Option<PathBuf>,

    /// Remove any peer whose heartbeat is older than this many heartbeat
    /// timeouts. Zero disables auto-forget.
    pub auto_forget_periods: u32,
}

impl LifecyclerConfig {
    /// A config with production defaults for the instance `id`, advertising
    /// `addr`.
    pub fn new(id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            ring: RingConfig::default(),
            id: id.into(),
            addr: addr.into(),
            zone: String::new(),
            num_tokens: 128,
            heartbeat_period: Duration::from_secs(5),
            join_after: Duration::ZERO,
            min_ready_duration: Duration::from_secs(15),
            observe_period: Duration::ZERO,
            final_sleep: Duration::from_secs(30),
            max_transfer_retries: 0,
            tokens_file_path: None,
            auto_forget_periods: 10,
        }
    }
}

/// The error returned by [`FlushTransferer`] hooks.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TransferError(pub String);

/// The data-movement hooks a ring consumer supplies to its lifecycler.
///
/// The lifecycler owns *placement*; these hooks own the *data* living at
/// that placement.
#[async_trait::async_trait]
pub trait FlushTransferer: std::fmt::Debug + Send + Sync {
    /// Pull the workload owned by the LEAVING `donor` into this instance.
    /// Invoked during handoff, before this instance claims the donor's
    /// tokens.
    async fn transfer_in(&self, donor_id: &str, donor: &InstanceDesc) -> Result<(), TransferError>;

    /// Push this instance's data to its successors before leaving the ring.
    async fn transfer_out(&self) -> Result<(), TransferError>;

    /// Flush all local data to durable storage. The fallback when no
    /// transfer target exists.
    async fn flush(&self);
}

/// A [`FlushTransferer`] for consumers with no data to move.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFlushTransferer;

#[async_trait::async_trait]
impl FlushTransferer for NoopFlushTransferer {
    async fn transfer_in(
        &self,
        _donor_id: &str,
        _donor: &InstanceDesc,
    ) -> Result<(), TransferError> {
        Err(TransferError("transfers are disabled".to_string()))
    }

    async fn transfer_out(&self) -> Result<(), TransferError> {
        Err(TransferError("transfers are disabled".to_string()))
    }

    async fn flush(&self) {}
}

/// The reasons an instance does not (yet) report ready.
#[derive(Debug, thiserror::Error)]
pub enum ReadyError {
    /// The instance has not reached ACTIVE.
    #[error("instance {id} in state {state:?}, waiting for ACTIVE")]
    NotActive {
        /// This instance's id.
        id: String,
        /// Its current state.
        state: InstanceState,
    },

    /// The instance is ACTIVE but has not dwelled long enough.
    #[error("instance {id} has been ACTIVE for {elapsed:?}, waiting for {required:?}")]
    MinReadyDuration {
        /// This instance's id.
        id: String,
        /// Time spent ACTIVE so far.
        elapsed: Duration,
        /// The configured minimum dwell.
        required: Duration,
    },
}

/// The per-instance ring membership driver. See the module docs for the
/// state machine.
#[derive(Debug)]
pub struct Lifecycler {
    cfg: LifecyclerConfig,
    kv: Arc<dyn Client<Desc>>,
    flush_transferer: Arc<dyn FlushTransferer>,
    time_provider: Arc<dyn TimeProvider>,

    state: watch::Sender<InstanceState>,
    tokens: Mutex<Vec<u32>>,
    active_since: Mutex<Option<Instant>>,

    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Lifecycler {
    /// Start a lifecycler for `cfg.id`, driving its ring entry until
    /// [`Lifecycler::shutdown`] is awaited.
    pub fn start(
        cfg: LifecyclerConfig,
        kv: Arc<dyn Client<Desc>>,
        flush_transferer: Arc<dyn FlushTransferer>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(InstanceState::Pending);

        let lifecycler = Arc::new(Self {
            cfg,
            kv,
            flush_transferer,
            time_provider,
            state,
            tokens: Mutex::new(Vec::new()),
            active_since: Mutex::new(None),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        });

        let task = tokio::spawn({
            let lifecycler = Arc::clone(&lifecycler);
            async move { lifecycler.run().await }
        });
        *lifecycler.task.lock() = Some(task);

        lifecycler
    }

    /// This instance's id.
    pub fn id(&self) -> &str {
        &self.cfg.id
    }

    /// The current lifecycle state.
    pub fn state(&self) -> InstanceState {
        *self.state.borrow()
    }

    /// Observe lifecycle state transitions.
    pub fn watch_state(&self) -> watch::Receiver<InstanceState> {
        self.state.subscribe()
    }

    /// The tokens currently claimed by this instance.
    pub fn tokens(&self) -> Vec<u32> {
        self.tokens.lock().clone()
    }

    /// The readiness probe: succeeds once the instance has been ACTIVE for
    /// at least `min_ready_duration`.
    pub fn check_ready(&self) -> Result<(), ReadyError> {
        let state = self.state();
        if state != InstanceState::Active {
            return Err(ReadyError::NotActive {
                id: self.cfg.id.clone(),
                state,
            });
        }

        let elapsed = self
            .active_since
            .lock()
            .map(|since| since.elapsed())
            .unwrap_or_default();
        if elapsed < self.cfg.min_ready_duration {
            return Err(ReadyError::MinReadyDuration {
                id: self.cfg.id.clone(),
                elapsed,
                required: self.cfg.min_ready_duration,
            });
        }

        Ok(())
    }

    /// Gracefully stop: transition to LEAVING, run the transfer/flush
    /// hooks, remove this instance's ring entry, and wait for the driver
    /// task to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(id=%self.cfg.id, error=%e, "lifecycler task terminated abnormally");
            }
        }
    }

    fn set_state(&self, new: InstanceState) {
        let old = *self.state.borrow();
        if old == new {
            return;
        }
        info!(id=%self.cfg.id, ?old, ?new, "lifecycler state transition");
        if new == InstanceState::Active {
            *self.active_since.lock() = Some(Instant::now());
        }
        self.state.send_replace(new);
    }

    /// Sleep for `duration`, returning `Err` when shutdown is requested
    /// first.
    async fn interruptible_sleep(&self, duration: Duration) -> Result<(), ()> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(()),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    async fn run(self: Arc<Self>) {
        let mut backoff = Backoff::new(&BackoffConfig::default());
        let joined = loop {
            match self.join_sequence().await {
                Ok(joined) => break joined,
                Err(e) if e.is_transient() => {
                    warn!(id=%self.cfg.id, error=%e, "transient error joining the ring, retrying");
                    let delay = backoff.next().expect("backoff has no deadline");
                    if self.interruptible_sleep(delay).await.is_err() {
                        break false;
                    }
                }
                Err(e) => {
                    // Unrecoverable (codec mismatch on the ring key): this
                    // instance cannot take part in the ring, and must not
                    // pretend otherwise.
                    error!(id=%self.cfg.id, error=%e, "lifecycler failed to join the ring");
                    return;
                }
            }
        };

        if !joined {
            debug!(id=%self.cfg.id, "lifecycler interrupted before joining");
            return;
        }

        self.heartbeat_loop().await;

        if let Err(e) = self.leave_sequence().await {
            warn!(id=%self.cfg.id, error=%e, "error during graceful ring departure");
        }
    }

    /// Drive the instance from PENDING to ACTIVE. Returns false when
    /// shutdown interrupted the sequence before the instance joined.
    async fn join_sequence(&self) -> Result<bool, kv::Error> {
        if let Some(path) = &self.cfg.tokens_file_path {
            match load_tokens_file(path) {
                Ok(Some(tokens)) => {
                    info!(id=%self.cfg.id, n_tokens = tokens.len(), "restored tokens from file");
                    *self.tokens.lock() = tokens;
                }
                Ok(None) => {}
                Err(e) => warn!(id=%self.cfg.id, error=%e, "ignoring unreadable tokens file"),
            }
        }

        self.set_state(InstanceState::Pending);

        if self.cfg.max_transfer_retries > 0 && self.try_handoff().await? {
            return Ok(true);
        }

        if !self.cfg.join_after.is_zero() {
            info!(id=%self.cfg.id, delay=?self.cfg.join_after, "waiting before joining the ring");
            if self.interruptible_sleep(self.cfg.join_after).await.is_err() {
                return Ok(false);
            }
        }

        self.register_with_tokens().await?;
        self.set_state(InstanceState::Joining);

        if !self.observe().await? {
            return Ok(false);
        }

        self.cas_own_state(InstanceState::Active).await?;
        self.set_state(InstanceState::Active);
        self.persist_tokens();
        info!(id=%self.cfg.id, n_tokens = self.tokens.lock().len(), "instance active in the ring");

        Ok(true)
    }

    /// Insert this instance into the ring in state JOINING, claiming
    /// `num_tokens` tokens disjoint from every token already placed.
    /// Previously persisted tokens are re-claimed where still free.
    async fn register_with_tokens(&self) -> Result<(), kv::Error> {
        let id = self.cfg.id.clone();
        let addr = self.cfg.addr.clone();
        let zone = self.cfg.zone.clone();
        let num_tokens = self.cfg.num_tokens;
        let preloaded = self.tokens.lock().clone();
        let time_provider = Arc::clone(&self.time_provider);

        let mut chosen: Option<Vec<u32>> = None;
        self.kv
            .cas(&self.cfg.ring.key, &mut |current| {
                chosen = None;
                let mut desc: Desc = current.unwrap_or_default();

                let mut taken = desc
                    .instances
                    .iter()
                    .filter(|(other, _)| **other != id)
                    .flat_map(|(_, d)| d.tokens.iter().copied())
                    .collect::<Vec<_>>();

                // Re-claim persisted tokens that nobody else took in the
                // meantime, and top up with fresh ones.
                let mut tokens = preloaded
                    .iter()
                    .copied()
                    .filter(|t| !taken.contains(t))
                    .collect::<Vec<_>>();
                if tokens.len() < num_tokens {
                    taken.extend(&tokens);
                    tokens.extend(generate_tokens(num_tokens - tokens.len(), &taken));
                }
                tokens.truncate(num_tokens);

                let now = time_provider.now();
                let registered_at = desc
                    .get(&id)
                    .map(|d| d.registered_timestamp)
                    .filter(|ts| *ts > 0)
                    .unwrap_or_else(|| now.timestamp());

                let mut entry = InstanceDesc::new(
                    addr.clone(),
                    zone.clone(),
                    tokens.clone(),
                    InstanceState::Joining,
                    now,
                    now,
                );
                entry.registered_timestamp = registered_at;
                desc.insert(id.clone(), entry);

                chosen = Some(tokens);
                Ok((Some(desc), true))
            })
            .await?;

        let tokens = chosen.expect("CAS transform committed an insertion");
        *self.tokens.lock() = tokens;
        Ok(())
    }

    /// Watch the ring for `observe_period`, regenerating any token a
    /// concurrent join also claimed. The timer restarts after each
    /// regeneration; the instance promotes only after a full quiet period.
    async fn observe(&self) -> Result<bool, kv::Error> {
        if self.cfg.observe_period.is_zero() {
            return Ok(true);
        }

        info!(id=%self.cfg.id, period=?self.cfg.observe_period, "observing ring before activating");

        let step = (self.cfg.observe_period / 10).max(Duration::from_millis(100));
        let mut deadline = Instant::now() + self.cfg.observe_period;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if self
                .interruptible_sleep(step.min(remaining))
                .await
                .is_err()
            {
                return Ok(false);
            }

            let desc = self.kv.get(&self.cfg.ring.key).await?.unwrap_or_default();

            // Of the tokens also claimed by someone else, this instance
            // loses those where the claimant has the smaller id.
            let lost = desc
                .conflicting_tokens(&self.cfg.id)
                .into_iter()
                .filter(|(_, claimant)| claimant.as_str() < self.cfg.id.as_str())
                .map(|(token, _)| token)
                .collect::<Vec<_>>();

            if !lost.is_empty() {
                warn!(id=%self.cfg.id, conflicts = lost.len(), "token conflict observed, regenerating");
                self.regenerate_tokens(&lost).await?;
                deadline = Instant::now() + self.cfg.observe_period;
                continue;
            }

            if Instant::now() >= deadline {
                return Ok(true);
            }
        }
    }

    /// Replace the `lost` tokens in this instance's entry with fresh ones
    /// disjoint from everything currently placed.
    async fn regenerate_tokens(&self, lost: &[u32]) -> Result<(), kv::Error> {
        let id = self.cfg.id.clone();
        let current_tokens = self.tokens.lock().clone();
        let time_provider = Arc::clone(&self.time_provider);
        let lost = lost.to_vec();

        let mut chosen: Option<Vec<u32>> = None;
        self.kv
            .cas(&self.cfg.ring.key, &mut |current| {
                chosen = None;
                let mut desc: Desc = current.unwrap_or_default();

                let taken = desc.all_tokens();
                let mut tokens = current_tokens
                    .iter()
                    .copied()
                    .filter(|t| !lost.contains(t))
                    .collect::<Vec<_>>();
                tokens.extend(generate_tokens(lost.len(), &taken));

                let entry = match desc.instances.get_mut(&id) {
                    Some(entry) => entry,
                    // Somebody forgot us; the heartbeat loop re-inserts.
                    None => return Ok((None, false)),
                };
                entry.tokens = tokens.clone();
                entry.timestamp = time_provider.now().timestamp();

                chosen = Some(tokens);
                Ok((Some(desc), true))
            })
            .await?;

        if let Some(tokens) = chosen {
            *self.tokens.lock() = tokens;
            self.persist_tokens();
        }
        Ok(())
    }

    /// Update this instance's state in the ring, re-inserting the entry if
    /// it went missing.
    async fn cas_own_state(&self, state: InstanceState) -> Result<(), kv::Error> {
        let id = self.cfg.id.clone();
        let addr = self.cfg.addr.clone();
        let zone = self.cfg.zone.clone();
        let tokens = self.tokens.lock().clone();
        let time_provider = Arc::clone(&self.time_provider);

        self.kv
            .cas(&self.cfg.ring.key, &mut |current| {
                let mut desc: Desc = current.unwrap_or_default();
                let now = time_provider.now();

                desc.instances
                    .entry(id.clone())
                    .and_modify(|entry| {
                        entry.state = state as i32;
                        entry.timestamp = now.timestamp();
                    })
                    .or_insert_with(|| {
                        InstanceDesc::new(addr.clone(), zone.clone(), tokens.clone(), state, now, now)
                    });

                Ok((Some(desc), true))
            })
            .await
    }

    async fn heartbeat_loop(&self) {
        let mut ticker = tokio::time::interval(self.cfg.heartbeat_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        // Transient by definition: the next tick retries.
                        warn!(id=%self.cfg.id, error=%e, "failed to heartbeat ring entry");
                    }
                }
            }
        }
    }

    /// Refresh this instance's heartbeat, re-inserting the entry if it went
    /// missing, and expel peers whose heartbeats are stale beyond the
    /// auto-forget horizon.
    async fn heartbeat(&self) -> Result<(), kv::Error> {
        let id = self.cfg.id.clone();
        let addr = self.cfg.addr.clone();
        let zone = self.cfg.zone.clone();
        let tokens = self.tokens.lock().clone();
        let state = self.state();
        let time_provider = Arc::clone(&self.time_provider);
        let auto_forget_periods = self.cfg.auto_forget_periods;
        let heartbeat_timeout = self.cfg.ring.heartbeat_timeout;

        self.kv
            .cas(&self.cfg.ring.key, &mut |current| {
                let mut desc: Desc = current.unwrap_or_default();
                let now = time_provider.now();

                let entry = desc.instances.entry(id.clone()).or_insert_with(|| {
                    InstanceDesc::new(addr.clone(), zone.clone(), tokens.clone(), state, now, now)
                });
                entry.timestamp = now.timestamp();
                entry.state = state as i32;
                entry.addr = addr.clone();
                entry.zone = zone.clone();
                if entry.tokens != tokens {
                    entry.tokens = tokens.clone();
                }

                if auto_forget_periods > 0 {
                    let horizon = heartbeat_timeout * auto_forget_periods;
                    // LEFT tombstones are expired by the KV layer's own
                    // purge, not by auto-forget.
                    desc.instances.retain(|other, d| {
                        other == &id
                            || d.state() == InstanceState::Left
                            || d.is_healthy(now, horizon)
                    });
                }

                Ok((Some(desc), true))
            })
            .await
    }

    /// Look for a LEAVING donor and adopt its tokens after pulling its
    /// data. Returns false when no donor exists or every attempt failed -
    /// the caller then joins with fresh tokens.
    async fn try_handoff(&self) -> Result<bool, kv::Error> {
        let desc = self.kv.get(&self.cfg.ring.key).await?.unwrap_or_default();

        let donor = desc
            .instances
            .iter()
            .filter(|(donor_id, d)| {
                **donor_id != self.cfg.id
                    && d.state() == InstanceState::Leaving
                    && !d.tokens.is_empty()
            })
            .min_by(|(a, _), (b, _)| a.cmp(b));

        let (donor_id, donor) = match donor {
            Some((donor_id, donor)) => (donor_id.clone(), donor.clone()),
            None => {
                debug!(id=%self.cfg.id, "no leaving instance to hand off from");
                return Ok(false);
            }
        };

        info!(id=%self.cfg.id, donor=%donor_id, "attempting token handoff");

        let mut backoff = Backoff::new(&BackoffConfig::default());
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.flush_transferer.transfer_in(&donor_id, &donor).await {
                Ok(()) => break,
                Err(e) => {
                    warn!(id=%self.cfg.id, donor=%donor_id, attempt, error=%e, "handoff transfer failed");
                    if attempt >= self.cfg.max_transfer_retries {
                        info!(id=%self.cfg.id, "handoff abandoned, joining with fresh tokens");
                        return Ok(false);
                    }
                    if let Some(delay) = backoff.next() {
                        if self.interruptible_sleep(delay).await.is_err() {
                            return Ok(false);
                        }
                    }
                }
            }
        }

        // Claim the donor's tokens and retire its entry in one swap.
        let id = self.cfg.id.clone();
        let addr = self.cfg.addr.clone();
        let zone = self.cfg.zone.clone();
        let time_provider = Arc::clone(&self.time_provider);
        let donor_id_for_cas = donor_id.clone();

        let mut claimed: Option<Vec<u32>> = None;
        self.kv
            .cas(&self.cfg.ring.key, &mut |current| {
                claimed = None;
                let mut desc: Desc = current.unwrap_or_default();

                let donor_entry = match desc.remove(&donor_id_for_cas) {
                    Some(d) if d.state() == InstanceState::Leaving => d,
                    // The donor finished leaving (or changed its mind)
                    // while we transferred; nothing to claim.
                    _ => return Ok((None, false)),
                };

                let now = time_provider.now();
                desc.insert(
                    id.clone(),
                    InstanceDesc::new(
                        addr.clone(),
                        zone.clone(),
                        donor_entry.tokens.clone(),
                        InstanceState::Active,
                        now,
                        now,
                    ),
                );

                claimed = Some(donor_entry.tokens);
                Ok((Some(desc), true))
            })
            .await?;

        match claimed {
            Some(tokens) => {
                info!(id=%self.cfg.id, donor=%donor_id, n_tokens = tokens.len(), "handoff complete");
                *self.tokens.lock() = tokens;
                self.set_state(InstanceState::Active);
                self.persist_tokens();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// The graceful departure: LEAVING, move the data, linger, unregister.
    async fn leave_sequence(&self) -> Result<(), kv::Error> {
        info!(id=%self.cfg.id, "lifecycler leaving the ring");

        self.cas_own_state(InstanceState::Leaving).await?;
        self.set_state(InstanceState::Leaving);

        if self.cfg.max_transfer_retries > 0 {
            let mut backoff = Backoff::new(&BackoffConfig::default());
            let mut attempt = 0;
            loop {
                attempt += 1;
                match self.flush_transferer.transfer_out().await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(id=%self.cfg.id, attempt, error=%e, "transfer out failed");
                        if attempt >= self.cfg.max_transfer_retries {
                            // Could not hand the data to anyone; flushing
                            // to durable storage is the fallback.
                            self.flush_transferer.flush().await;
                            break;
                        }
                        if let Some(delay) = backoff.next() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        } else {
            self.flush_transferer.flush().await;
        }

        if !self.cfg.final_sleep.is_zero() {
            tokio::time::sleep(self.cfg.final_sleep).await;
        }

        let id = self.cfg.id.clone();
        self.kv
            .cas(&self.cfg.ring.key, &mut |current| {
                let mut desc: Desc = current.unwrap_or_default();
                if desc.remove(&id).is_none() {
                    return Ok((None, false));
                }
                Ok((Some(desc), true))
            })
            .await?;

        self.set_state(InstanceState::Left);
        info!(id=%self.cfg.id, "instance removed from the ring");
        Ok(())
    }

    fn persist_tokens(&self) {
        if let Some(path) = &self.cfg.tokens_file_path {
            let tokens = self.tokens.lock().clone();
            if let Err(e) = save_tokens_file(path, &tokens) {
                warn!(id=%self.cfg.id, error=%e, "failed to persist tokens file");
            }
        }
    }
}
