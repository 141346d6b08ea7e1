use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::actions::ActionMap;
use crate::activity::ActivityProbe;
use crate::cache::AttributeCache;
use crate::config::Config;
use crate::link::{Address, Radio, RadioFactory};
use crate::session::connection::ConnectionSession;
use crate::session::types::CycleOutcome;

/// Owns one connect→operate→disconnect loop per configured remote. The
/// establishment timeout, the consecutive-timeout escalation and the
/// activity-tiered reconnect delay all live here; the session itself only
/// reports how each cycle ended.
pub struct ConnectionSupervisor<'a, F, P> {
    config: &'a Config,
    cache: AttributeCache,
    actions: &'a ActionMap,
    factory: F,
    probe: P,
}

impl<'a, F, P> ConnectionSupervisor<'a, F, P>
where
    F: RadioFactory,
    P: ActivityProbe,
{
    pub fn new(
        config: &'a Config,
        cache: AttributeCache,
        actions: &'a ActionMap,
        factory: F,
        probe: P,
    ) -> Self {
        ConnectionSupervisor { config, cache, actions, factory, probe }
    }

    /// Runs until cancelled. Sessions for distinct remotes progress
    /// independently; cancelling stops them all.
    pub async fn run(&self, addresses: Vec<Address>, cancel: CancellationToken) {
        let mut unique: Vec<Address> = vec![];
        for address in addresses {
            if unique.contains(&address) {
                warn!("Ignoring duplicate device entry {}", address);
            } else {
                unique.push(address);
            }
        }

        join_all(
            unique
                .into_iter()
                .map(|address| self.session_loop(address, cancel.child_token())),
        )
        .await;

        info!("All sessions stopped");
    }

    async fn session_loop(&self, address: Address, cancel: CancellationToken) {
        let mut session = ConnectionSession::new(
            address,
            self.config,
            self.cache.clone(),
            self.actions,
            cancel.clone(),
        );

        let mut consecutive_timeouts: u32 = 0;
        // Kept across cycles while it behaves; dropped and recreated after an
        // establishment timeout or controller corruption.
        let mut radio: Option<F::Radio> = None;

        'mainloop: loop {
            if cancel.is_cancelled() {
                break 'mainloop;
            }

            let mut current_radio = match radio.take() {
                Some(current_radio) => current_radio,
                None => match self.factory.open_radio().await {
                    Ok(current_radio) => current_radio,
                    Err(err) => {
                        warn!("[{}] Failed to open radio: {}", address, err);
                        if !self.pause_before_retry(&cancel, false).await {
                            break 'mainloop;
                        }
                        continue 'mainloop;
                    },
                },
            };

            info!("[{}] === Starting connection cycle ===", address);

            // The timeout bounds establishment only. Once the session is
            // active it waits on the link for as long as it takes.
            let establish_timeout = self.config.connection.establish_timeout();
            let established = tokio::select! {
                _ = cancel.cancelled() => None,
                result = timeout(establish_timeout, session.establish(&mut current_radio)) => Some(result),
            };

            let established = match established {
                Some(established) => established,
                None => {
                    // shutdown mid-establishment
                    self.force_cleanup(&mut current_radio).await;
                    break 'mainloop;
                },
            };

            let mut escalate = false;

            match established {
                Err(_elapsed) => {
                    consecutive_timeouts += 1;
                    warn!(
                        "[{}] Establishment timed out after {}s (consecutive: {})",
                        address, self.config.connection.establish_timeout_secs, consecutive_timeouts
                    );
                    warn!("[{}] Radio may be asleep, forcing cleanup", address);
                    self.force_cleanup(&mut current_radio).await;
                    escalate = consecutive_timeouts >= self.config.connection.timeout_escalation_threshold;
                },

                Ok(Err(outcome)) => {
                    // A completed cycle, whatever its outcome, is not
                    // evidence of the radio being asleep.
                    consecutive_timeouts = 0;

                    match outcome {
                        CycleOutcome::ConnectTimeout => {
                            radio = Some(current_radio);
                        },
                        CycleOutcome::PairingFailed => {
                            warn!("[{}] Pairing failed, will retry", address);
                            radio = Some(current_radio);
                        },
                        CycleOutcome::ControllerCorrupted => {
                            warn!("[{}] Controller state corrupted, recreating radio", address);
                            self.force_cleanup(&mut current_radio).await;
                        },
                        CycleOutcome::LinkFailed(err) => {
                            warn!("[{}] Cycle failed: {}", address, err);
                            radio = Some(current_radio);
                        },
                        CycleOutcome::Fatal(reason) => {
                            error!("[{}] {}; session halted", address, reason);
                            self.force_cleanup(&mut current_radio).await;
                            break 'mainloop;
                        },
                        CycleOutcome::Stopped => {
                            self.force_cleanup(&mut current_radio).await;
                            break 'mainloop;
                        },
                        CycleOutcome::Disconnected { .. } => {
                            radio = Some(current_radio);
                        },
                    }
                },

                Ok(Ok(established)) => {
                    consecutive_timeouts = 0;
                    info!("[{}] Establishment complete, relaying reports", address);

                    match session.serve(established).await {
                        CycleOutcome::Stopped => {
                            self.force_cleanup(&mut current_radio).await;
                            break 'mainloop;
                        },
                        CycleOutcome::Fatal(reason) => {
                            error!("[{}] {}; session halted", address, reason);
                            self.force_cleanup(&mut current_radio).await;
                            break 'mainloop;
                        },
                        outcome => {
                            debug!("[{}] Cycle ended: {:?}", address, outcome);
                            radio = Some(current_radio);
                        },
                    }
                },
            }

            if !self.pause_before_retry(&cancel, escalate).await {
                break 'mainloop;
            }
        }

        if let Some(mut remaining) = radio.take() {
            self.force_cleanup(&mut remaining).await;
        }

        info!("[{}] Session loop ended", address);
    }

    /// Bounded graceful shutdown, then unconditional release: whatever
    /// `close` did not finish in time dies with the drop.
    async fn force_cleanup(&self, radio: &mut F::Radio) {
        let cleanup_timeout = self.config.connection.cleanup_timeout();
        if timeout(cleanup_timeout, radio.close()).await.is_err() {
            warn!(
                "Graceful radio shutdown did not finish within {}s, releasing anyway",
                self.config.connection.cleanup_timeout_secs
            );
        }
    }

    /// Sleeps out the reconnect delay. Short while the host shows recent
    /// user input, longer once it has gone idle, plus the escalation bump
    /// after repeated establishment timeouts. False means cancelled.
    async fn pause_before_retry(&self, cancel: &CancellationToken, escalate: bool) -> bool {
        let active = self.probe.recently_active(self.config.activity.idle_threshold());
        let mut delay = if active {
            self.config.connection.reconnect_delay()
        } else {
            debug!("Host idle, using the longer reconnect delay");
            self.config.connection.idle_reconnect_delay()
        };

        if escalate {
            warn!("Repeated establishment timeouts, giving the radio extra recovery time");
            delay += self.config.connection.reconnect_delay() * 2;
        }

        debug!("Waiting {:?} before next attempt", delay);

        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }
}
