use anyhow::Result;
use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio::{
    sync::mpsc,
    time::{Duration, sleep},
};
use tracing::{debug, error, instrument, warn};

use crate::cli::globals::GlobalArgs;

const RENEW_ATTEMPTS: u32 = 3;
const MIN_RENEW_INTERVAL: Duration = Duration::from_secs(1);

/// `factor` percent of the lease, never less than [`MIN_RENEW_INTERVAL`].
fn renew_interval(lease_seconds: u64, factor: u64) -> Duration {
    Duration::from_secs(lease_seconds.saturating_mul(factor) / 100).max(MIN_RENEW_INTERVAL)
}

/// Keep the Vault token alive.
///
/// Renews at 70-90% of each lease. After three failed attempts in a row a message is
/// sent on `tx` and the task ends; the server treats that as a shutdown request.
///
/// # Errors
/// Returns an error if the renewal task cannot be set up.
#[instrument(skip(globals, tx))]
pub async fn try_renew(globals: &GlobalArgs, tx: mpsc::UnboundedSender<()>) -> Result<()> {
    tokio::spawn({
        let mut rng = StdRng::from_entropy();
        let mut jittered_lease_duration: Duration = Duration::default();

        let url = globals.vault_url.clone();
        let token = globals.vault_token.clone();

        async move {
            loop {
                for attempt in 1..=RENEW_ATTEMPTS {
                    let backoff_time = 2u64.pow(attempt - 1);

                    if attempt > 1 {
                        warn!("Backing off for {} seconds", backoff_time);
                        sleep(Duration::from_secs(backoff_time)).await;
                    }

                    match super::renew_token(&url, &token).await {
                        Ok(lease_duration) => {
                            jittered_lease_duration =
                                renew_interval(lease_duration, rng.gen_range(70..90));

                            break;
                        }

                        Err(e) => {
                            error!("Failed to renew token: {}", e);

                            if attempt == RENEW_ATTEMPTS {
                                error!(
                                    "Failed to renew token after {RENEW_ATTEMPTS} attempts: {}",
                                    e
                                );
                                let _ = tx.send(());
                                return;
                            }
                        }
                    }
                }

                debug!(
                    "Will renew token in {} seconds",
                    jittered_lease_duration.as_secs()
                );

                sleep(jittered_lease_duration).await;
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renew_interval_is_a_fraction_of_the_lease() {
        assert_eq!(renew_interval(3600, 80), Duration::from_secs(2880));
        assert_eq!(renew_interval(10, 70), Duration::from_secs(7));
    }

    #[test]
    fn renew_interval_has_a_floor() {
        assert_eq!(renew_interval(0, 85), MIN_RENEW_INTERVAL);
        assert_eq!(renew_interval(1, 70), MIN_RENEW_INTERVAL);
        assert_eq!(renew_interval(u64::MAX, 89), Duration::from_secs(u64::MAX / 100));
    }
}
