//! Mode manager (spec.md §4.10): tracks whether the relay currently has a
//! working connection to its upstream, driving the forward and pull engines'
//! backoff when it doesn't.

use std::time::Duration;

use client::{
    CombinedRequest,
    SyncTransport,
};
use pull::{
    PullOptions,
    PullRequest,
};

use crate::backoff::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Offline,
    Online,
    Reconnecting,
}

pub struct ModeManager {
    mode: Mode,
    backoff: Backoff,
}

impl Default for ModeManager {
    fn default() -> Self {
        Self {
            mode: Mode::Offline,
            backoff: Backoff::default(),
        }
    }
}

impl ModeManager {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            mode: Mode::Offline,
            backoff,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Minimal combined `/sync` with no subscriptions, used purely to check
    /// reachability (spec.md §4.10 "Health probe").
    pub async fn probe(&mut self, transport: &dyn SyncTransport) -> bool {
        let request = CombinedRequest {
            push: None,
            pull: PullRequest {
                subscriptions: vec![],
                options: PullOptions {
                    limit_commits: 1,
                    ..PullOptions::default()
                },
            },
        };
        match transport.send(request).await {
            Ok(_) => {
                let was_offline = self.mode != Mode::Online;
                self.mode = Mode::Online;
                self.backoff.reset();
                if was_offline {
                    tracing::info!("relay upstream probe succeeded, entering online mode");
                }
                true
            },
            Err(err) => {
                tracing::warn!(error = %err, "relay upstream probe failed");
                self.mode = Mode::Reconnecting;
                false
            },
        }
    }

    /// Delay to sleep before the next probe attempt after a failure.
    pub fn next_backoff(&mut self, rng: &mut impl rand::Rng) -> Duration {
        self.backoff.fail(rng)
    }

    pub fn is_online(&self) -> bool {
        self.mode == Mode::Online
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    };

    use async_trait::async_trait;
    use client::CombinedResponse;
    use pull::PullOutcome;
    use scope::ScopeMap;

    use super::*;

    struct FlakyTransport {
        succeed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl SyncTransport for FlakyTransport {
        async fn send(&self, _request: CombinedRequest) -> anyhow::Result<CombinedResponse> {
            if self.succeed.load(Ordering::SeqCst) {
                Ok(CombinedResponse {
                    push: None,
                    pull: PullOutcome {
                        subscriptions: vec![],
                        effective_scopes: ScopeMap::new(),
                        client_cursor: commitlog::CommitSeq::NONE,
                    },
                })
            } else {
                Err(anyhow::anyhow!("upstream unreachable"))
            }
        }

        async fn fetch_chunk(&self, _chunk_id: &str) -> anyhow::Result<Vec<u8>> {
            unreachable!("health probe never fetches chunks")
        }
    }

    #[tokio::test]
    async fn probe_transitions_offline_to_online_to_reconnecting() {
        let mut manager = ModeManager::default();
        let mut rng = rand::rng();
        assert_eq!(manager.mode(), Mode::Offline);

        let succeed = Arc::new(AtomicBool::new(true));
        let transport = FlakyTransport { succeed: succeed.clone() };

        assert!(manager.probe(&transport).await);
        assert_eq!(manager.mode(), Mode::Online);

        succeed.store(false, Ordering::SeqCst);
        assert!(!manager.probe(&transport).await);
        assert_eq!(manager.mode(), Mode::Reconnecting);

        let delay = manager.next_backoff(&mut rng);
        assert!(delay <= Duration::from_secs(30));
    }
}
