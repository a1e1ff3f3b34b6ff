//! Single-flight register
//!
//! Collapses concurrent misses for the same key into one execution of the
//! expensive work. The first caller for a key becomes the leader and runs the
//! work; callers that arrive while it runs become followers and receive a clone
//! of the leader's exact result, success or failure.
//!
//! An episode ends just before the leader publishes its result. The next call for the
//! same key starts a fresh episode, so a failure never sticks. If a leader is
//! dropped before publishing, its episode is torn down and the waiting
//! followers race to lead a new one.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::debug;

type Slot<T, E> = Option<Result<T, E>>;

/// One in-flight generation
struct DedupEntry<T, E> {
    episode: u64,
    started_at: DateTime<Utc>,
    result: watch::Receiver<Slot<T, E>>,
}

enum Role<T, E> {
    Leader(watch::Sender<Slot<T, E>>, u64),
    Follower(watch::Receiver<Slot<T, E>>),
}

/// Process-wide registry of in-flight generations, keyed by full cache key
pub struct DedupRegister<T, E> {
    in_flight: DashMap<String, DedupEntry<T, E>>,
    next_episode: AtomicU64,
}

impl<T, E> Default for DedupRegister<T, E>
where
    T: Clone + Send + Sync,
    E: Clone + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the leader's entry when the episode ends, however it ends
struct EpisodeGuard<'a, T, E> {
    in_flight: &'a DashMap<String, DedupEntry<T, E>>,
    key: &'a str,
    episode: u64,
}

impl<T, E> Drop for EpisodeGuard<'_, T, E> {
    fn drop(&mut self) {
        self.in_flight
            .remove_if(self.key, |_, entry| entry.episode == self.episode);
    }
}

impl<T, E> DedupRegister<T, E>
where
    T: Clone + Send + Sync,
    E: Clone + Send + Sync,
{
    pub fn new() -> Self {
        Self {
            in_flight: DashMap::new(),
            next_episode: AtomicU64::new(0),
        }
    }

    /// Run `work` for `key` at most once across concurrent callers
    ///
    /// Returns the shared result and whether this caller was the leader.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> (Result<T, E>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let (sender, episode) = loop {
            match self.join(key) {
                Role::Leader(sender, episode) => break (sender, episode),
                Role::Follower(mut receiver) => {
                    let shared = receiver
                        .wait_for(Option::is_some)
                        .await
                        .ok()
                        .and_then(|slot| slot.clone());

                    if let Some(result) = shared {
                        return (result, false);
                    }
                    debug!("Leader for {} went away, starting a new episode", key);
                }
            }
        };

        let guard = EpisodeGuard {
            in_flight: &self.in_flight,
            key,
            episode,
        };

        let result = work().await;

        // Close the episode before publishing: a caller arriving from here on
        // leads a new one instead of receiving this result
        drop(guard);
        sender.send_replace(Some(result.clone()));

        (result, true)
    }

    /// Internal: become leader of a new episode or follow the running one
    fn join(&self, key: &str) -> Role<T, E> {
        match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                debug!("Joining in-flight generation for {}", key);
                Role::Follower(entry.get().result.clone())
            }
            Entry::Vacant(entry) => {
                let (sender, receiver) = watch::channel(None);
                let episode = self.next_episode.fetch_add(1, Ordering::Relaxed);
                entry.insert(DedupEntry {
                    episode,
                    started_at: Utc::now(),
                    result: receiver,
                });
                Role::Leader(sender, episode)
            }
        }
    }

    /// Whether a generation for `key` is running
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.contains_key(key)
    }

    /// Number of running generations
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Running generations with their start times, oldest first
    pub fn in_flight(&self) -> Vec<(String, DateTime<Utc>)> {
        let mut running: Vec<_> = self
            .in_flight
            .iter()
            .map(|item| (item.key().clone(), item.value().started_at))
            .collect();
        running.sort_by_key(|(_, started_at)| *started_at);
        running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Barrier;

    type Register = DedupRegister<String, String>;

    #[tokio::test]
    async fn test_single_caller_is_leader() {
        let register = Register::new();

        let (result, was_leader) = register
            .run("k", || async { Ok::<_, String>("v".to_string()) })
            .await;

        assert_eq!(result, Ok("v".to_string()));
        assert!(was_leader);
        assert_eq!(register.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let register = Arc::new(Register::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(16));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let register = register.clone();
            let calls = calls.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                register
                    .run("k", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, String>("generated".to_string())
                    })
                    .await
            }));
        }

        let mut leaders = 0;
        for handle in handles {
            let (result, was_leader) = handle.await.unwrap();
            assert_eq!(result, Ok("generated".to_string()));
            if was_leader {
                leaders += 1;
            }
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(leaders, 1);
        assert_eq!(register.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_not_sticky() {
        let register = Arc::new(Register::new());
        let barrier = Arc::new(Barrier::new(4));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let register = register.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                register
                    .run("k", || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err::<String, _>("upstream down".to_string())
                    })
                    .await
                    .0
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Err("upstream down".to_string()));
        }

        // A new episode runs the work again
        let (result, was_leader) = register
            .run("k", || async { Ok::<_, String>("recovered".to_string()) })
            .await;
        assert_eq!(result, Ok("recovered".to_string()));
        assert!(was_leader);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block_each_other() {
        let register = Arc::new(Register::new());

        let slow = {
            let register = register.clone();
            tokio::spawn(async move {
                register
                    .run("slow", || async {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        Ok::<_, String>("slow".to_string())
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(register.is_in_flight("slow"));

        let started = std::time::Instant::now();
        let (result, was_leader) = register
            .run("fast", || async { Ok::<_, String>("fast".to_string()) })
            .await;
        assert_eq!(result, Ok("fast".to_string()));
        assert!(was_leader);
        assert!(started.elapsed() < Duration::from_millis(200));

        slow.await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_leader_hands_over() {
        let register = Arc::new(Register::new());

        let leader = {
            let register = register.clone();
            tokio::spawn(async move {
                register
                    .run("k", || async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok::<_, String>("never".to_string())
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;

        let follower = {
            let register = register.clone();
            tokio::spawn(async move {
                register
                    .run("k", || async { Ok::<_, String>("second episode".to_string()) })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        leader.abort();

        let (result, was_leader) = follower.await.unwrap();
        assert_eq!(result, Ok("second episode".to_string()));
        assert!(was_leader);
        assert_eq!(register.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_in_flight_listing() {
        let register = Arc::new(Register::new());

        let running = {
            let register = register.clone();
            tokio::spawn(async move {
                register
                    .run("guide_generation:seoul", || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, String>(String::new())
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let listed = register.in_flight();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, "guide_generation:seoul");

        running.await.unwrap();
        assert!(register.in_flight().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_episode_is_closed_before_followers_see_the_result() {
        let register = Arc::new(Register::new());

        for round in 0..100 {
            let leader = {
                let register = register.clone();
                tokio::spawn(async move {
                    register
                        .run("k", || async {
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            Err::<String, _>(format!("failed round {}", round))
                        })
                        .await
                })
            };
            while !register.is_in_flight("k") {
                tokio::task::yield_now().await;
            }

            let follower = {
                let register = register.clone();
                tokio::spawn(async move {
                    let outcome = register
                        .run("k", || async { Ok::<_, String>("late".to_string()) })
                        .await;
                    // Anyone joining now would start a fresh episode
                    (outcome, register.is_in_flight("k"))
                })
            };

            let (leader_result, _) = leader.await.unwrap();
            let ((result, was_leader), still_in_flight) = follower.await.unwrap();

            assert!(leader_result.is_err());
            if !was_leader {
                assert_eq!(result, leader_result);
                assert!(!still_in_flight, "round {}", round);
            }
            assert_eq!(register.in_flight_count(), 0);
        }
    }
}
