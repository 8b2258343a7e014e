use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, warn};
use thiserror::Error;
use tokio::time::timeout;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("no peers to query")]
    NoPeers,

    #[error("no consensus: needed {redundancy} matching responses, best class had {best}")]
    NoConsensus { redundancy: usize, best: usize },

    #[error("all {attempted} peers failed to answer")]
    Exhausted { attempted: usize },
}

/// Outcome of a [`sequential_query`]: the first successful answer and who gave it.
#[derive(Debug, Clone)]
pub struct SequentialAnswer<P, T> {
    pub value: T,
    pub peer: P,
    pub index: usize,
}

/// Queries every peer concurrently and returns the first response that
/// `redundancy` peers agree on under `equal`.
///
/// Failed or timed-out peers are left out of the vote. When fewer peers than
/// `redundancy` are supplied, all of them must agree.
pub async fn robust_query<P, T, E, F, Fut, Same>(
    peers: &[P],
    query: F,
    equal: Same,
    redundancy: usize,
    per_request: Duration,
) -> Result<T, QueryError>
where
    P: Clone,
    E: Display,
    F: Fn(P) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Same: Fn(&T, &T) -> bool,
{
    if peers.is_empty() {
        return Err(QueryError::NoPeers);
    }
    let needed = redundancy.clamp(1, peers.len());

    let mut pending: FuturesUnordered<_> = peers
        .iter()
        .enumerate()
        .map(|(i, peer)| {
            let fut = timeout(per_request, query(peer.clone()));
            async move { (i, fut.await) }
        })
        .collect();

    let mut classes: Vec<(T, usize)> = Vec::new();
    while let Some((i, outcome)) = pending.next().await {
        let value = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                debug!("robust query: peer #{} failed: {}", i, e);
                continue;
            }
            Err(_) => {
                debug!("robust query: peer #{} timed out after {:?}", i, per_request);
                continue;
            }
        };

        let slot = match classes.iter().position(|(rep, _)| equal(rep, &value)) {
            Some(pos) => {
                classes[pos].1 += 1;
                pos
            }
            None => {
                classes.push((value, 1));
                classes.len() - 1
            }
        };
        if classes[slot].1 >= needed {
            return Ok(classes.swap_remove(slot).0);
        }
    }

    let best = classes.iter().map(|(_, n)| *n).max().unwrap_or(0);
    warn!(
        "robust query failed: {} peers, needed {} matching, best {}",
        peers.len(),
        needed,
        best
    );
    Err(QueryError::NoConsensus {
        redundancy: needed,
        best,
    })
}

/// Asks peers one at a time, in order, and returns the first success.
pub async fn sequential_query<P, T, E, F, Fut>(
    peers: &[P],
    query: F,
    per_request: Duration,
) -> Result<SequentialAnswer<P, T>, QueryError>
where
    P: Clone,
    E: Display,
    F: Fn(P) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    if peers.is_empty() {
        return Err(QueryError::NoPeers);
    }
    for (index, peer) in peers.iter().enumerate() {
        match timeout(per_request, query(peer.clone())).await {
            Ok(Ok(value)) => {
                return Ok(SequentialAnswer {
                    value,
                    peer: peer.clone(),
                    index,
                })
            }
            Ok(Err(e)) => debug!("sequential query: peer #{} failed: {}", index, e),
            Err(_) => debug!("sequential query: peer #{} timed out", index),
        }
    }
    Err(QueryError::Exhausted {
        attempted: peers.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    async fn answer(peer: (u32, &'static str)) -> Result<&'static str, String> {
        match peer.1 {
            "down" => Err(format!("peer {} unreachable", peer.0)),
            "slow" => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok("late")
            }
            v => Ok(v),
        }
    }

    #[tokio::test]
    async fn test_majority_of_three_wins() {
        let peers = [(1, "X"), (2, "Y"), (3, "X"), (4, "Y"), (5, "X")];
        let got = robust_query(&peers, answer, |a, b| a == b, 3, WAIT).await;
        assert_eq!(got, Ok("X"));
    }

    #[tokio::test]
    async fn test_two_of_five_is_no_consensus() {
        let peers = [(1, "X"), (2, "Y"), (3, "X"), (4, "Z"), (5, "down")];
        let got = robust_query(&peers, answer, |a, b| a == b, 3, WAIT).await;
        assert_eq!(
            got,
            Err(QueryError::NoConsensus {
                redundancy: 3,
                best: 2
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_peer_is_excluded() {
        let peers = [(1, "slow"), (2, "X"), (3, "X"), (4, "X")];
        let got = robust_query(&peers, answer, |a, b| a == b, 3, WAIT).await;
        assert_eq!(got, Ok("X"));
    }

    #[tokio::test]
    async fn test_equality_fn_decides_classes() {
        let peers = [(1, "a-1"), (2, "a-2"), (3, "b-1")];
        let same_prefix = |a: &&str, b: &&str| a.split('-').next() == b.split('-').next();
        let got = robust_query(&peers, answer, same_prefix, 2, WAIT).await.unwrap();
        assert!(got.starts_with("a-"));
    }

    #[tokio::test]
    async fn test_small_peer_set_requires_all() {
        let got = robust_query(&[(1, "X")], answer, |a, b| a == b, 3, WAIT).await;
        assert_eq!(got, Ok("X"));
        let split = robust_query(&[(1, "X"), (2, "Y")], answer, |a, b| a == b, 3, WAIT).await;
        assert!(matches!(split, Err(QueryError::NoConsensus { redundancy: 2, .. })));
        let none: [(u32, &'static str); 0] = [];
        assert_eq!(
            robust_query(&none, answer, |a, b| a == b, 3, WAIT).await,
            Err(QueryError::NoPeers)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_returns_first_success_in_order() {
        let peers = [(1, "down"), (2, "slow"), (3, "first"), (4, "second")];
        let got = sequential_query(&peers, answer, WAIT).await.unwrap();
        assert_eq!(got.value, "first");
        assert_eq!(got.index, 2);
        assert_eq!(got.peer.0, 3);

        let dead = [(1, "down"), (2, "down")];
        assert!(matches!(
            sequential_query(&dead, answer, WAIT).await,
            Err(QueryError::Exhausted { attempted: 2 })
        ));
    }
}
