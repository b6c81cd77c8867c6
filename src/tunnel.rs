// Bidirectional byte relay
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
    pub timed_out: bool,
}

/// Copies `a -> b` and `b -> a` concurrently. A direction that reaches EOF
/// shuts down the write half it feeds; the relay returns once both
/// directions are done, one of them fails, or `limit` expires. Both streams
/// are dropped on return.
///
/// The copy is polled inside the caller's task, so aborting that task
/// closes everything at once.
pub async fn relay<A, B>(mut a: A, mut b: B, limit: Option<Duration>) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let copy = tokio::io::copy_bidirectional(&mut a, &mut b);
    let result = match limit {
        Some(limit) => match tokio::time::timeout(limit, copy).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!("Relay time limit of {:?} reached", limit);
                return RelayStats {
                    timed_out: true,
                    ..RelayStats::default()
                };
            }
        },
        None => copy.await,
    };

    match result {
        Ok((a_to_b, b_to_a)) => RelayStats {
            a_to_b,
            b_to_a,
            timed_out: false,
        },
        Err(e) => {
            tracing::debug!("Relay ended with error: {}", e);
            RelayStats::default()
        }
    }
}
