use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::serialize::binary::BinDecodable;
use tokio::task::JoinSet;
use tracing::debug;

use crate::error::{AllUpstreamsFailed, UpstreamQueryError};
use crate::exchange::Exchanger;
use crate::upstream::Upstream;

/// The answer that won the race, already decoded.
#[derive(Debug)]
pub struct RacedAnswer {
    pub bytes: Bytes,
    pub message: Message,
    /// Canonical form of the winning upstream, for logs and cache metadata.
    pub upstream: String,
}

/// Fans one query out to every member of a resolver group and returns the
/// first valid answer. Losing sub-queries are aborted cooperatively; whatever
/// they still produce is discarded, never applied.
#[derive(Clone)]
pub struct ParallelQuerier {
    exchanger: Arc<dyn Exchanger>,
}

impl ParallelQuerier {
    pub fn new(exchanger: Arc<dyn Exchanger>) -> Self {
        Self { exchanger }
    }

    /// All sub-queries share one deadline. A single member's failure is
    /// recovered here and never disables it for later queries; only the
    /// aggregate failure of the whole group surfaces.
    pub async fn query(
        &self,
        group: &str,
        upstreams: &[Upstream],
        packet: &[u8],
        limit: Duration,
    ) -> Result<RacedAnswer, AllUpstreamsFailed> {
        let mut subqueries = JoinSet::new();
        let packet = Bytes::copy_from_slice(packet);
        for upstream in upstreams {
            let exchanger = Arc::clone(&self.exchanger);
            let upstream = upstream.clone();
            let packet = packet.clone();
            subqueries.spawn(async move {
                let result = exchanger.exchange(&upstream, &packet, limit).await;
                (upstream, result)
            });
        }

        let mut causes = Vec::new();
        while let Some(joined) = subqueries.join_next().await {
            // Aborted or panicked sub-tasks just drop out of the race.
            let Ok((upstream, result)) = joined else {
                continue;
            };
            match result.and_then(|bytes| decode_answer(&upstream, bytes)) {
                Ok(answer) => {
                    subqueries.abort_all();
                    return Ok(answer);
                }
                Err(err) => {
                    debug!(group, error = %err, "sub-query failed");
                    causes.push(err);
                }
            }
        }

        Err(AllUpstreamsFailed {
            group: group.to_string(),
            causes,
        })
    }
}

/// A winner must decode and must not be a server-side failure. NXDOMAIN is a
/// perfectly good answer; SERVFAIL and friends are not.
fn decode_answer(upstream: &Upstream, bytes: Bytes) -> Result<RacedAnswer, UpstreamQueryError> {
    let message = Message::from_bytes(&bytes).map_err(|e| UpstreamQueryError::Protocol {
        upstream: upstream.to_string(),
        reason: e.to_string(),
    })?;
    match message.response_code() {
        ResponseCode::ServFail
        | ResponseCode::Refused
        | ResponseCode::NotImp
        | ResponseCode::FormErr => Err(UpstreamQueryError::ErrorStatus {
            upstream: upstream.to_string(),
            rcode: message.response_code().to_string(),
        }),
        _ => Ok(RacedAnswer {
            bytes,
            message,
            upstream: upstream.to_string(),
        }),
    }
}
