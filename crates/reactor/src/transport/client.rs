use crate::proto;
use crate::transport::TransportError;
use crate::types::{RemoteFilter, SyncEnvelope};
use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// What a poll brought back from the peer
pub struct PollReply {
    pub envelopes: Vec<SyncEnvelope>,
    pub ack_ordinal: u64,
}

/// Client side of the sync protocol
///
/// Opens a fresh connection per request; the protocol is request/response
/// over length-prefixed protobuf frames.
pub struct SyncClient {
    address: String,
}

impl SyncClient {
    pub fn new(address: String) -> Self {
        Self { address }
    }

    async fn call(
        &self,
        request: proto::SyncRequest,
    ) -> Result<proto::sync_response::Response, TransportError> {
        let mut stream = TcpStream::connect(&self.address).await?;

        let body = request.encode_to_vec();
        stream.write_u32(body.len() as u32).await?;
        stream.write_all(&body).await?;
        stream.flush().await?;

        let len = stream.read_u32().await?;
        let mut body = vec![0u8; len as usize];
        stream.read_exact(&mut body).await?;

        let response = proto::SyncResponse::decode(&body[..])?;
        match response.response {
            Some(proto::sync_response::Response::Error(message)) => {
                Err(TransportError::Remote(message))
            }
            Some(inner) => Ok(inner),
            None => Err(TransportError::Malformed("empty response".to_string())),
        }
    }

    /// Announce (or confirm) a channel on the peer; returns the peer's
    /// watermark of our stream so backfill can skip what it already holds
    pub async fn touch_channel(
        &self,
        channel_id: &str,
        peer_name: &str,
        filter: &RemoteFilter,
        since_timestamp_utc_ms: i64,
    ) -> Result<i64, TransportError> {
        debug!("Touching channel {} at {}", channel_id, self.address);
        let request = proto::SyncRequest {
            request: Some(proto::sync_request::Request::Touch(
                proto::TouchChannelRequest {
                    channel_id: channel_id.to_string(),
                    peer_name: peer_name.to_string(),
                    filter: Some(proto::filter_to_proto(filter)),
                    since_timestamp_utc_ms,
                },
            )),
        };
        match self.call(request).await? {
            proto::sync_response::Response::Touch(touch) => Ok(touch.since_timestamp_utc_ms),
            _ => Err(TransportError::Malformed(
                "unexpected response to touch".to_string(),
            )),
        }
    }

    /// Fetch the peer's pending envelopes for this channel
    pub async fn poll_sync_envelopes(
        &self,
        channel_id: &str,
        outbox_ack: u64,
        outbox_latest: u64,
    ) -> Result<PollReply, TransportError> {
        let request = proto::SyncRequest {
            request: Some(proto::sync_request::Request::Poll(proto::PollRequest {
                channel_id: channel_id.to_string(),
                outbox_ack,
                outbox_latest,
            })),
        };
        match self.call(request).await? {
            proto::sync_response::Response::Poll(poll) => {
                let envelopes = poll
                    .envelopes
                    .into_iter()
                    .map(proto::envelope_from_proto)
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| {
                        TransportError::Malformed("undecodable envelope in poll".to_string())
                    })?;
                Ok(PollReply {
                    envelopes,
                    ack_ordinal: poll.ack_ordinal,
                })
            }
            _ => Err(TransportError::Malformed(
                "unexpected response to poll".to_string(),
            )),
        }
    }

    /// Deliver envelopes to the peer
    pub async fn push_sync_envelopes(
        &self,
        channel_id: &str,
        envelopes: Vec<SyncEnvelope>,
    ) -> Result<(), TransportError> {
        debug!(
            "Pushing {} envelope(s) to {}",
            envelopes.len(),
            self.address
        );
        let request = proto::SyncRequest {
            request: Some(proto::sync_request::Request::Push(proto::PushRequest {
                channel_id: channel_id.to_string(),
                envelopes: envelopes.iter().map(proto::envelope_to_proto).collect(),
            })),
        };
        match self.call(request).await? {
            proto::sync_response::Response::Push(_) => Ok(()),
            _ => Err(TransportError::Malformed(
                "unexpected response to push".to_string(),
            )),
        }
    }
}
