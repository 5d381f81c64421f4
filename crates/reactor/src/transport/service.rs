use crate::proto;
use crate::sync::SyncManager;
use std::sync::Arc;
use tracing::warn;

/// Maps decoded sync requests onto the sync manager
pub struct SyncService {
    manager: Arc<SyncManager>,
}

impl SyncService {
    pub fn new(manager: Arc<SyncManager>) -> Self {
        Self { manager }
    }

    pub async fn handle(&self, request: proto::SyncRequest) -> proto::SyncResponse {
        let response = match request.request {
            Some(proto::sync_request::Request::Touch(touch)) => self.handle_touch(touch),
            Some(proto::sync_request::Request::Poll(poll)) => self.handle_poll(poll),
            Some(proto::sync_request::Request::Push(push)) => self.handle_push(push).await,
            None => proto::sync_response::Response::Error("empty request".to_string()),
        };
        proto::SyncResponse {
            response: Some(response),
        }
    }

    fn handle_touch(&self, touch: proto::TouchChannelRequest) -> proto::sync_response::Response {
        let filter = proto::filter_from_proto(touch.filter.unwrap_or_default());
        match self.manager.touch_channel(
            &touch.channel_id,
            &touch.peer_name,
            filter,
            touch.since_timestamp_utc_ms,
        ) {
            Ok(since_timestamp_utc_ms) => {
                proto::sync_response::Response::Touch(proto::TouchChannelResponse {
                    ok: true,
                    since_timestamp_utc_ms,
                })
            }
            Err(e) => {
                warn!("Touch of channel {} failed: {}", touch.channel_id, e);
                proto::sync_response::Response::Error(e.to_string())
            }
        }
    }

    fn handle_poll(&self, poll: proto::PollRequest) -> proto::sync_response::Response {
        match self
            .manager
            .handle_poll(&poll.channel_id, poll.outbox_ack, poll.outbox_latest)
        {
            Ok(outcome) => proto::sync_response::Response::Poll(proto::PollResponse {
                envelopes: outcome
                    .envelopes
                    .iter()
                    .map(proto::envelope_to_proto)
                    .collect(),
                ack_ordinal: outcome.ack_ordinal,
            }),
            Err(e) => proto::sync_response::Response::Error(e.to_string()),
        }
    }

    async fn handle_push(&self, push: proto::PushRequest) -> proto::sync_response::Response {
        let Some(envelopes) = push
            .envelopes
            .into_iter()
            .map(proto::envelope_from_proto)
            .collect::<Option<Vec<_>>>()
        else {
            return proto::sync_response::Response::Error(
                "undecodable envelope in push".to_string(),
            );
        };

        match self.manager.accept_envelopes(&push.channel_id, envelopes).await {
            Ok(()) => proto::sync_response::Response::Push(proto::PushResponse { ok: true }),
            Err(e) => {
                warn!("Push on channel {} failed: {}", push.channel_id, e);
                proto::sync_response::Response::Error(e.to_string())
            }
        }
    }
}
