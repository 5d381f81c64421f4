// Generated protobuf types for the sync wire format
include!(concat!(env!("OUT_DIR"), "/reactor.sync.rs"));

use crate::types;
use bytes::Bytes;

pub fn action_to_proto(action: &types::Action) -> Action {
    Action {
        id: action.id.clone(),
        kind: action.kind.clone(),
        input: Bytes::from(serde_json::to_vec(&action.input).unwrap_or_default()),
        timestamp_utc_ms: action.timestamp_utc_ms,
        scope: action.scope.clone(),
    }
}

/// Returns None when the input payload is not valid JSON
pub fn action_from_proto(action: Action) -> Option<types::Action> {
    let input = serde_json::from_slice(&action.input).ok()?;
    Some(types::Action {
        id: action.id,
        kind: action.kind,
        input,
        timestamp_utc_ms: action.timestamp_utc_ms,
        scope: action.scope,
    })
}

pub fn operation_to_proto(operation: &types::Operation) -> Operation {
    Operation {
        id: operation.id.clone(),
        document_id: operation.document_id.clone(),
        document_type: operation.document_type.clone(),
        branch: operation.branch.clone(),
        scope: operation.scope.clone(),
        index: operation.index,
        skip: operation.skip,
        timestamp_utc_ms: operation.timestamp_utc_ms,
        hash: operation.hash.clone(),
        action: Some(action_to_proto(&operation.action)),
    }
}

pub fn operation_from_proto(operation: Operation) -> Option<types::Operation> {
    let action = action_from_proto(operation.action?)?;
    Some(types::Operation {
        id: operation.id,
        document_id: operation.document_id,
        document_type: operation.document_type,
        branch: operation.branch,
        scope: operation.scope,
        index: operation.index,
        skip: operation.skip,
        timestamp_utc_ms: operation.timestamp_utc_ms,
        hash: operation.hash,
        action,
    })
}

pub fn entry_to_proto(entry: &types::IndexEntry) -> IndexEntry {
    IndexEntry {
        ordinal: entry.ordinal,
        source_remote: entry.source_remote.clone(),
        operation: Some(operation_to_proto(&entry.operation)),
    }
}

pub fn entry_from_proto(entry: IndexEntry) -> Option<types::IndexEntry> {
    let operation = operation_from_proto(entry.operation?)?;
    Some(types::IndexEntry {
        ordinal: entry.ordinal,
        source_remote: entry.source_remote,
        operation,
    })
}

pub fn filter_to_proto(filter: &types::RemoteFilter) -> RemoteFilter {
    RemoteFilter {
        document_id: filter.document_id.clone(),
        scope: filter.scope.clone(),
        branch: filter.branch.clone(),
    }
}

pub fn filter_from_proto(filter: RemoteFilter) -> types::RemoteFilter {
    types::RemoteFilter {
        document_id: filter.document_id,
        scope: filter.scope,
        branch: filter.branch,
    }
}

pub fn envelope_to_proto(envelope: &types::SyncEnvelope) -> Envelope {
    Envelope {
        key: envelope.key.clone(),
        depends_on: envelope.depends_on.clone(),
        channel_id: envelope.channel_id.clone(),
        document_id: envelope.document_id.clone(),
        scopes: envelope.scopes.clone(),
        branch: envelope.branch.clone(),
        operations: envelope.operations.iter().map(entry_to_proto).collect(),
    }
}

/// Returns None when any contained operation fails to decode
pub fn envelope_from_proto(envelope: Envelope) -> Option<types::SyncEnvelope> {
    let operations = envelope
        .operations
        .into_iter()
        .map(entry_from_proto)
        .collect::<Option<Vec<_>>>()?;
    Some(types::SyncEnvelope {
        key: envelope.key,
        depends_on: envelope.depends_on,
        channel_id: envelope.channel_id,
        document_id: envelope.document_id,
        scopes: envelope.scopes,
        branch: envelope.branch,
        operations,
    })
}
