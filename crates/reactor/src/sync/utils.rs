use crate::types::{IndexEntry, RemoteFilter};

/// One consecutive run of operations for a single (document, scope) pair
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentBatch {
    pub document_id: String,
    pub scope: String,
    pub branch: String,
    pub operations: Vec<IndexEntry>,
}

/// Keep only entries a remote's filter matches
///
/// Empty filter axes match everything.
pub fn filter_operations(entries: Vec<IndexEntry>, filter: &RemoteFilter) -> Vec<IndexEntry> {
    entries
        .into_iter()
        .filter(|entry| filter.matches(&entry.operation))
        .collect()
}

/// Group entries into consecutive runs sharing (document_id, scope)
///
/// Order is preserved. A change of either key starts a new batch, and so
/// does returning to a key seen earlier; runs are never merged across
/// interleaving.
pub fn batch_operations_by_document(entries: Vec<IndexEntry>) -> Vec<DocumentBatch> {
    let mut batches: Vec<DocumentBatch> = Vec::new();

    for entry in entries {
        let same_run = batches.last().map(|batch| {
            batch.document_id == entry.operation.document_id
                && batch.scope == entry.operation.scope
        });

        match same_run {
            Some(true) => {
                batches.last_mut().unwrap().operations.push(entry);
            }
            _ => {
                batches.push(DocumentBatch {
                    document_id: entry.operation.document_id.clone(),
                    scope: entry.operation.scope.clone(),
                    branch: entry.operation.branch.clone(),
                    operations: vec![entry],
                });
            }
        }
    }

    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_support::test_entry;

    fn entry_with_scope(document_id: &str, scope: &str, ordinal: u64) -> crate::types::IndexEntry {
        let mut entry = test_entry(document_id, ordinal, ordinal, 100);
        entry.operation.scope = scope.to_string();
        entry
    }

    #[test]
    fn test_filter_with_empty_axes_passes_everything() {
        let entries = vec![test_entry("doc-1", 0, 1, 100), test_entry("doc-2", 0, 2, 100)];
        let filtered = filter_operations(entries.clone(), &RemoteFilter::default());
        assert_eq!(filtered, entries);
    }

    #[test]
    fn test_filter_narrows_by_document() {
        let entries = vec![test_entry("doc-1", 0, 1, 100), test_entry("doc-2", 0, 2, 100)];
        let filter = RemoteFilter {
            document_id: vec!["doc-2".to_string()],
            ..Default::default()
        };
        let filtered = filter_operations(entries, &filter);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].operation.document_id, "doc-2");
    }

    #[test]
    fn test_batching_groups_consecutive_runs() {
        let entries = vec![
            entry_with_scope("doc-1", "document", 1),
            entry_with_scope("doc-1", "document", 2),
            entry_with_scope("doc-2", "document", 3),
        ];

        let batches = batch_operations_by_document(entries);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].document_id, "doc-1");
        assert_eq!(batches[0].operations.len(), 2);
        assert_eq!(batches[1].document_id, "doc-2");
    }

    #[test]
    fn test_batching_splits_on_scope_change() {
        let entries = vec![
            entry_with_scope("doc-1", "document", 1),
            entry_with_scope("doc-1", "global", 2),
        ];

        let batches = batch_operations_by_document(entries);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].scope, "document");
        assert_eq!(batches[1].scope, "global");
    }

    #[test]
    fn test_batching_does_not_merge_across_interleaving() {
        // Returning to doc-1 after doc-2 starts a fresh batch
        let entries = vec![
            entry_with_scope("doc-1", "document", 1),
            entry_with_scope("doc-2", "document", 2),
            entry_with_scope("doc-1", "document", 3),
        ];

        let batches = batch_operations_by_document(entries);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].document_id, "doc-1");
        assert_eq!(batches[1].document_id, "doc-2");
        assert_eq!(batches[2].document_id, "doc-1");
        assert_eq!(batches[2].operations[0].ordinal, 3);
    }

    #[test]
    fn test_batching_empty_input() {
        assert!(batch_operations_by_document(Vec::new()).is_empty());
    }
}
