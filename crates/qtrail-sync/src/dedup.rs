use std::collections::HashMap;

use qtrail_core::QueryExecutionRecord;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupOutput {
    /// One record per execution id, ordered by `(start_time, execution_id)`.
    pub records: Vec<QueryExecutionRecord>,
    /// Deliveries folded into an earlier record.
    pub duplicate_count: usize,
    pub ambiguous_count: usize,
}

/// Collapses repeated deliveries of the same execution.
///
/// Within a group the first non-absent value wins for every field except `end_time`, which
/// takes the latest value seen. Disagreeing usernames mark the record ambiguous and keep all
/// candidates in first-seen order.
pub fn dedup(records: impl IntoIterator<Item = QueryExecutionRecord>) -> DedupOutput {
    let mut merged: Vec<QueryExecutionRecord> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut duplicate_count = 0;

    for record in records {
        match index.get(&record.execution_id) {
            Some(&slot) => {
                duplicate_count += 1;
                merge_into(&mut merged[slot], record);
            }
            None => {
                index.insert(record.execution_id.clone(), merged.len());
                let mut first = record;
                first.candidate_usernames = vec![first.username.clone()];
                merged.push(first);
            }
        }
    }

    let mut ambiguous_count = 0;
    for record in &mut merged {
        record.ambiguous = record.candidate_usernames.len() > 1;
        if record.ambiguous {
            ambiguous_count += 1;
        } else {
            record.candidate_usernames.clear();
        }
    }

    merged.sort_by(|a, b| {
        a.start_time
            .cmp(&b.start_time)
            .then_with(|| a.execution_id.cmp(&b.execution_id))
    });

    DedupOutput {
        records: merged,
        duplicate_count,
        ambiguous_count,
    }
}

fn merge_into(target: &mut QueryExecutionRecord, other: QueryExecutionRecord) {
    if !target.candidate_usernames.contains(&other.username) {
        target.candidate_usernames.push(other.username);
    }
    if target.workgroup.is_none() {
        target.workgroup = other.workgroup;
    }
    if target.query_text.is_none() {
        target.query_text = other.query_text;
    }
    target.end_time = match (target.end_time, other.end_time) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    target.duplicate_event_ids.push(other.source_event_id);
}
