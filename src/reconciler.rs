use crate::models::{Finding, FindingKey, FindingMutation, FindingStatus, MetricSnapshot};
use std::collections::HashMap;

/// Three-way branch for one key.
///
/// `open` must be the key's Unresolved finding, if any. Resolve wins over
/// Open; anything else is a no-op so a long-standing finding keeps its
/// original row and a compliant key with nothing open writes nothing.
pub fn decide(snapshot: &MetricSnapshot, open: Option<&Finding>, notes: &str) -> FindingMutation {
    match (open, snapshot.is_compliant) {
        (Some(finding), true) => FindingMutation::Resolve {
            finding_id: finding.id.clone(),
            key: snapshot.key.clone(),
            current_value: snapshot.current_value.to_string(),
        },
        (None, false) => FindingMutation::Open {
            key: snapshot.key.clone(),
            database_name: snapshot.database_name.clone(),
            current_value: snapshot.current_value.to_string(),
            recommended_value: snapshot.recommended_value.to_string(),
            notes: notes.to_string(),
        },
        _ => FindingMutation::NoOp {
            key: snapshot.key.clone(),
        },
    }
}

/// Plans mutations for a whole batch against a pre-state of open findings.
///
/// Keys that repeat inside the batch see the effect of earlier decisions,
/// so a batch never plans two opens for the same key.
pub fn reconcile<F>(
    snapshots: &[MetricSnapshot],
    existing: &HashMap<FindingKey, Finding>,
    mut notes_for: F,
) -> Vec<FindingMutation>
where
    F: FnMut(&MetricSnapshot) -> String,
{
    let mut view: HashMap<FindingKey, Option<Finding>> = HashMap::new();
    let mut mutations = Vec::with_capacity(snapshots.len());

    for snapshot in snapshots {
        let open = view
            .entry(snapshot.key.clone())
            .or_insert_with(|| {
                existing
                    .get(&snapshot.key)
                    .filter(|finding| finding.status == FindingStatus::Unresolved)
                    .cloned()
            })
            .clone();

        let notes = if snapshot.is_compliant { String::new() } else { notes_for(snapshot) };
        let mutation = decide(snapshot, open.as_ref(), &notes);

        match &mutation {
            FindingMutation::Resolve { .. } => {
                view.insert(snapshot.key.clone(), None);
            }
            FindingMutation::Open {
                key,
                database_name,
                current_value,
                recommended_value,
                notes,
            } => {
                view.insert(
                    key.clone(),
                    Some(Finding {
                        id: format!("planned:{}", key),
                        key: key.clone(),
                        database_name: database_name.clone(),
                        status: FindingStatus::Unresolved,
                        current_value: current_value.clone(),
                        recommended_value: recommended_value.clone(),
                        notes: notes.clone(),
                        opened_at: chrono::Utc::now(),
                        resolved_at: None,
                    }),
                );
            }
            FindingMutation::NoOp { .. } => {}
        }
        mutations.push(mutation);
    }

    mutations
}
